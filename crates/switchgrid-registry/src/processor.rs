//! Processors: the polymorphic handler behind every controller id.
//!
//! Local drives pins directly (client id 0) or forwards text commands to
//! satellites over the EventServer; Remote proxies both operations to a peer
//! switchgrid gateway.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::Mutex;

use switchgrid_core::error::{GridError, Result};
use switchgrid_core::model::{Controller, Pin, PinMode, PinValue, ProcessorConfig, resolve_pin};
use switchgrid_devnet::{EventServer, OnConnect};

use crate::driver::PinDriver;

/// Uniform capability surface for Local and Remote processors.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Snapshot of the bound controller.
    async fn get_controller(&self, controller_id: &str) -> Result<Controller>;
    /// Drive the controller toward `desired`; returns the resulting state.
    async fn sync_controller(&self, desired: &Controller) -> Result<Controller>;
    /// Current config, with the live controller state embedded for Local.
    async fn config(&self) -> ProcessorConfig;
    async fn close(&self);
}

/// Construct the right processor for a persisted config: Local when it
/// embeds a controller, Remote otherwise.
pub async fn build_processor(
    config: ProcessorConfig,
    driver: Arc<dyn PinDriver>,
) -> Result<Arc<dyn Processor>> {
    if config.controller.is_some() {
        Ok(LocalProcessor::spawn(config, driver).await? as Arc<dyn Processor>)
    } else {
        Ok(Arc::new(RemoteProcessor::new(config)) as Arc<dyn Processor>)
    }
}

fn set_command(pin: u32, value: PinValue) -> String {
    let level = if value == PinValue::High { 1 } else { 0 };
    format!("SET {pin} {level}")
}

fn get_command(pin: u32) -> String {
    format!("GET {pin}")
}

fn parse_reply(reply: &str) -> PinValue {
    if reply == "TRUE" { PinValue::High } else { PinValue::Low }
}

/// Processor for a controller whose pins this node owns, directly or via
/// connected satellites.
pub struct LocalProcessor {
    host: String,
    port: u16,
    api_key: String,
    controller: Mutex<Controller>,
    driver: Arc<dyn PinDriver>,
    event_server: OnceLock<Arc<EventServer>>,
}

impl LocalProcessor {
    /// Build the processor and, when the config carries a device endpoint,
    /// start its EventServer. A reconnecting satellite gets the stored
    /// state pushed back through the connect callback.
    pub async fn spawn(
        config: ProcessorConfig,
        driver: Arc<dyn PinDriver>,
    ) -> Result<Arc<Self>> {
        let controller = config.controller.ok_or_else(|| {
            GridError::BadRequest("local processor requires an embedded controller".into())
        })?;
        let processor = Arc::new(Self {
            host: config.host,
            port: config.port,
            api_key: config.api_key,
            controller: Mutex::new(controller),
            driver,
            event_server: OnceLock::new(),
        });
        if !processor.host.is_empty() {
            let weak = Arc::downgrade(&processor);
            let on_connect: OnConnect = Arc::new(move |client_id| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(processor) = weak.upgrade() else {
                        return Ok(());
                    };
                    let desired = { processor.controller.lock().await.clone() };
                    processor.sync_controller(&desired).await?;
                    tracing::info!("Re-synced stored state to reconnecting client {client_id}");
                    Ok(())
                })
            });
            let server =
                EventServer::bind(&processor.host, processor.port, Some(on_connect)).await?;
            let _ = processor.event_server.set(server);
        }
        Ok(processor)
    }

    /// Address of the embedded EventServer, if one was started.
    pub fn device_addr(&self) -> Option<SocketAddr> {
        self.event_server.get().map(|s| s.local_addr())
    }

    fn device(&self, client_id: u32) -> Result<&Arc<EventServer>> {
        self.event_server.get().ok_or_else(|| {
            GridError::Unreachable(format!("no device transport configured for client {client_id}"))
        })
    }

    async fn write_client_pin(&self, client_id: u32, pin: u32, value: PinValue) -> Result<PinValue> {
        let reply = self.device(client_id)?.send(client_id, &set_command(pin, value)).await?;
        Ok(parse_reply(&reply))
    }

    async fn read_client_pin(&self, client_id: u32, pin: u32) -> Result<PinValue> {
        let reply = self.device(client_id)?.send(client_id, &get_command(pin)).await?;
        Ok(parse_reply(&reply))
    }
}

#[async_trait]
impl Processor for LocalProcessor {
    async fn get_controller(&self, controller_id: &str) -> Result<Controller> {
        let controller = self.controller.lock().await;
        if controller.id != controller_id {
            return Err(GridError::BadRequest(format!(
                "invalid controller ID {controller_id} received by local processor"
            )));
        }
        Ok(controller.clone())
    }

    /// Walk every stored pin. Pins named in `desired` are driven (outputs)
    /// or read (inputs); pins absent from `desired` are read back so the
    /// returned snapshot reflects current hardware. One pin's failure is
    /// logged and its prior value retained; the rest still run.
    async fn sync_controller(&self, desired: &Controller) -> Result<Controller> {
        let mut controller = self.controller.lock().await;
        let desired_pins: HashMap<u32, &Pin> =
            desired.pins.iter().map(|pin| (pin.id, pin)).collect();
        let controller_id = controller.id.clone();
        for pin in controller.pins.iter_mut() {
            let (client_id, local_pin) = resolve_pin(pin.id);
            let wanted = desired_pins.get(&pin.id);
            if client_id > 0 {
                let result = match wanted {
                    Some(input) if pin.mode == PinMode::Output => {
                        self.write_client_pin(client_id, local_pin, input.value).await
                    }
                    _ => self.read_client_pin(client_id, local_pin).await,
                };
                match result {
                    Ok(value) => pin.value = value,
                    Err(e) => tracing::error!(
                        "Pin {local_pin} on client {client_id} failed for controller {controller_id}: {e}"
                    ),
                }
                continue;
            }
            match wanted {
                Some(input) if pin.mode == PinMode::Output => {
                    tracing::info!(
                        "Setting pin {local_pin} for controller {controller_id} to {:?}",
                        input.value
                    );
                    match self.driver.write(local_pin, input.value) {
                        Ok(()) => pin.value = input.value,
                        Err(e) => tracing::error!(
                            "Pin {local_pin} write failed for controller {controller_id}: {e}"
                        ),
                    }
                }
                _ => match self.driver.read(local_pin) {
                    Ok(value) => pin.value = value,
                    Err(e) => tracing::error!(
                        "Pin {local_pin} read failed for controller {controller_id}: {e}"
                    ),
                },
            }
        }
        Ok(controller.clone())
    }

    async fn config(&self) -> ProcessorConfig {
        ProcessorConfig {
            host: self.host.clone(),
            port: self.port,
            api_key: self.api_key.clone(),
            controller: Some(self.controller.lock().await.clone()),
            version: 0,
        }
    }

    async fn close(&self) {
        if let Some(server) = self.event_server.get() {
            server.close().await;
        }
    }
}

/// Processor proxying to a peer switchgrid instance's HTTP API.
pub struct RemoteProcessor {
    client: reqwest::Client,
    host: String,
    port: u16,
    api_key: String,
}

impl RemoteProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: config.host,
            port: config.port,
            api_key: config.api_key,
        }
    }

    fn controller_url(&self, controller_id: &str) -> String {
        format!("http://{}:{}/api/controllers/{controller_id}", self.host, self.port)
    }

    async fn decode(&self, response: reqwest::Response) -> Result<Controller> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GridError::Remote(format!("peer returned {status}: {body}")));
        }
        response
            .json::<Controller>()
            .await
            .map_err(|e| GridError::Remote(format!("decode peer response: {e}")))
    }
}

#[async_trait]
impl Processor for RemoteProcessor {
    async fn get_controller(&self, controller_id: &str) -> Result<Controller> {
        let response = self
            .client
            .get(self.controller_url(controller_id))
            .header("Authorization", &self.api_key)
            .send()
            .await
            .map_err(|e| GridError::Remote(e.to_string()))?;
        self.decode(response).await
    }

    async fn sync_controller(&self, desired: &Controller) -> Result<Controller> {
        let response = self
            .client
            .put(self.controller_url(&desired.id))
            .header("Authorization", &self.api_key)
            .json(desired)
            .send()
            .await
            .map_err(|e| GridError::Remote(e.to_string()))?;
        self.decode(response).await
    }

    async fn config(&self) -> ProcessorConfig {
        ProcessorConfig {
            host: self.host.clone(),
            port: self.port,
            api_key: self.api_key.clone(),
            controller: None,
            version: 0,
        }
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryPinDriver;

    fn local_config(pins: Vec<Pin>) -> ProcessorConfig {
        ProcessorConfig {
            host: String::new(),
            port: 0,
            api_key: String::new(),
            controller: Some(Controller {
                id: "c1".into(),
                name: "test".into(),
                description: String::new(),
                pins,
            }),
            version: 1,
        }
    }

    fn output_pin(id: u32) -> Pin {
        Pin { id, mode: PinMode::Output, value: PinValue::Low }
    }

    #[tokio::test]
    async fn test_commands() {
        assert_eq!(set_command(5, PinValue::High), "SET 5 1");
        assert_eq!(set_command(5, PinValue::Low), "SET 5 0");
        assert_eq!(get_command(7), "GET 7");
        assert_eq!(parse_reply("TRUE"), PinValue::High);
        assert_eq!(parse_reply("FALSE"), PinValue::Low);
        assert_eq!(parse_reply(""), PinValue::Low);
    }

    #[tokio::test]
    async fn test_local_drives_output_pin() {
        let driver = Arc::new(MemoryPinDriver::new());
        let processor = LocalProcessor::spawn(local_config(vec![output_pin(5)]), driver.clone())
            .await
            .unwrap();

        let mut desired = Controller::shell("c1");
        desired.pins.push(Pin { id: 5, mode: PinMode::Output, value: PinValue::High });
        let actual = processor.sync_controller(&desired).await.unwrap();

        assert_eq!(actual.pins[0].value, PinValue::High);
        assert_eq!(driver.get(5), PinValue::High);
    }

    #[tokio::test]
    async fn test_local_reads_back_unlisted_pins() {
        let driver = Arc::new(MemoryPinDriver::new());
        driver.write(6, PinValue::High).unwrap();
        let processor = LocalProcessor::spawn(
            local_config(vec![output_pin(5), Pin { id: 6, mode: PinMode::Input, value: PinValue::Low }]),
            driver,
        )
        .await
        .unwrap();

        // Empty desired set: everything is read back, nothing driven.
        let actual = processor.sync_controller(&Controller::shell("c1")).await.unwrap();
        assert_eq!(actual.pins[0].value, PinValue::Low);
        assert_eq!(actual.pins[1].value, PinValue::High);
    }

    #[tokio::test]
    async fn test_local_rejects_foreign_controller_id() {
        let driver = Arc::new(MemoryPinDriver::new());
        let processor = LocalProcessor::spawn(local_config(vec![output_pin(5)]), driver)
            .await
            .unwrap();
        assert!(processor.get_controller("c1").await.is_ok());
        let err = processor.get_controller("other").await.unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_satellite_pin_failure_retains_prior_value() {
        // Pin 205 targets client 2, but no device transport is configured;
        // the sync must log, keep the old value, and still succeed.
        let driver = Arc::new(MemoryPinDriver::new());
        let mut pins = vec![output_pin(5)];
        pins.push(Pin { id: 205, mode: PinMode::Output, value: PinValue::High });
        let processor = LocalProcessor::spawn(local_config(pins), driver).await.unwrap();

        let mut desired = Controller::shell("c1");
        desired.pins.push(Pin { id: 5, mode: PinMode::Output, value: PinValue::High });
        desired.pins.push(Pin { id: 205, mode: PinMode::Output, value: PinValue::Low });
        let actual = processor.sync_controller(&desired).await.unwrap();

        assert_eq!(actual.pins[0].value, PinValue::High);
        // Pin 205 kept its prior value
        assert_eq!(actual.pins[1].value, PinValue::High);
    }

    #[tokio::test]
    async fn test_config_snapshot_carries_live_state() {
        let driver = Arc::new(MemoryPinDriver::new());
        let processor = LocalProcessor::spawn(local_config(vec![output_pin(5)]), driver)
            .await
            .unwrap();
        let mut desired = Controller::shell("c1");
        desired.pins.push(Pin { id: 5, mode: PinMode::Output, value: PinValue::High });
        processor.sync_controller(&desired).await.unwrap();

        let config = processor.config().await;
        assert_eq!(config.controller.unwrap().pins[0].value, PinValue::High);
    }
}
