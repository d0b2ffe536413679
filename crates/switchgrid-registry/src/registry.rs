//! The Registry: controller id → cached processor, with the single-flight
//! resolve/invalidate/persist protocol keyed on the stored version stamp.
//!
//! One exclusive lock spans the whole submit sequence, so at most one
//! controller operation runs registry-wide at any instant. That trades
//! throughput for immunity to cache-invalidation races.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use switchgrid_core::error::{GridError, Result};
use switchgrid_core::model::{Controller, ProcessorConfig, version_stamp};
use switchgrid_store::{KeyValue, KvStore};

use crate::driver::PinDriver;
use crate::processor::{Processor, build_processor};

/// Key prefix for persisted processor configs.
pub const CONTROLLER_KEY_PREFIX: &str = "controller/";

/// Controller registry.
pub struct Registry {
    store: Arc<KvStore>,
    driver: Arc<dyn PinDriver>,
    processors: Mutex<HashMap<String, Arc<dyn Processor>>>,
}

impl Registry {
    pub fn new(store: Arc<KvStore>, driver: Arc<dyn PinDriver>) -> Arc<Self> {
        Arc::new(Self {
            store,
            driver,
            processors: Mutex::new(HashMap::new()),
        })
    }

    fn load_config(&self, controller_id: &str) -> Result<ProcessorConfig> {
        let key = format!("{CONTROLLER_KEY_PREFIX}{controller_id}");
        let value = self
            .store
            .get(&key)?
            .ok_or_else(|| GridError::NotFound(format!("unrecognized controller {controller_id}")))?;
        let mut config: ProcessorConfig = serde_json::from_str(&value)
            .map_err(|e| GridError::BadRequest(format!("decode config for {controller_id}: {e}")))?;
        // The record is keyed by id; the embedded snapshot follows the key.
        if let Some(controller) = &mut config.controller {
            controller.id = controller_id.to_string();
        }
        Ok(config)
    }

    /// Persist a config with a fresh nonzero version stamp. The stamp goes
    /// into the struct before serialization so the stamped bytes are what
    /// reach disk — stamping and data change are one write.
    fn store_config(&self, controller_id: &str, mut config: ProcessorConfig) -> Result<()> {
        let key = format!("{CONTROLLER_KEY_PREFIX}{controller_id}");
        config.version = version_stamp();
        let value = serde_json::to_string(&config)
            .map_err(|e| GridError::Internal(format!("encode config for {controller_id}: {e}")))?;
        self.store.set(&KeyValue::new(&key, &value))?;
        Ok(())
    }

    /// Resolve `controller_id` to a processor and run `callback` on it,
    /// all under the registry lock.
    ///
    /// A cached processor is revalidated against the stored config: version
    /// 0 means someone wrote the record behind our back, so the cached
    /// processor is closed, rebuilt, primed with one read-back sync, and the
    /// refreshed config is persisted (which stamps a fresh version). The
    /// callback returns `(value, dirty)`; dirty persists the processor's
    /// current config.
    pub async fn submit<T, F, Fut>(&self, controller_id: &str, callback: F) -> Result<T>
    where
        F: FnOnce(String, Arc<dyn Processor>) -> Fut,
        Fut: Future<Output = Result<(T, bool)>> + Send,
    {
        let mut processors = self.processors.lock().await;
        let processor = match processors.get(controller_id).cloned() {
            Some(existing) => {
                let config = match self.load_config(controller_id) {
                    Ok(config) => config,
                    Err(e) => {
                        // The record vanished or went bad: the cached
                        // processor no longer has a source of truth.
                        existing.close().await;
                        processors.remove(controller_id);
                        return Err(e);
                    }
                };
                if config.version == 0 {
                    tracing::info!("Controller {controller_id} changed externally, rebuilding processor");
                    existing.close().await;
                    processors.remove(controller_id);
                    let processor = build_processor(config.clone(), self.driver.clone()).await?;
                    processors.insert(controller_id.to_string(), processor.clone());
                    let mut config = config;
                    if config.controller.is_some() {
                        // Read current hardware state into the snapshot.
                        match processor.sync_controller(&Controller::shell(controller_id)).await {
                            Ok(actual) => config.controller = Some(actual),
                            Err(e) => tracing::error!(
                                "Read-back sync for controller {controller_id} failed: {e}"
                            ),
                        }
                    }
                    self.store_config(controller_id, config)?;
                    processor
                } else {
                    existing
                }
            }
            None => {
                let config = self.load_config(controller_id)?;
                let processor = build_processor(config, self.driver.clone()).await?;
                processors.insert(controller_id.to_string(), processor.clone());
                processor
            }
        };
        let (value, dirty) = callback(controller_id.to_string(), processor.clone()).await?;
        if dirty {
            self.store_config(controller_id, processor.config().await)?;
        }
        Ok(value)
    }

    /// Snapshot of one controller.
    pub async fn get_controller(&self, controller_id: &str) -> Result<Controller> {
        self.submit(controller_id, |id, processor| async move {
            let controller = processor.get_controller(&id).await?;
            Ok((controller, false))
        })
        .await
    }

    /// Drive a controller toward the given state and persist the result.
    pub async fn update_controller(&self, controller: Controller) -> Result<Controller> {
        if controller.id.is_empty() {
            return Err(GridError::BadRequest("invalid controller ID".into()));
        }
        let controller_id = controller.id.clone();
        self.submit(&controller_id, move |_, processor| async move {
            let actual = processor.sync_controller(&controller).await?;
            Ok((actual, true))
        })
        .await
    }

    /// All known controllers, failing fast on the first bad one.
    pub async fn list_controllers(&self) -> Result<Vec<Controller>> {
        let keys = self.store.keys_with_prefix(CONTROLLER_KEY_PREFIX)?;
        let mut controllers = Vec::with_capacity(keys.len());
        for key in keys {
            let controller_id = key.trim_start_matches(CONTROLLER_KEY_PREFIX);
            controllers.push(self.get_controller(controller_id).await?);
        }
        Ok(controllers)
    }

    /// Close and drop every cached processor.
    pub async fn close(&self) {
        let mut processors = self.processors.lock().await;
        for (controller_id, processor) in processors.drain() {
            tracing::info!("Closing processor for controller {controller_id}");
            processor.close().await;
        }
    }
}
