//! # Switchgrid — networked binary pin controller
//!
//! One binary, two roles:
//!   switchgrid serve                      # Run the node: gateway + device port + scheduler
//!   switchgrid controller list            # CLI client against a running node
//!   switchgrid controller set-pin x 4 on
//!   switchgrid store set timer/morning '{"time":"2026-09-01T07:00:00Z"}'

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use switchgrid_core::config::GridConfig;
use switchgrid_core::model::{Controller, PinValue, ProcessorConfig};
use switchgrid_core::shutdown::ShutdownHooks;
use switchgrid_registry::{MemoryPinDriver, Registry};
use switchgrid_scheduler::{Scheduler, SchedulerOptions, TIMER_KEY_PREFIX};
use switchgrid_store::KvStore;

#[derive(Parser)]
#[command(name = "switchgrid", version, about = "🔌 Switchgrid — networked binary pin controller")]
struct Cli {
    /// Config file path (default: ~/.switchgrid/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the switchgrid node
    Serve,
    /// Inspect and drive controllers on a running node
    Controller {
        #[command(subcommand)]
        command: ControllerCommand,
    },
    /// Raw key-value store access on a running node
    Store {
        #[command(subcommand)]
        command: StoreCommand,
    },
}

#[derive(Subcommand)]
enum ControllerCommand {
    /// List all controllers
    List,
    /// Show one controller's pin state
    Get { id: String },
    /// Seed a new controller record
    Create {
        id: String,
        /// Display name
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Drive one pin high or low
    SetPin {
        id: String,
        /// Pin address (client_id * 100 + local pin)
        pin: u32,
        /// on/off, high/low, 1/0
        value: String,
    },
}

#[derive(Subcommand)]
enum StoreCommand {
    /// List keys, optionally by prefix
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Read one key
    Get { key: String },
    /// Write one key
    Set { key: String, value: String },
    /// Delete one key
    Delete { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "switchgrid=debug,tower_http=debug"
    } else {
        "switchgrid=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => GridConfig::load_from(std::path::Path::new(path))?,
        None => GridConfig::load()?,
    };

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Controller { command } => {
            let client = ApiClient::new(&config);
            client.controller(command).await
        }
        Command::Store { command } => {
            let client = ApiClient::new(&config);
            client.store(command).await
        }
    }
}

/// Run the full node until Ctrl-C.
async fn serve(config: GridConfig) -> Result<()> {
    let store_path = config.store.resolved_path();
    let store = Arc::new(KvStore::open(&store_path)?);
    tracing::info!("💾 Store opened: {}", store_path.display());

    let driver = Arc::new(MemoryPinDriver::new());
    let registry = Registry::new(store.clone(), driver);

    // Timer events carry a desired controller state as their payload;
    // firing one is the same as a PUT against that controller.
    let registry_for_events = registry.clone();
    let scheduler = Scheduler::start(
        store.clone(),
        Arc::new(move |id, data| {
            let registry = registry_for_events.clone();
            Box::pin(async move {
                let controller: Controller = serde_json::from_value(serde_json::Value::Object(data))?;
                tracing::info!("⏰ Event {id} driving controller {}", controller.id);
                registry.update_controller(controller).await?;
                Ok(())
            })
        }),
        SchedulerOptions {
            scan_interval: std::time::Duration::from_secs(config.scheduler.scan_secs),
            window: std::time::Duration::from_secs(config.scheduler.window_secs),
        },
    );

    let hooks = ShutdownHooks::new();
    let registry_for_shutdown = registry.clone();
    hooks.register("registry", move || async move {
        registry_for_shutdown.close().await;
    });
    let scheduler_for_shutdown = scheduler.clone();
    hooks.register("scheduler", move || async move {
        scheduler_for_shutdown.stop();
    });

    println!("🔌 Switchgrid v{}", env!("CARGO_PKG_VERSION"));
    println!("   🌐 Gateway:  http://{}:{}", config.gateway.host, config.gateway.port);
    println!("   🗄️  Store:    {}", store_path.display());
    println!();

    tokio::select! {
        result = switchgrid_gateway::start(&config.gateway, registry, store) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("🔻 Ctrl-C received, shutting down");
        }
    }
    hooks.run().await;
    Ok(())
}

/// Thin HTTP client for the CLI subcommands.
struct ApiClient {
    client: reqwest::Client,
    base: String,
    api_key: String,
    device: switchgrid_core::config::DeviceConfig,
}

impl ApiClient {
    fn new(config: &GridConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: format!("http://{}:{}", config.gateway.host, config.gateway.port),
            api_key: config.gateway.api_key.clone(),
            device: config.device.clone(),
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut request = self
            .client
            .request(method, format!("{}{}", self.base, path))
            .header("Authorization", &self.api_key);
        if let Some(json) = body {
            request = request.json(&json);
        }
        let response = request.send().await?;
        let status = response.status();
        let value: serde_json::Value = response.json().await?;
        if !status.is_success() {
            anyhow::bail!(
                "{} {path}: {}",
                status.as_u16(),
                value["message"].as_str().unwrap_or("request failed")
            );
        }
        Ok(value)
    }

    async fn controller(&self, command: ControllerCommand) -> Result<()> {
        match command {
            ControllerCommand::List => {
                let value = self.request(reqwest::Method::GET, "/api/controllers", None).await?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            ControllerCommand::Get { id } => {
                let value = self
                    .request(reqwest::Method::GET, &format!("/api/controllers/{id}"), None)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            ControllerCommand::Create { id, name } => {
                let mut controller = Controller::shell(&id);
                controller.name = name;
                // Seeded with version 0 so the node re-registers it on next use
                let config = ProcessorConfig {
                    host: self.device.host.clone(),
                    port: self.device.port,
                    api_key: String::new(),
                    controller: Some(controller),
                    version: 0,
                };
                self.request(
                    reqwest::Method::PUT,
                    &format!("/api/store/keys/controller/{id}"),
                    Some(serde_json::json!({"value": serde_json::to_string(&config)?})),
                )
                .await?;
                println!("✅ Controller {id} created");
            }
            ControllerCommand::SetPin { id, pin, value } => {
                let wanted = parse_pin_value(&value)?;
                let current = self
                    .request(reqwest::Method::GET, &format!("/api/controllers/{id}"), None)
                    .await?;
                let mut controller: Controller = serde_json::from_value(current)?;
                let Some(target) = controller.pins.iter_mut().find(|p| p.id == pin) else {
                    anyhow::bail!("controller {id} has no pin {pin}");
                };
                target.value = wanted;
                let reached = self
                    .request(
                        reqwest::Method::PUT,
                        &format!("/api/controllers/{id}"),
                        Some(serde_json::to_value(&controller)?),
                    )
                    .await?;
                let reached: Controller = serde_json::from_value(reached)?;
                match reached.pins.iter().find(|p| p.id == pin) {
                    Some(p) if p.value == wanted => println!("✅ Pin {pin} → {:?}", p.value),
                    Some(p) => println!("⚠️ Pin {pin} stayed {:?}", p.value),
                    None => println!("⚠️ Pin {pin} missing from reply"),
                }
            }
        }
        Ok(())
    }

    async fn store(&self, command: StoreCommand) -> Result<()> {
        match command {
            StoreCommand::List { prefix } => {
                let value = self
                    .request(
                        reqwest::Method::GET,
                        &format!("/api/store/keys?prefix={prefix}"),
                        None,
                    )
                    .await?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            StoreCommand::Get { key } => {
                let value = self
                    .request(reqwest::Method::GET, &format!("/api/store/keys/{key}"), None)
                    .await?;
                println!("{}", value["value"].as_str().unwrap_or(""));
            }
            StoreCommand::Set { key, value } => {
                self.request(
                    reqwest::Method::PUT,
                    &format!("/api/store/keys/{key}"),
                    Some(serde_json::json!({"value": value})),
                )
                .await?;
                println!("✅ {key} written");
                if key.starts_with(TIMER_KEY_PREFIX) {
                    println!("   ⏰ Picked up on the node's next timer scan");
                }
            }
            StoreCommand::Delete { key } => {
                self.request(reqwest::Method::DELETE, &format!("/api/store/keys/{key}"), None)
                    .await?;
                println!("✅ {key} deleted");
            }
        }
        Ok(())
    }
}

fn parse_pin_value(raw: &str) -> Result<PinValue> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "on" | "high" | "true" => Ok(PinValue::High),
        "0" | "off" | "low" | "false" => Ok(PinValue::Low),
        other => anyhow::bail!("unrecognized pin value '{other}' (use on/off, high/low, 1/0)"),
    }
}
