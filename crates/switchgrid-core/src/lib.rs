//! # Switchgrid Core
//!
//! Shared foundation for the switchgrid workspace: the controller/pin data
//! model, the typed error surface, TOML configuration, and the shutdown
//! hook list threaded through every long-lived component.

pub mod config;
pub mod error;
pub mod model;
pub mod shutdown;

pub use config::GridConfig;
pub use error::{GridError, Result};
pub use model::{Controller, Pin, PinMode, PinValue, ProcessorConfig};
pub use shutdown::ShutdownHooks;
