//! # Switchgrid Registry
//!
//! The cached Processor abstraction and the Registry that resolves
//! controller ids to processors. A Local processor drives hardware through a
//! [`driver::PinDriver`] and satellites through the devnet EventServer; a
//! Remote processor proxies to a peer switchgrid instance over HTTP.

pub mod driver;
pub mod processor;
pub mod registry;

pub use driver::{MemoryPinDriver, PinDriver};
pub use processor::{LocalProcessor, Processor, RemoteProcessor, build_processor};
pub use registry::{CONTROLLER_KEY_PREFIX, Registry};
