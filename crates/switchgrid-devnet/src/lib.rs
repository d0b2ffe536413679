//! # Switchgrid Devnet
//!
//! TCP transport between the master node and its satellites. Satellites dial
//! in, identify themselves with a numeric id, and then answer newline-framed
//! text commands (`SET <pin> <0|1>`, `GET <pin>`).

pub mod server;

pub use server::{EventServer, OnConnect};
