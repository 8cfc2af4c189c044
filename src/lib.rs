//! Library crate for portsweep: a bounded worker pool that probes TCP
//! endpoints and streams results to a pluggable [`report::Reporter`].
pub mod address;
pub mod engine;
pub mod error;
pub mod probe;
pub mod report;
pub mod server;
pub mod services;
pub mod types;

pub use address::AddressSpec;
pub use engine::{Engine, EngineConfig, StopHandle};
pub use error::ScanError;
pub use report::Reporter;
pub use types::{PortRange, ProbeFailure, ProbeResult, ScanSummary, ScanTarget};
