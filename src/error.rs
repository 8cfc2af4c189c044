use thiserror::Error;

/// Errors surfaced synchronously by the engine and its input parsers.
///
/// Network failures of individual probes are never reported here; they are
/// carried inside [`ProbeResult`](crate::types::ProbeResult) instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("invalid address spec {spec:?}: {reason}")]
    InvalidAddressSpec { spec: String, reason: String },
    #[error("invalid port range {start}-{end}")]
    InvalidPortRange { start: u32, end: u32 },
    #[error("invalid engine config: {0}")]
    InvalidConfig(&'static str),
    #[error("engine must be created inside a Tokio runtime")]
    NoRuntime,
}
