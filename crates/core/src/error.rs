//! Scanner error types.

use thiserror::Error;
use uuid::Uuid;

/// Identifier of one scan cycle (UUID v4).
pub type ScanId = Uuid;

/// Conditions that prevent a scan report from being produced.
///
/// Per-candidate and per-venue failures are not errors; they are folded into
/// protocol coverage and missing quotes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScanError {
    /// Invalid or missing configuration. Raised before any work starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The cycle was aborted by the operator.
    #[error("scan cycle canceled")]
    CycleCanceled,

    /// The service has not been started, or has been stopped.
    #[error("scanner is not running")]
    NotRunning,

    /// Another cycle is still in flight.
    #[error("scan {0} is already in progress")]
    Busy(ScanId),
}

impl ScanError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

impl From<anyhow::Error> for ScanError {
    fn from(err: anyhow::Error) -> Self {
        Self::Configuration(format!("{:#}", err))
    }
}
