//! Error types for the link core.
//!
//! Construction-time misconfiguration is fatal and surfaces as an error
//! here. Malformed wire data never does: bad headers and payloads are scored
//! into receiver statistics and dropped in place (see the ARQ module).

use thiserror::Error;

/// Result type alias for link-core operations.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors that can occur while building or driving the link core.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Configuration rejected at construction
    #[error("configuration error: {0}")]
    Config(String),

    /// MCS table and EVM threshold table lengths differ
    #[error("EVM threshold table has {thresholds} entries but MCS table has {mcs}")]
    EvmTableMismatch { thresholds: usize, mcs: usize },

    /// A timed transport operation missed its deadline
    #[error("transport burst late: {0}")]
    TransportLate(String),

    /// The transport stream failed outright
    #[error("transport stream error: {0}")]
    TransportStream(String),

    /// The component has been shut down
    #[error("link core stopped")]
    Stopped,
}

impl LinkError {
    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        LinkError::Config(msg.into())
    }

    /// True if the MAC loop should restart after this error rather than exit.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LinkError::TransportLate(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = LinkError::EvmTableMismatch { thresholds: 3, mcs: 4 };
        assert_eq!(
            err.to_string(),
            "EVM threshold table has 3 entries but MCS table has 4"
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(LinkError::TransportLate("tx".into()).is_recoverable());
        assert!(!LinkError::Stopped.is_recoverable());
    }
}
