//! Error handling for svcmesh
//!
//! Provides a unified error type and result type used across all svcmesh
//! components. Transient network and decode failures are the normal case in a
//! lossy cluster; protocol loops log and swallow them, while configuration and
//! lifecycle errors are surfaced to the caller.

/// Result type alias for svcmesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for svcmesh
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or malformed configuration; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bind/listen/connect/send/receive failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// No seed reachable while joining a cluster
    #[error("Join error: {0}")]
    Join(String),

    /// Malformed frame or oversized meta; dropped by protocol loops
    #[error("Decode error: {0}")]
    Decode(String),

    /// Operation on a registry that was never started or already shut down
    #[error("State error: {0}")]
    State(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a join error
    pub fn join(msg: impl Into<String>) -> Self {
        Self::Join(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Whether the protocol loops should swallow this error rather than
    /// surface it to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Decode(_) | Error::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::config("no service name");
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.to_string(), "Configuration error: no service name");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::transport("send failed").is_transient());
        assert!(Error::decode("bad frame").is_transient());
        assert!(!Error::config("missing").is_transient());
        assert!(!Error::state("shut down").is_transient());
        assert!(!Error::join("no seeds").is_transient());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_transient());
    }
}
