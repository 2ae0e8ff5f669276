//! Common error types for cpu-miner.
//!
//! This module provides a centralized Error enum using thiserror, with
//! conversions from underlying error types used throughout the crate. The
//! variants follow the failure taxonomy the orchestration core reacts to:
//! transport and protocol faults drive reconnection, allocation problems
//! degrade but never stop mining, and configuration problems are fatal at
//! startup.

use thiserror::Error;

/// Main error type for cpu-miner operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connect, read or write failure on a pool connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected message, or an error response from the pool
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The pool refused our credentials
    #[error("Authorization rejected: {0}")]
    AuthorizationRejected(String),

    /// A bounded step (connect, subscribe, authorize, keep-alive) took too long
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// The pool closed the connection
    #[error("Connection closed by pool")]
    Disconnected,

    /// Scratch memory could not be allocated at all
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// Internal channel closed (the receiving task is gone)
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl Error {
    /// Whether this failure was a credential rejection.
    ///
    /// Credential failures escalate reconnect backoff faster than transient
    /// network faults.
    pub fn is_credential(&self) -> bool {
        matches!(self, Error::AuthorizationRejected(_))
    }

    /// Whether this failure came from the network rather than the protocol.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Transport(_) | Error::Timeout(_) | Error::Disconnected
        )
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_failures_are_distinguished() {
        assert!(Error::AuthorizationRejected("bad wallet".into()).is_credential());
        assert!(!Error::Protocol("bad json".into()).is_credential());
        assert!(!Error::Disconnected.is_credential());
    }

    #[test]
    fn transport_classification() {
        assert!(Error::Timeout("connect").is_transport());
        assert!(Error::Disconnected.is_transport());
        assert!(!Error::Protocol("x".into()).is_transport());
        assert!(!Error::Config("x".into()).is_transport());
    }
}
