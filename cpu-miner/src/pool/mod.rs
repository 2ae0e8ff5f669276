//! Mining pool connectivity.
//!
//! One [`PoolConnection`] exists per upstream pool. Each runs as an async
//! task on the I/O runtime, owns its network transport, and walks the
//! connection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Subscribing -> Authorizing -> Ready
//!                    ^                                          |
//!                    |                                          v
//!                    +---------- (backoff) ------------- Reconnecting
//!                                                               |
//!                                        (max failures) -> Failed
//! ```
//!
//! Every transition, every accepted job and every share result is pushed to
//! the strategy as a [`PoolEvent`]. The wire format is pluggable through the
//! [`Dialect`] trait; the transport through [`Connector`].

mod backoff;
mod connection;
mod descriptor;
mod dialect;
mod job;
mod messages;
mod transport;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use strum::Display;

pub use backoff::Backoff;
pub use connection::{ConnectionSettings, PoolConnection, PoolHandle};
pub use descriptor::PoolDescriptor;
pub use dialect::{
    dialect_for, Authorized, Dialect, JobParams, LoginDialect, Notification, Request, Session,
    StratumDialect, SubmitReply,
};
pub use job::{parse_target, Job, Share, MAX_BLOB_SIZE, MIN_BLOB_SIZE, NONCE_OFFSET};
pub use messages::{error_reason, JsonRpcMessage};
pub use transport::{Connector, LineTransport, TcpConnector, Transport};

#[cfg(test)]
pub(crate) use transport::{MockConnector, MockTransport, MockTransportHandle};

/// Identifies one connection within a session.
///
/// Configured pools are numbered in priority order from zero; the donation
/// pool, when present, takes the next index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PoolId(pub usize);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection state, owned by the connection task and read by the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribing,
    Authorizing,
    Ready,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn is_ready(self) -> bool {
        self == ConnectionState::Ready
    }
}

/// Why a share never reached the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DiscardReason {
    /// Its job was superseded and stale submission is off
    Stale,
    /// The connection was not Ready
    NotReady,
    /// The connection closed before the share could be written
    Closed,
}

/// Final outcome of one share submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(String),
    TimedOut,
    Discarded(DiscardReason),
}

/// Notifications from a connection to the strategy and result accounting.
#[derive(Debug, Clone)]
pub struct PoolEvent {
    pub pool: PoolId,
    pub kind: PoolEventKind,
}

#[derive(Debug, Clone)]
pub enum PoolEventKind {
    /// The connection moved to a new state
    StateChanged(ConnectionState),

    /// A new job replaced the connection's current job
    NewJob(Arc<Job>),

    /// A submitted share was answered, timed out, or discarded
    ShareResult {
        job_id: String,
        nonce: u32,
        difficulty: u64,
        outcome: SubmitOutcome,
    },
}

impl PoolEvent {
    pub fn new(pool: PoolId, kind: PoolEventKind) -> Self {
        Self { pool, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_id_display() {
        assert_eq!(PoolId(2).to_string(), "#2");
    }

    #[test]
    fn only_ready_is_ready() {
        assert!(ConnectionState::Ready.is_ready());
        assert!(!ConnectionState::Reconnecting.is_ready());
        assert!(!ConnectionState::Failed.is_ready());
        assert_eq!(ConnectionState::Authorizing.to_string(), "Authorizing");
    }
}
