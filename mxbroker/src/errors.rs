//! Error types shared by every broker component.

use thiserror::Error;

use crate::credentials::Pid;

/// Result alias used throughout the crate.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by the connection pool, the helper process and the
/// remote-control session.
///
/// Variants carry rendered messages rather than source errors so a single
/// failure can be cloned to every caller waiting on the same pool entry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Helper process failed to start, exited non-zero or was torn down.
    #[error("helper launch failed: {0}")]
    LaunchFailed(String),

    /// No valid handshake arrived before the acquire deadline.
    #[error("no handshake from helper for pid {pid} within {timeout_ms}ms")]
    HandshakeTimeout { pid: Pid, timeout_ms: u64 },

    /// Handshake payload failed parsing or field validation.
    #[error("malformed handshake: {0}")]
    HandshakeMalformed(String),

    /// Caller identity did not match the owner of the target process.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The privileged attach to the target VM failed.
    #[error("attach failed: {0}")]
    AttachFailed(String),

    /// Reading process ownership information failed.
    #[error("process I/O error: {0}")]
    ProcessIo(String),

    /// Turning a management URL into a live connection failed.
    #[error("management connection error: {0}")]
    Connection(String),

    /// Connector address requested before a successful attach.
    #[error("session is not attached to pid {0}")]
    NotAttached(Pid),

    /// Operation invoked on a detached (terminal) session.
    #[error("session {0} is closed")]
    SessionClosed(String),

    /// `release` called with a pid/connection pair the pool does not hold.
    #[error("no pooled connection matches pid {0}")]
    UnknownConnection(Pid),

    /// The target pid does not name a live process.
    #[error("no such process: {0}")]
    NoSuchProcess(Pid),

    /// A wait was cancelled before it completed.
    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("ipc error: {0}")]
    Ipc(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Whether repeating the same request can reasonably succeed.
    ///
    /// Authentication failures and bad pids never fix themselves; timeouts,
    /// dropped handshakes, failed attaches and helper crashes might.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::LaunchFailed(_)
                | BrokerError::AttachFailed(_)
                | BrokerError::HandshakeTimeout { .. }
                | BrokerError::HandshakeMalformed(_)
                | BrokerError::Interrupted(_)
                | BrokerError::Connection(_)
                | BrokerError::Ipc(_)
        )
    }

    /// Short stable identifier, used on the registry wire protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::LaunchFailed(_) => "launch_failed",
            BrokerError::HandshakeTimeout { .. } => "handshake_timeout",
            BrokerError::HandshakeMalformed(_) => "handshake_malformed",
            BrokerError::AuthenticationFailed(_) => "authentication_failed",
            BrokerError::AttachFailed(_) => "attach_failed",
            BrokerError::ProcessIo(_) => "process_io",
            BrokerError::Connection(_) => "connection",
            BrokerError::NotAttached(_) => "not_attached",
            BrokerError::SessionClosed(_) => "session_closed",
            BrokerError::UnknownConnection(_) => "unknown_connection",
            BrokerError::NoSuchProcess(_) => "no_such_process",
            BrokerError::Interrupted(_) => "interrupted",
            BrokerError::Registry(_) => "registry",
            BrokerError::Ipc(_) => "ipc",
            BrokerError::Config(_) => "config",
            BrokerError::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Internal(format!("I/O error: {}", e))
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Internal(format!("JSON error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(
            BrokerError::HandshakeTimeout {
                pid: 1,
                timeout_ms: 10
            }
            .is_retryable()
        );
        assert!(BrokerError::LaunchFailed("exit 1".into()).is_retryable());
        assert!(!BrokerError::AuthenticationFailed("uid".into()).is_retryable());
        assert!(!BrokerError::NoSuchProcess(42).is_retryable());
        assert!(BrokerError::AttachFailed("no socket".into()).is_retryable());
        assert!(!BrokerError::ProcessIo("no Uid line".into()).is_retryable());
    }

    #[test]
    fn test_display_mentions_pid() {
        let err = BrokerError::HandshakeTimeout {
            pid: 8000,
            timeout_ms: 10_000,
        };
        assert!(err.to_string().contains("8000"));
        assert_eq!(err.kind(), "handshake_timeout");
    }
}
