//! Error types for the DCP client core
//!
//! Errors are classified so callers can decide between retrying in place,
//! starting fresh, rewinding a stream, or tearing the process down:
//! `NotFound` is benign, `Rollback` is a structured signal consumed by the
//! stream coordinator, anything `is_retriable()` is retried with backoff,
//! and `is_fatal()` aborts after a best-effort checkpoint flush.

use crate::offset::{SeqNo, VbId};
use thiserror::Error;

/// Result type for DCP client operations
pub type Result<T> = std::result::Result<T, DcpError>;

/// DCP client errors
#[derive(Debug, Error)]
pub enum DcpError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ==================== Metadata Errors ====================
    /// Key absent from the metadata store. Expected on first start;
    /// callers treat it as "start fresh", never as a failure.
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("metadata store is read-only")]
    ReadOnly,

    #[error("metadata error: {0}")]
    Metadata(String),

    // ==================== Membership Errors ====================
    #[error("instance {0} is not present in the active set")]
    SelfNotInCluster(String),

    #[error("membership error: {0}")]
    Membership(String),

    #[error("leader is not assigned")]
    LeaderNotAssigned,

    // ==================== Stream Errors ====================
    /// Server-directed rewind: the requested resume point is incompatible
    /// with the vbucket's current history. Handled by the stream state
    /// machine, never surfaced to the consumer callback.
    #[error("rollback on vb {vb_id} to seq {seq_no}")]
    Rollback { vb_id: VbId, seq_no: SeqNo },

    #[error("stream not open for vb {0}")]
    StreamNotOpen(VbId),

    #[error("stream already open for vb {0}")]
    StreamAlreadyOpen(VbId),

    #[error("end of stream for vb {0}")]
    EndOfStream(VbId),

    // ==================== Network Errors ====================
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    // ==================== Serialization Errors ====================
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // ==================== Internal Errors ====================
    #[error("channel closed")]
    ChannelClosed,

    #[error("shutdown in progress")]
    ShuttingDown,

    /// Unrecoverable condition. Terminates the process after a best-effort
    /// checkpoint flush (structured exit, not a panic).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl DcpError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    /// Create a metadata error
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    /// Create a membership error
    pub fn membership(msg: impl Into<String>) -> Self {
        Self::Membership(msg.into())
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Check if the key was simply absent (benign, "start fresh")
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error is transient and worth retrying in place
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConnectionFailed(_)
            | Self::ConnectionClosed
            | Self::Timeout(_)
            | Self::Network(_) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            _ => false,
        }
    }

    /// Check if this error requires process shutdown
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Fatal(_) | Self::SelfNotInCluster(_) | Self::InvalidConfig(_)
        )
    }
}

// Conversion from channel errors
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for DcpError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        DcpError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for DcpError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        DcpError::ChannelClosed
    }
}

impl From<tokio::time::error::Elapsed> for DcpError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        DcpError::Timeout(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_errors() {
        assert!(DcpError::ConnectionClosed.is_retriable());
        assert!(DcpError::timeout("observe").is_retriable());
        assert!(DcpError::network("reset by peer").is_retriable());
        assert!(!DcpError::not_found("key").is_retriable());
        assert!(!DcpError::config("bad hosts").is_retriable());
        assert!(!DcpError::Rollback { vb_id: 3, seq_no: 42 }.is_retriable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(DcpError::fatal("metadata unreachable").is_fatal());
        assert!(DcpError::SelfNotInCluster("i-123".into()).is_fatal());
        assert!(DcpError::config("no hosts").is_fatal());
        assert!(!DcpError::Timeout("5s".into()).is_fatal());
        assert!(!DcpError::not_found("key").is_fatal());
    }

    #[test]
    fn test_not_found_is_distinguishable() {
        let err = DcpError::not_found("_couchstream:g:checkpoint:17");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("checkpoint:17"));
        assert!(!DcpError::metadata("boom").is_not_found());
    }

    #[test]
    fn test_rollback_display() {
        let err = DcpError::Rollback { vb_id: 42, seq_no: 450 };
        assert_eq!(err.to_string(), "rollback on vb 42 to seq 450");
    }
}
