// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication core.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Send failed: queue full, endpoint gone, unbound URL |
//! | `MalformedRequest` | No | Missing parameters or empty required lists |
//! | `Decode` | No | Message bytes did not parse; message discarded |
//! | `UnknownPeer` | No | Operation addressed a peer not in the registry |
//! | `InvariantViolation` | No | Internal consistency check failed; logged, no mutation |
//! | `Config` | No | Fatal configuration; the node refuses to start |
//! | `Shutdown` | No | The store actor is gone |
//!
//! Expected runtime failures (transport, malformed peer input) never cross
//! component boundaries as panics; they surface as counters plus logs, and
//! sync operations fall back to exponential backoff.

use thiserror::Error;

use crate::proto::ProtoDecodeError;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, KvStoreError>;

/// Errors that can occur in the replication core.
#[derive(Error, Debug)]
pub enum KvStoreError {
    /// Fatal configuration problem (empty node id, unbindable command URL).
    /// The process fails to start.
    #[error("configuration error: {0}")]
    Config(String),

    /// A request arrived without its required parameters, or with empty
    /// required lists. The store is left untouched.
    #[error("malformed {cmd} request: {reason}")]
    MalformedRequest {
        cmd: &'static str,
        reason: &'static str,
    },

    /// A message failed to decode and was discarded.
    #[error("decode error: {0}")]
    Decode(#[from] ProtoDecodeError),

    /// Sending to a peer failed. Retryable; sync operations back off and
    /// dropped flood sends are recovered by the periodic full sync.
    #[error("transport error to {peer} ({kind})")]
    Transport {
        /// Destination socket identity.
        peer: String,
        /// Short failure class, used in per-peer failure counters.
        kind: &'static str,
    },

    /// The operation referenced a peer the registry does not know.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// An internal consistency check failed (e.g. a spanning-tree parent
    /// equal to the node itself). Logged; no state mutation.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A reply arrived that does not match the command that was sent.
    #[error("unexpected response")]
    UnexpectedResponse,

    /// The store actor has shut down.
    #[error("store is shutting down")]
    Shutdown,
}

impl KvStoreError {
    /// Whether the triggering operation is worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Config(_) => false,
            Self::MalformedRequest { .. } => false,
            Self::Decode(_) => false,
            Self::UnknownPeer(_) => false,
            Self::InvariantViolation(_) => false,
            Self::UnexpectedResponse => false,
            Self::Shutdown => false,
        }
    }

    pub(crate) fn transport(peer: impl Into<String>, kind: &'static str) -> Self {
        Self::Transport {
            peer: peer.into(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_is_retryable() {
        let err = KvStoreError::transport("peer-1::3", "full");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("peer-1::3"));
        assert!(err.to_string().contains("full"));
    }

    #[test]
    fn test_malformed_not_retryable() {
        let err = KvStoreError::MalformedRequest {
            cmd: "KEY_SET",
            reason: "empty keyVals",
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("KEY_SET"));
    }

    #[test]
    fn test_config_not_retryable() {
        let err = KvStoreError::Config("node_id must not be empty".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_decode_not_retryable() {
        let decode_err = crate::proto::decode_publication(&[0xff]).unwrap_err();
        let err = KvStoreError::from(decode_err);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_shutdown_not_retryable() {
        assert!(!KvStoreError::Shutdown.is_retryable());
    }
}
