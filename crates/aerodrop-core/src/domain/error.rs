//! Error taxonomy shared by every layer.
//!
//! Ports and use cases return `anyhow::Result`; errors surfaced to callers
//! are built from [`AerodropError`] so they can be recovered with
//! `downcast_ref`.

use thiserror::Error;

use super::identity::Identity;

/// Why an envelope could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("no salt known for this sender")]
    MissingSalt,
    #[error("authentication tag mismatch")]
    Authentication,
    #[error("plaintext is not valid UTF-8")]
    Encoding,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AerodropError {
    #[error("decrypt failed: {0}")]
    Decrypt(#[from] DecryptError),

    /// Unknown tag, missing field or out-of-order command from a peer.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("negotiation with {peer} timed out")]
    NegotiationTimeout { peer: Identity },

    #[error("{peer} is busy with another negotiation")]
    NegotiationRejected { peer: Identity },

    /// A local `request_peer` while a negotiation is already in flight.
    #[error("already negotiating with {peer}")]
    NegotiationBusy { peer: Identity },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transfer {file_id} failed: {reason}")]
    Transfer { file_id: String, reason: String },

    #[error("{0} is closed")]
    Closed(&'static str),
}

impl AerodropError {
    pub fn violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn transfer(file_id: &str, reason: impl Into<String>) -> Self {
        Self::Transfer {
            file_id: file_id.to_owned(),
            reason: reason.into(),
        }
    }
}
