//! Reject taxonomy shared by the hub and the HTTP surface.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Synchronous validation failure at ingestion. Nothing is stored.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("missing or empty field: {0}")]
    MissingField(&'static str),
    #[error("timeoutSeconds must be a positive integer")]
    InvalidTimeout,
    #[error("choice requests need a non-empty choices list")]
    EmptyChoices,
    #[error("choices are only valid for choice requests")]
    UnexpectedChoices,
}

/// Why a human response was turned away. Wire strings are part of the
/// protocol (409 bodies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// The event carries no HITL request.
    #[error("not-hitl")]
    NotHitl,
    /// The status already reached a terminal state; the stored answer is
    /// kept, never overwritten.
    #[error("already-terminal")]
    AlreadyTerminal,
    /// The answer shape does not match the request kind (or the choice is
    /// outside the offered set).
    #[error("shape-mismatch")]
    ShapeMismatch,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotHitl => "not-hitl",
            Self::AlreadyTerminal => "already-terminal",
            Self::ShapeMismatch => "shape-mismatch",
        }
    }
}
