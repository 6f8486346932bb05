//! # hookline-protocol — hookline wire contract
//!
//! Shared types for the hookline event pipeline: the [`Event`] envelope
//! agents POST to the hub, the embedded human-in-the-loop request/status
//! records, and the validation rules the hub applies at its boundary.
//!
//! Intentionally dependency-light (no tokio, no axum) so agents, the hub,
//! and dashboards can all depend on it as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`event`] — `Event` envelope + boundary validation
//! - [`hitl`] — `HitlRequest`, `HitlStatus`, `HitlResponse`, relay payload
//! - [`error`] — reject taxonomy shared by hub and HTTP surface

pub mod error;
pub mod event;
pub mod hitl;

pub use error::{IngestError, RejectReason};
pub use event::{Event, EventId};
pub use hitl::{
    HitlKind, HitlRequest, HitlResponse, HitlState, HitlStatus, ResponsePayload,
};
