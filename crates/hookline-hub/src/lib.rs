use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hookline_events::{EventStore, EventStreamHub, FileEventStore, StoreError};
use hookline_hitl::{LifecycleManager, ResolveError, ResponseRelay};
use hookline_protocol::{Event, EventId, HitlResponse, HitlStatus, IngestError, RejectReason};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, instrument};

pub use hookline_events::StoreError as EventStoreError;

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Invalid(#[from] IngestError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    /// User-input problem, reported with its wire reason; never a panic.
    #[error("{}", .0.as_str())]
    Rejected(RejectReason),
    #[error("event {0} not found")]
    NotFound(EventId),
    #[error(transparent)]
    Store(StoreError),
}

impl SubmitError {
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubBuilder {
    root: PathBuf,
    stream_buffer: usize,
    delivery_timeout: Duration,
}

impl HubBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stream_buffer: 1024,
            delivery_timeout: hookline_hitl::DEFAULT_DELIVERY_TIMEOUT,
        }
    }

    /// Capacity of the observer broadcast buffer. Observers that fall this
    /// far behind are disconnected instead of back-pressuring ingestion.
    pub fn stream_buffer(mut self, buffer: usize) -> Self {
        self.stream_buffer = buffer;
        self
    }

    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub async fn build(self) -> Result<BroadcastHub, StoreError> {
        let store: Arc<dyn EventStore> = Arc::new(FileEventStore::open(self.root).await?);
        let stream = EventStreamHub::new(self.stream_buffer);
        let relay = ResponseRelay::new(self.delivery_timeout);
        let lifecycle = LifecycleManager::new(store.clone(), stream.clone(), relay);
        Ok(BroadcastHub {
            store,
            stream,
            lifecycle,
        })
    }
}

/// The long-lived many-clients service: concurrent ingestion, observer
/// connections, and response submissions all share this clone-able handle.
#[derive(Clone)]
pub struct BroadcastHub {
    store: Arc<dyn EventStore>,
    stream: EventStreamHub,
    lifecycle: LifecycleManager,
}

impl BroadcastHub {
    /// Validate, persist, arm the HITL timeout when present, then fan out to
    /// observers. The timer is armed before the caller is acknowledged, so a
    /// stored request can never sit unarmed; publication is fire-and-forget
    /// and never delays the ingest path.
    #[instrument(skip(self, event), fields(source_app = %event.source_app, session_id = %event.session_id))]
    pub async fn ingest(&self, event: Event) -> Result<EventId, HubError> {
        event.validate()?;
        let stored = self.store.put(event).await?;
        let id = stored.id.unwrap_or_default();

        if let Some(request) = &stored.hitl_request {
            self.lifecycle.register(id, request);
        }
        self.stream.publish(stored);
        debug!(id, "event ingested");
        Ok(id)
    }

    /// Live feed of events published after this call. No backfill: catching
    /// up on history is a store query, not a stream feature.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.stream.subscribe()
    }

    /// Route a human answer to its request. All user-input failures come
    /// back as `Rejected` with a wire reason; the stored record is untouched
    /// unless the transition wins.
    #[instrument(skip(self, response))]
    pub async fn submit_response(
        &self,
        id: EventId,
        response: HitlResponse,
    ) -> Result<HitlStatus, SubmitError> {
        let event = match self.store.get(id).await {
            Ok(event) => event,
            Err(StoreError::NotFound(id)) => return Err(SubmitError::NotFound(id)),
            Err(error) => return Err(SubmitError::Store(error)),
        };
        let Some(request) = &event.hitl_request else {
            return Err(SubmitError::Rejected(RejectReason::NotHitl));
        };
        response
            .validate_against(request)
            .map_err(SubmitError::Rejected)?;

        match self.lifecycle.resolve(id, response).await {
            Ok(status) => Ok(status),
            Err(ResolveError::AlreadyTerminal(_)) => {
                Err(SubmitError::Rejected(RejectReason::AlreadyTerminal))
            }
            Err(ResolveError::NotFound(id)) => Err(SubmitError::NotFound(id)),
            Err(ResolveError::Store(error)) => Err(SubmitError::Store(error)),
        }
    }

    pub async fn get(&self, id: EventId) -> Result<Event, StoreError> {
        self.store.get(id).await
    }
}
