use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hookline_events::{EventStore, EventStreamHub, StoreError};
use hookline_protocol::{
    EventId, HitlRequest, HitlResponse, HitlState, HitlStatus, ResponsePayload,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, instrument, warn};

pub mod relay;

pub use relay::{DEFAULT_DELIVERY_TIMEOUT, DeliveryError, ResponseRelay};

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Another transition won first; carries the terminal state so callers
    /// can report "already resolved".
    #[error("request already {}", .0.as_str())]
    AlreadyTerminal(HitlState),
    #[error("event {0} not found")]
    NotFound(EventId),
    #[error(transparent)]
    Store(StoreError),
}

/// Owner of the `pending -> {responded, timeout}` machine for every
/// HITL-bearing event.
///
/// One single-shot timer per registered request; whichever of human response
/// and timer expiry reaches the store first wins, the loser observes the
/// store's terminal-state guard and stands down. Delivery to the agent runs
/// on its own task so an unreachable endpoint never delays the hub.
#[derive(Clone)]
pub struct LifecycleManager {
    store: Arc<dyn EventStore>,
    stream: EventStreamHub,
    relay: ResponseRelay,
    timers: Arc<Mutex<HashMap<EventId, AbortHandle>>>,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn EventStore>, stream: EventStreamHub, relay: ResponseRelay) -> Self {
        Self {
            store,
            stream,
            relay,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Arm the server-side timeout for a freshly stored request.
    ///
    /// When the timer fires first it transitions the record to `timeout` and
    /// stops there — no delivery attempt, because the agent's own local
    /// timeout races independently and has usually already fired.
    #[instrument(skip(self, request), fields(timeout_seconds = request.timeout_seconds))]
    pub fn register(&self, id: EventId, request: &HitlRequest) {
        let store = self.store.clone();
        let stream = self.stream.clone();
        let timers = self.timers.clone();
        let timeout = Duration::from_secs(request.timeout_seconds);

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            timers.lock().remove(&id);
            match store.set_status(id, HitlStatus::timed_out()).await {
                Ok(updated) => {
                    debug!(id, "request timed out unanswered");
                    stream.publish(updated);
                }
                Err(StoreError::Conflict { .. }) => {}
                Err(error) => warn!(id, %error, "timeout transition failed"),
            }
        });
        self.timers.lock().insert(id, task.abort_handle());
    }

    /// Commit a human answer: cancel the timer, transition to `responded`,
    /// and hand the payload to the relay fire-and-forget. Relay failures are
    /// annotated on the record, never reverted into the lifecycle.
    #[instrument(skip(self, response))]
    pub async fn resolve(
        &self,
        id: EventId,
        response: HitlResponse,
    ) -> Result<HitlStatus, ResolveError> {
        let responded_at = Utc::now();
        let status = HitlStatus::responded(response.clone(), responded_at);

        let updated = match self.store.set_status(id, status.clone()).await {
            Ok(updated) => updated,
            Err(StoreError::Conflict { state, .. }) => {
                return Err(ResolveError::AlreadyTerminal(state));
            }
            Err(StoreError::NotFound(id)) => return Err(ResolveError::NotFound(id)),
            Err(error) => return Err(ResolveError::Store(error)),
        };

        if let Some(timer) = self.timers.lock().remove(&id) {
            timer.abort();
        }
        self.stream.publish(updated.clone());

        if let Some(request) = &updated.hitl_request {
            let address = request.response_address.clone();
            let payload = ResponsePayload {
                response,
                responded_at,
                hook_event: updated,
            };
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(error) = manager.relay.deliver(&address, &payload).await {
                    warn!(id, %error, "response delivery failed");
                    manager.mark_delivery_error(id, &error.to_string()).await;
                }
            });
        }

        Ok(status)
    }

    /// Append the delivery-failure audit annotation. The record stays
    /// `responded`: the dashboard keeps the human's answer even if the agent
    /// never received it.
    async fn mark_delivery_error(&self, id: EventId, message: &str) {
        match self.store.set_delivery_error(id, message).await {
            Ok(annotated) => self.stream.publish(annotated),
            Err(error) => warn!(id, %error, "failed to record delivery error"),
        }
    }

    /// Pending timers currently armed. Test and introspection aid.
    pub fn armed_timers(&self) -> usize {
        self.timers.lock().len()
    }
}
