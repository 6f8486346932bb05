use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hookline_protocol::{Event, EventId, HitlStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event {0} not found")]
    NotFound(EventId),
    #[error("status for event {id} is already terminal ({})", .state.as_str())]
    Conflict {
        id: EventId,
        state: hookline_protocol::HitlState,
    },
    #[error("event log io: {0}")]
    Io(#[from] std::io::Error),
    #[error("event log line: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable record of ingested events.
///
/// `set_status` is the arbitration point for the human-response/timer race:
/// implementations serialize concurrent calls per id so that exactly one
/// terminal transition wins and every later one reports `Conflict`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Assign the next id, stamp a `pending` status when a HITL request is
    /// present, persist, and return the stored event.
    async fn put(&self, event: Event) -> Result<Event, StoreError>;
    async fn get(&self, id: EventId) -> Result<Event, StoreError>;
    /// First terminal transition wins; `NotFound` covers unknown ids and
    /// events without a HITL request.
    async fn set_status(&self, id: EventId, status: HitlStatus) -> Result<Event, StoreError>;
    /// Audit annotation on an already-terminal record. Not a transition, so
    /// the terminal guard does not apply and `state` never changes.
    async fn set_delivery_error(&self, id: EventId, message: &str) -> Result<Event, StoreError>;
}

/// One line of the append-only log: either a full event or a status update
/// for an earlier event. Replay applies lines in file order.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum LogLine {
    Event(Event),
    Status {
        id: EventId,
        #[serde(rename = "hitlStatus")]
        hitl_status: HitlStatus,
    },
}

/// Append-only JSONL store with an in-memory index for point lookups.
///
/// The index mutex is the serialization primitive for status transitions;
/// the log line written afterwards is durability, not arbitration.
#[derive(Debug)]
pub struct FileEventStore {
    path: PathBuf,
    index: Mutex<HashMap<EventId, Event>>,
    next_id: AtomicU64,
    append_lock: tokio::sync::Mutex<()>,
}

impl FileEventStore {
    /// Open the store under `root`, replaying `events.jsonl` if it exists so
    /// point lookups survive restarts. Pending timers are not re-armed here;
    /// in-flight correlation state does not outlive the process.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = root.into().join("events.jsonl");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut index = HashMap::new();
        let mut max_id = 0_u64;
        if fs::try_exists(&path).await.unwrap_or(false) {
            let file = OpenOptions::new().read(true).open(&path).await?;
            let mut lines = BufReader::new(file).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogLine>(&line)? {
                    LogLine::Event(event) => {
                        if let Some(id) = event.id {
                            max_id = max_id.max(id);
                            index.insert(id, event);
                        }
                    }
                    LogLine::Status { id, hitl_status } => {
                        if let Some(event) = index.get_mut(&id) {
                            event.hitl_status = Some(hitl_status);
                        } else {
                            warn!(id, "status line for unknown event in log");
                        }
                    }
                }
            }
        }
        debug!(events = index.len(), "event log replayed");

        Ok(Self {
            path,
            index: Mutex::new(index),
            next_id: AtomicU64::new(max_id + 1),
            append_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn append(&self, line: &LogLine) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(line)?;
        let _guard = self.append_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(serialized.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    #[instrument(skip(self, event), fields(source_app = %event.source_app, session_id = %event.session_id))]
    async fn put(&self, mut event: Event) -> Result<Event, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        event.id = Some(id);
        if event.hitl_request.is_some() {
            event.hitl_status = Some(HitlStatus::pending());
        } else {
            event.hitl_status = None;
        }

        self.append(&LogLine::Event(event.clone())).await?;
        self.index.lock().insert(id, event.clone());
        debug!(id, "event appended to store");
        Ok(event)
    }

    async fn get(&self, id: EventId) -> Result<Event, StoreError> {
        self.index
            .lock()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    #[instrument(skip(self, status), fields(state = status.state.as_str()))]
    async fn set_status(&self, id: EventId, status: HitlStatus) -> Result<Event, StoreError> {
        let updated = {
            let mut index = self.index.lock();
            let event = index.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            if event.hitl_request.is_none() {
                return Err(StoreError::NotFound(id));
            }
            if let Some(current) = &event.hitl_status
                && current.state.is_terminal()
            {
                return Err(StoreError::Conflict {
                    id,
                    state: current.state,
                });
            }
            event.hitl_status = Some(status.clone());
            event.clone()
        };

        self.append(&LogLine::Status {
            id,
            hitl_status: status,
        })
        .await?;
        debug!(id, "status transition committed");
        Ok(updated)
    }

    #[instrument(skip(self, message))]
    async fn set_delivery_error(&self, id: EventId, message: &str) -> Result<Event, StoreError> {
        let (updated, status) = {
            let mut index = self.index.lock();
            let event = index.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            let status = event
                .hitl_status
                .as_mut()
                .ok_or(StoreError::NotFound(id))?;
            status.delivery_error = Some(message.to_owned());
            let status = status.clone();
            (event.clone(), status)
        };

        self.append(&LogLine::Status {
            id,
            hitl_status: status,
        })
        .await?;
        warn!(id, error = message, "delivery failure recorded");
        Ok(updated)
    }
}

/// Live fan-out to connected observers. Publication is best-effort and
/// non-blocking; a receiver that lags past the buffer is cut off by the
/// subscriber side rather than allowed to back-pressure ingestion.
#[derive(Clone, Debug)]
pub struct EventStreamHub {
    sender: broadcast::Sender<Event>,
}

impl EventStreamHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

/// Build a unique per-test store root under the system temp dir.
pub fn unique_root(name: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("{name}-{nanos}"))
}
