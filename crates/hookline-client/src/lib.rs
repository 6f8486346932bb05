//! Agent-side correlation client.
//!
//! Lets agent code block on a human answer without knowing anything about the
//! hub's storage model. Every call to [`HitlClient::request`] opens its own
//! transient TCP endpoint, submits one event carrying the question and the
//! endpoint address, and awaits exactly one inbound payload or a local
//! timeout. The endpoint is the correlation identity: unique per in-flight
//! request by construction, so concurrent requests from one process can never
//! swap answers, and teardown is RAII on every exit path (answer, timeout,
//! submission failure, caller cancellation).

use std::time::Duration;

use hookline_protocol::{Event, HitlKind, HitlRequest, HitlResponse, ResponsePayload};
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("could not open local response endpoint: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed response payload: {0}")]
    Protocol(String),
}

/// What a single request came back with. `TimedOut` and `DeliveryFailed` are
/// expected outcomes, not errors: the caller decides what "no usable answer"
/// means under its own policy.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Answered(HitlResponse),
    /// The local wait elapsed. The hub's own clock races independently; the
    /// dashboard may still record a response that arrived microseconds late.
    TimedOut,
    /// The initial submission to the hub failed; the endpoint was torn down
    /// without ever being awaited.
    DeliveryFailed,
}

/// What to do when no usable answer arrives (timeout or unreachable hub).
/// `FailClosed` treats it as a denial, `FailOpen` as an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    FailClosed,
    FailOpen,
}

impl FailurePolicy {
    fn default_answer(self) -> bool {
        matches!(self, Self::FailOpen)
    }
}

#[derive(Debug, Clone)]
pub struct HitlClientBuilder {
    base_url: String,
    source_app: String,
    session_id: Option<String>,
    hook_event_type: String,
    failure_policy: FailurePolicy,
}

impl HitlClientBuilder {
    pub fn new(base_url: impl Into<String>, source_app: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            source_app: source_app.into(),
            session_id: None,
            hook_event_type: "Notification".to_owned(),
            failure_policy: FailurePolicy::FailClosed,
        }
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn hook_event_type(mut self, hook_event_type: impl Into<String>) -> Self {
        self.hook_event_type = hook_event_type.into();
        self
    }

    /// Policy for `ask_permission` when no usable answer arrives. The default
    /// is fail-closed: an unreachable hub denies, it never auto-approves.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn build(self) -> HitlClient {
        HitlClient {
            base_url: self.base_url.trim_end_matches('/').to_owned(),
            source_app: self.source_app,
            session_id: self
                .session_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            hook_event_type: self.hook_event_type,
            failure_policy: self.failure_policy,
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HitlClient {
    base_url: String,
    source_app: String,
    session_id: String,
    hook_event_type: String,
    failure_policy: FailurePolicy,
    http: reqwest::Client,
}

impl HitlClient {
    pub fn builder(
        base_url: impl Into<String>,
        source_app: impl Into<String>,
    ) -> HitlClientBuilder {
        HitlClientBuilder::new(base_url, source_app)
    }

    /// Ask a human and block the calling task until an answer arrives on this
    /// request's own endpoint, the local timeout elapses, or the submission
    /// itself fails. Other tasks in the process are unaffected; dropping the
    /// returned future tears the endpoint down.
    pub async fn request(
        &self,
        question: impl Into<String>,
        kind: HitlKind,
        choices: Option<Vec<String>>,
        timeout_seconds: u64,
    ) -> Result<RequestOutcome, RequestError> {
        let timeout_seconds = timeout_seconds.max(1);
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let address = format!("tcp://{}", listener.local_addr()?);
        let question = question.into();

        let event = Event::new(
            &self.source_app,
            &self.session_id,
            &self.hook_event_type,
            json!({}),
        )
        .with_hitl_request(HitlRequest {
            question,
            response_address: address,
            requires_response: true,
            kind,
            choices,
            timeout_seconds,
        });

        let submitted = self
            .http
            .post(format!("{}/events", self.base_url))
            .json(&event)
            .send()
            .await;
        match submitted {
            Ok(reply) if reply.status().is_success() => {}
            Ok(reply) => {
                warn!(status = %reply.status(), "hub rejected request event");
                return Ok(RequestOutcome::DeliveryFailed);
            }
            Err(error) => {
                warn!(%error, "hub unreachable, request not submitted");
                return Ok(RequestOutcome::DeliveryFailed);
            }
        }

        // Both clocks are armed with the same duration but run on different
        // machines; the hub marking `timeout` and this wait elapsing are
        // independent outcomes.
        let wait = Duration::from_secs(timeout_seconds);
        match tokio::time::timeout(wait, receive_one(&listener)).await {
            Ok(Ok(payload)) => {
                debug!("answer received");
                Ok(RequestOutcome::Answered(payload.response))
            }
            Ok(Err(error)) => Err(error),
            Err(_) => Ok(RequestOutcome::TimedOut),
        }
    }

    /// Free-text question. `None` when no usable answer arrived.
    pub async fn ask(
        &self,
        question: impl Into<String>,
        timeout_seconds: u64,
    ) -> Result<Option<String>, RequestError> {
        let outcome = self
            .request(question, HitlKind::Question, None, timeout_seconds)
            .await?;
        Ok(match outcome {
            RequestOutcome::Answered(answer) => answer.response,
            RequestOutcome::TimedOut | RequestOutcome::DeliveryFailed => None,
        })
    }

    /// Yes/no gate. Timeouts and an unreachable hub resolve through the
    /// configured [`FailurePolicy`].
    pub async fn ask_permission(
        &self,
        question: impl Into<String>,
        timeout_seconds: u64,
    ) -> Result<bool, RequestError> {
        let outcome = self
            .request(question, HitlKind::Permission, None, timeout_seconds)
            .await?;
        Ok(match outcome {
            RequestOutcome::Answered(answer) => answer
                .permission
                .unwrap_or_else(|| self.failure_policy.default_answer()),
            RequestOutcome::TimedOut | RequestOutcome::DeliveryFailed => {
                self.failure_policy.default_answer()
            }
        })
    }

    /// Pick-one question. `None` when no usable answer arrived.
    pub async fn choose(
        &self,
        question: impl Into<String>,
        choices: Vec<String>,
        timeout_seconds: u64,
    ) -> Result<Option<String>, RequestError> {
        let outcome = self
            .request(question, HitlKind::Choice, Some(choices), timeout_seconds)
            .await?;
        Ok(match outcome {
            RequestOutcome::Answered(answer) => answer.choice,
            RequestOutcome::TimedOut | RequestOutcome::DeliveryFailed => None,
        })
    }
}

/// Accept exactly one connection and read one JSON line from it. Anything
/// arriving after the caller stopped listening hits a closed socket on the
/// sender's side and never disturbs this process.
async fn receive_one(listener: &TcpListener) -> Result<ResponsePayload, RequestError> {
    let (socket, _) = listener.accept().await?;
    let mut lines = BufReader::new(socket).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| RequestError::Protocol("connection closed before payload".to_owned()))?;
    serde_json::from_str(&line).map_err(|error| RequestError::Protocol(error.to_string()))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use anyhow::Result;
    use axum::extract::{Path, State};
    use axum::routing::post;
    use axum::{Json, Router};
    use hookline_events::unique_root;
    use hookline_hub::BroadcastHub;
    use hookline_protocol::{EventId, HitlState};
    use tokio::fs;

    use super::*;

    async fn ingest(
        State(hub): State<BroadcastHub>,
        Json(event): Json<Event>,
    ) -> Result<Json<serde_json::Value>, axum::http::StatusCode> {
        match hub.ingest(event).await {
            Ok(id) => Ok(Json(json!({ "id": id }))),
            Err(_) => Err(axum::http::StatusCode::BAD_REQUEST),
        }
    }

    async fn respond(
        Path(id): Path<EventId>,
        State(hub): State<BroadcastHub>,
        Json(response): Json<HitlResponse>,
    ) -> Result<Json<serde_json::Value>, axum::http::StatusCode> {
        match hub.submit_response(id, response).await {
            Ok(status) => Ok(Json(json!({ "state": status.state.as_str() }))),
            Err(_) => Err(axum::http::StatusCode::CONFLICT),
        }
    }

    async fn spawn_hub(name: &str) -> Result<(BroadcastHub, String, PathBuf)> {
        let root = unique_root(name);
        let hub = hookline_hub::HubBuilder::new(&root).build().await?;

        let app = Router::new()
            .route("/events", post(ingest))
            .route("/events/{id}/respond", post(respond))
            .with_state(hub.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base_url = format!("http://{}", listener.local_addr()?);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok((hub, base_url, root))
    }

    /// Answer every pending request seen on the stream using `answer_for`.
    fn spawn_responder(
        hub: BroadcastHub,
        count: usize,
        answer_for: impl Fn(&HitlRequest) -> HitlResponse + Send + 'static,
    ) {
        tokio::spawn(async move {
            let mut stream = hub.subscribe();
            let mut answered = 0;
            while answered < count {
                let Ok(event) = stream.recv().await else {
                    break;
                };
                let (Some(id), Some(request), Some(status)) =
                    (event.id, &event.hitl_request, &event.hitl_status)
                else {
                    continue;
                };
                if status.state != HitlState::Pending {
                    continue;
                }
                let _ = hub.submit_response(id, answer_for(request)).await;
                answered += 1;
            }
        });
    }

    #[tokio::test]
    async fn permission_answer_roundtrip() -> Result<()> {
        let (hub, base_url, root) = spawn_hub("hookline-client-roundtrip").await?;
        spawn_responder(hub, 1, |_| HitlResponse::permission(true));

        let client = HitlClient::builder(base_url.as_str(), "agent").build();
        let outcome = client
            .request("Allow rm -rf /tmp/x?", HitlKind::Permission, None, 10)
            .await?;
        assert_eq!(
            outcome,
            RequestOutcome::Answered(HitlResponse::permission(true))
        );

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn local_timeout_races_independently_of_hub_clock() -> Result<()> {
        let (hub, base_url, root) = spawn_hub("hookline-client-timeout").await?;
        let client = HitlClient::builder(base_url.as_str(), "agent").build();

        let mut stream = hub.subscribe();
        let outcome = client
            .request("Anyone there?", HitlKind::Question, None, 1)
            .await?;
        assert_eq!(outcome, RequestOutcome::TimedOut);

        // the hub's own clock marks the stored record independently
        let pending = stream.recv().await?;
        let id = pending.id.unwrap();
        let expired = tokio::time::timeout(Duration::from_millis(1500), stream.recv()).await??;
        assert_eq!(expired.id, Some(id));
        assert_eq!(
            expired.hitl_status.map(|s| s.state),
            Some(HitlState::Timeout)
        );

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_hub_is_delivery_failed() -> Result<()> {
        // a port with nothing behind it
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            listener.local_addr()?.port()
        };
        let client = HitlClient::builder(format!("http://127.0.0.1:{port}"), "agent").build();
        let outcome = client
            .request("Anyone there?", HitlKind::Question, None, 5)
            .await?;
        assert_eq!(outcome, RequestOutcome::DeliveryFailed);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_identical_requests_get_their_own_answers() -> Result<()> {
        let (hub, base_url, root) = spawn_hub("hookline-client-concurrent").await?;
        spawn_responder(hub, 3, |request| {
            HitlResponse::text(format!("answer-to-{}", request.question))
        });

        let client = HitlClient::builder(base_url.as_str(), "agent").build();
        let (first, second, third) = tokio::join!(
            client.request("req-0", HitlKind::Question, None, 10),
            client.request("req-1", HitlKind::Question, None, 10),
            client.request("req-2", HitlKind::Question, None, 10),
        );

        for (index, outcome) in [first?, second?, third?].into_iter().enumerate() {
            let RequestOutcome::Answered(answer) = outcome else {
                panic!("request {index} did not get an answer");
            };
            assert_eq!(
                answer.response.as_deref(),
                Some(format!("answer-to-req-{index}").as_str())
            );
        }

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn ask_permission_applies_failure_policy() -> Result<()> {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            listener.local_addr()?.port()
        };
        let dead_hub = format!("http://127.0.0.1:{port}");

        let closed = HitlClient::builder(dead_hub.as_str(), "agent").build();
        assert!(!closed.ask_permission("Allow?", 5).await?);

        let open = HitlClient::builder(dead_hub.as_str(), "agent")
            .failure_policy(FailurePolicy::FailOpen)
            .build();
        assert!(open.ask_permission("Allow?", 5).await?);
        Ok(())
    }

    #[tokio::test]
    async fn choose_returns_the_selected_option() -> Result<()> {
        let (hub, base_url, root) = spawn_hub("hookline-client-choose").await?;
        spawn_responder(hub, 1, |request| {
            HitlResponse::choice(request.choices.as_ref().unwrap()[1].clone())
        });

        let client = HitlClient::builder(base_url.as_str(), "agent").build();
        let picked = client
            .choose(
                "Which test runner?",
                vec!["Vitest".into(), "Mocha".into()],
                10,
            )
            .await?;
        assert_eq!(picked.as_deref(), Some("Mocha"));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
