use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_stream::stream;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use futures_util::{Stream, StreamExt};
use hookline_hub::{BroadcastHub, EventStoreError, HubBuilder, HubError, SubmitError};
use hookline_protocol::{Event, EventId, HitlResponse, HitlStatus};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "hookline-api")]
#[command(about = "hookline event hub API")]
struct Cli {
    /// Directory holding the append-only event log.
    #[arg(long, default_value = ".hookline")]
    root: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4000")]
    listen: SocketAddr,
    /// Observer broadcast buffer; observers that fall this far behind are
    /// disconnected.
    #[arg(long, default_value_t = 1024)]
    stream_buffer: usize,
    /// Bound on a single response delivery to an agent endpoint.
    #[arg(long, default_value_t = 5)]
    delivery_timeout_secs: u64,
}

#[derive(Clone)]
struct AppState {
    hub: BroadcastHub,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    id: EventId,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn internal(error: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let hub = HubBuilder::new(&cli.root)
        .stream_buffer(cli.stream_buffer)
        .delivery_timeout(Duration::from_secs(cli.delivery_timeout_secs))
        .build()
        .await?;

    let state = AppState { hub };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/events", post(ingest_event))
        .route("/events/{id}", get(get_event))
        .route("/events/{id}/respond", post(respond))
        .route("/events/stream", get(stream_events_sse))
        .route("/stream", get(stream_events_ws))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(listen = %cli.listen, root = %cli.root.display(), "hookline-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "hookline-api"
    }))
}

async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<Event>,
) -> ApiResult<Json<IngestResponse>> {
    match state.hub.ingest(event).await {
        Ok(id) => Ok(Json(IngestResponse { id })),
        Err(HubError::Invalid(error)) => Err(ApiError::bad_request(error.to_string())),
        Err(HubError::Store(error)) => Err(ApiError::internal(error)),
    }
}

async fn get_event(
    Path(id): Path<EventId>,
    State(state): State<AppState>,
) -> ApiResult<Json<Event>> {
    match state.hub.get(id).await {
        Ok(event) => Ok(Json(event)),
        Err(EventStoreError::NotFound(id)) => {
            Err(ApiError::not_found(format!("event {id} not found")))
        }
        Err(error) => Err(ApiError::internal(error)),
    }
}

async fn respond(
    Path(id): Path<EventId>,
    State(state): State<AppState>,
    Json(response): Json<HitlResponse>,
) -> ApiResult<Json<HitlStatus>> {
    match state.hub.submit_response(id, response).await {
        Ok(status) => Ok(Json(status)),
        Err(SubmitError::Rejected(reason)) => Err(ApiError::conflict(reason.as_str())),
        Err(SubmitError::NotFound(id)) => Err(ApiError::not_found(format!("event {id} not found"))),
        Err(SubmitError::Store(error)) => Err(ApiError::internal(error)),
    }
}

async fn stream_events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_observer_socket(state, socket))
}

/// Push every newly-published event as one JSON text message. Observers never
/// acknowledge; one that lags past the broadcast buffer is disconnected
/// rather than allowed to back-pressure the hub.
async fn handle_observer_socket(state: AppState, mut socket: WebSocket) {
    let mut events = state.hub.subscribe();
    loop {
        tokio::select! {
            published = events.recv() => match published {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "observer lagged behind, disconnecting");
                    break;
                }
                Err(RecvError::Closed) => break,
            },
            inbound = socket.next() => match inbound {
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// SSE variant of the observer feed, for dashboards that cannot hold a
/// WebSocket. Same contract: live events only, laggards are cut off.
async fn stream_events_sse(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut subscription = state.hub.subscribe();
    let stream = stream! {
        loop {
            match subscription.recv().await {
                Ok(event) => yield Ok(as_sse_event("hook.event", &event)),
                Err(RecvError::Lagged(skipped)) => {
                    let payload = json!({ "skipped": skipped }).to_string();
                    yield Ok(SseEvent::default().event("stream.lagged").data(payload));
                    break;
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn as_sse_event(event_name: &str, event: &Event) -> SseEvent {
    let payload = serde_json::to_string(event)
        .unwrap_or_else(|error| json!({ "error": error.to_string() }).to_string());
    let sse = SseEvent::default().event(event_name).data(payload);
    match event.id {
        Some(id) => sse.id(id.to_string()),
        None => sse,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
