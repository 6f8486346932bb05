//! One-shot delivery of a resolved answer to the agent's declared endpoint.

use std::time::Duration;

use hookline_protocol::ResponsePayload;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("unusable response address: {0}")]
    BadAddress(String),
    #[error("delivery timed out after {0:?}")]
    TimedOut(Duration),
    #[error("payload encoding: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection to agent endpoint failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Connect-out delivery of the response payload: open, write one JSON line,
/// close. Bounded by its own timeout, independent of the request's
/// `timeoutSeconds`, and never retried — the common failure is the agent
/// having already abandoned the endpoint after its own local timeout.
#[derive(Debug, Clone)]
pub struct ResponseRelay {
    timeout: Duration,
}

impl Default for ResponseRelay {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }
}

impl ResponseRelay {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    #[instrument(skip(self, payload))]
    pub async fn deliver(
        &self,
        address: &str,
        payload: &ResponsePayload,
    ) -> Result<(), DeliveryError> {
        let endpoint = host_port(address)
            .ok_or_else(|| DeliveryError::BadAddress(address.to_owned()))?;
        let encoded = serde_json::to_vec(payload)?;

        let attempt = async {
            let mut stream = TcpStream::connect(&endpoint).await?;
            stream.write_all(&encoded).await?;
            stream.write_all(b"\n").await?;
            stream.shutdown().await?;
            Ok::<(), DeliveryError>(())
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result?,
            Err(_) => return Err(DeliveryError::TimedOut(self.timeout)),
        }
        debug!(endpoint, "response delivered");
        Ok(())
    }
}

/// Extract `host:port` from an opaque agent-declared address. The scheme and
/// any path are ignored; `ws://127.0.0.1:4821/respond`, `tcp://127.0.0.1:4821`
/// and `127.0.0.1:4821` all name the same endpoint.
fn host_port(address: &str) -> Option<String> {
    let rest = match address.split_once("://") {
        Some((_, rest)) => rest,
        None => address,
    };
    let authority = rest.split('/').next().unwrap_or_default().trim();
    if authority.is_empty() || !authority.contains(':') {
        return None;
    }
    Some(authority.to_owned())
}
