//! Human-in-the-loop request, status, and response records.
//!
//! Field names on the wire are fixed by compatibility with existing agents
//! and dashboards: `responseWebSocketUrl`, `requiresResponse`, and
//! `respondedAt` must serialize verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RejectReason;

/// What kind of answer the human is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitlKind {
    Question,
    Permission,
    Choice,
}

/// The question attached to an event at creation time. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlRequest {
    pub question: String,
    /// Agent-declared reply endpoint. Opaque to the core; the relay connects
    /// to the host:port embedded in it at most once per request.
    #[serde(rename = "responseWebSocketUrl")]
    pub response_address: String,
    /// Dashboard marker. Kept on the wire as `requiresResponse`.
    #[serde(default = "default_requires_response")]
    pub requires_response: bool,
    pub kind: HitlKind,
    /// Present iff `kind` is `choice`; ordered, non-empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    /// Server-side bound after which the hub marks the request `timeout`.
    pub timeout_seconds: u64,
}

fn default_requires_response() -> bool {
    true
}

/// Lifecycle state of a request. Everything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitlState {
    Pending,
    Responded,
    Timeout,
    Error,
}

impl HitlState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Wire string, used in 409 bodies and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Responded => "responded",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

/// The single mutable record per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlStatus {
    pub state: HitlState,
    /// Set only on entering `responded`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    /// Set only on entering `responded`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<HitlResponse>,
    /// Audit annotation appended when the relay could not reach the agent.
    /// Never a lifecycle state and never clears `response`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_error: Option<String>,
}

impl HitlStatus {
    pub fn pending() -> Self {
        Self {
            state: HitlState::Pending,
            responded_at: None,
            response: None,
            delivery_error: None,
        }
    }

    pub fn responded(response: HitlResponse, at: DateTime<Utc>) -> Self {
        Self {
            state: HitlState::Responded,
            responded_at: Some(at),
            response: Some(response),
            delivery_error: None,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            state: HitlState::Timeout,
            responded_at: None,
            response: None,
            delivery_error: None,
        }
    }
}

/// A human answer. Exactly one field is set, matching the request kind:
/// `response` for `question`, `permission` for `permission`, `choice` for
/// `choice`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choice: Option<String>,
}

impl HitlResponse {
    pub fn text(answer: impl Into<String>) -> Self {
        Self {
            response: Some(answer.into()),
            ..Self::default()
        }
    }

    pub fn permission(granted: bool) -> Self {
        Self {
            permission: Some(granted),
            ..Self::default()
        }
    }

    pub fn choice(selected: impl Into<String>) -> Self {
        Self {
            choice: Some(selected.into()),
            ..Self::default()
        }
    }

    /// Check this answer against the request it claims to resolve.
    ///
    /// The answer field must match the request kind, the other fields must be
    /// absent, and a `choice` must equal one of the offered choices by value.
    pub fn validate_against(&self, request: &HitlRequest) -> Result<(), RejectReason> {
        let ok = match request.kind {
            HitlKind::Question => {
                self.response.is_some() && self.permission.is_none() && self.choice.is_none()
            }
            HitlKind::Permission => {
                self.permission.is_some() && self.response.is_none() && self.choice.is_none()
            }
            HitlKind::Choice => {
                let in_set = match (&self.choice, &request.choices) {
                    (Some(selected), Some(choices)) => choices.contains(selected),
                    _ => false,
                };
                in_set && self.response.is_none() && self.permission.is_none()
            }
        };
        if ok {
            Ok(())
        } else {
            Err(RejectReason::ShapeMismatch)
        }
    }
}

/// What the relay writes to the agent's declared endpoint: the answer fields
/// flattened next to `respondedAt`, plus the originating event echoed back so
/// the agent self-identifies the request without a hub lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    #[serde(flatten)]
    pub response: HitlResponse,
    pub responded_at: DateTime<Utc>,
    pub hook_event: crate::event::Event,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choice_request(choices: &[&str]) -> HitlRequest {
        HitlRequest {
            question: "Which test runner?".into(),
            response_address: "tcp://127.0.0.1:9999".into(),
            requires_response: true,
            kind: HitlKind::Choice,
            choices: Some(choices.iter().map(|c| (*c).to_owned()).collect()),
            timeout_seconds: 30,
        }
    }

    #[test]
    fn wire_names_are_fixed() {
        let request = choice_request(&["Vitest", "Mocha"]);
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"responseWebSocketUrl\""));
        assert!(json.contains("\"requiresResponse\":true"));
        assert!(json.contains("\"timeoutSeconds\":30"));

        let status = HitlStatus::responded(HitlResponse::permission(true), Utc::now());
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"respondedAt\""));
        assert!(json.contains("\"state\":\"responded\""));
    }

    #[test]
    fn requires_response_defaults_true() {
        let json = r#"{
            "question": "Proceed?",
            "responseWebSocketUrl": "tcp://127.0.0.1:1",
            "kind": "permission",
            "timeoutSeconds": 5
        }"#;
        let request: HitlRequest = serde_json::from_str(json).unwrap();
        assert!(request.requires_response);
        assert_eq!(request.kind, HitlKind::Permission);
    }

    #[test]
    fn pending_status_omits_empty_fields() {
        let json = serde_json::to_string(&HitlStatus::pending()).unwrap();
        assert_eq!(json, r#"{"state":"pending"}"#);
    }

    #[test]
    fn choice_outside_offered_set_is_shape_mismatch() {
        let request = choice_request(&["Vitest", "Mocha"]);
        let err = HitlResponse::choice("Jest")
            .validate_against(&request)
            .unwrap_err();
        assert_eq!(err, RejectReason::ShapeMismatch);
        assert!(HitlResponse::choice("Mocha").validate_against(&request).is_ok());
    }

    #[test]
    fn answer_field_must_match_kind() {
        let mut request = choice_request(&["a"]);
        request.kind = HitlKind::Permission;
        request.choices = None;

        assert!(HitlResponse::permission(false).validate_against(&request).is_ok());
        assert!(HitlResponse::text("yes").validate_against(&request).is_err());

        // extra fields alongside the right one are rejected too
        let mixed = HitlResponse {
            permission: Some(true),
            choice: Some("a".into()),
            response: None,
        };
        assert!(mixed.validate_against(&request).is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!HitlState::Pending.is_terminal());
        assert!(HitlState::Responded.is_terminal());
        assert!(HitlState::Timeout.is_terminal());
        assert!(HitlState::Error.is_terminal());
    }
}
