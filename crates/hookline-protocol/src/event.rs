//! The event envelope agents POST to the hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::hitl::{HitlKind, HitlRequest, HitlStatus};

/// Server-assigned, monotonically increasing identifier. The authoritative
/// ordering and correlation key; agent timestamps are display-only.
pub type EventId = u64;

/// An immutable fact about agent activity, optionally carrying a
/// human-in-the-loop request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Absent on ingestion; assigned by the store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,
    pub source_app: String,
    pub session_id: String,
    pub hook_event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Agent-supplied capture time. Not trusted for ordering.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hitl_request: Option<HitlRequest>,
    /// Present iff `hitl_request` is; stamped `pending` by the store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hitl_status: Option<HitlStatus>,
}

impl Event {
    pub fn new(
        source_app: impl Into<String>,
        session_id: impl Into<String>,
        hook_event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            source_app: source_app.into(),
            session_id: session_id.into(),
            hook_event_type: hook_event_type.into(),
            payload,
            timestamp: Some(Utc::now()),
            hitl_request: None,
            hitl_status: None,
        }
    }

    pub fn with_hitl_request(mut self, request: HitlRequest) -> Self {
        self.hitl_request = Some(request);
        self
    }

    /// Boundary validation applied by the hub before anything is stored.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.source_app.trim().is_empty() {
            return Err(IngestError::MissingField("sourceApp"));
        }
        if self.session_id.trim().is_empty() {
            return Err(IngestError::MissingField("sessionId"));
        }
        if self.hook_event_type.trim().is_empty() {
            return Err(IngestError::MissingField("hookEventType"));
        }

        if let Some(request) = &self.hitl_request {
            if request.question.trim().is_empty() {
                return Err(IngestError::MissingField("question"));
            }
            if request.response_address.trim().is_empty() {
                return Err(IngestError::MissingField("responseWebSocketUrl"));
            }
            if request.timeout_seconds == 0 {
                return Err(IngestError::InvalidTimeout);
            }
            match (&request.kind, &request.choices) {
                (HitlKind::Choice, Some(choices)) if !choices.is_empty() => {}
                (HitlKind::Choice, _) => return Err(IngestError::EmptyChoices),
                (_, Some(_)) => return Err(IngestError::UnexpectedChoices),
                (_, None) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hitl::HitlRequest;
    use serde_json::json;

    fn hitl_request(kind: HitlKind, choices: Option<Vec<String>>) -> HitlRequest {
        HitlRequest {
            question: "Allow rm -rf /tmp/x?".into(),
            response_address: "tcp://127.0.0.1:4821".into(),
            requires_response: true,
            kind,
            choices,
            timeout_seconds: 5,
        }
    }

    #[test]
    fn plain_event_roundtrip() {
        let event = Event::new("agent", "s1", "PostToolUse", json!({"tool": "Bash"}));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"sourceApp\":\"agent\""));
        assert!(json.contains("\"sessionId\":\"s1\""));
        assert!(json.contains("\"hookEventType\":\"PostToolUse\""));
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.source_app, "agent");
        assert!(back.hitl_request.is_none());
    }

    #[test]
    fn validate_rejects_blank_identity_fields() {
        let mut event = Event::new("", "s1", "Stop", json!({}));
        assert!(matches!(
            event.validate(),
            Err(IngestError::MissingField("sourceApp"))
        ));
        event.source_app = "agent".into();
        event.session_id = "  ".into();
        assert!(matches!(
            event.validate(),
            Err(IngestError::MissingField("sessionId"))
        ));
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut request = hitl_request(HitlKind::Permission, None);
        request.timeout_seconds = 0;
        let event = Event::new("agent", "s1", "Notification", json!({})).with_hitl_request(request);
        assert!(matches!(event.validate(), Err(IngestError::InvalidTimeout)));
    }

    #[test]
    fn validate_requires_choices_for_choice_kind_only() {
        let no_choices = Event::new("agent", "s1", "Notification", json!({}))
            .with_hitl_request(hitl_request(HitlKind::Choice, None));
        assert!(matches!(no_choices.validate(), Err(IngestError::EmptyChoices)));

        let empty = Event::new("agent", "s1", "Notification", json!({}))
            .with_hitl_request(hitl_request(HitlKind::Choice, Some(vec![])));
        assert!(matches!(empty.validate(), Err(IngestError::EmptyChoices)));

        let stray = Event::new("agent", "s1", "Notification", json!({}))
            .with_hitl_request(hitl_request(HitlKind::Question, Some(vec!["a".into()])));
        assert!(matches!(stray.validate(), Err(IngestError::UnexpectedChoices)));

        let ok = Event::new("agent", "s1", "Notification", json!({}))
            .with_hitl_request(hitl_request(HitlKind::Choice, Some(vec!["a".into()])));
        assert!(ok.validate().is_ok());
    }
}
