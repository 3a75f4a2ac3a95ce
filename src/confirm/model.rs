//! Pending confirmation records and the WebSocket event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ConfirmationRequest, Decision};

/// Lifecycle of a confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    /// Waiting for the user.
    Pending,
    Accepted,
    Declined,
    /// Nobody answered in time, or the asker gave up.
    Expired,
}

impl From<Decision> for ConfirmationStatus {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Accept => Self::Accepted,
            Decision::Decline => Self::Declined,
        }
    }
}

/// A prompt sent to a conversation and the answer it is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub id: Uuid,
    #[serde(flatten)]
    pub request: ConfirmationRequest,
    pub prompt: String,
    pub status: ConfirmationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingConfirmation {
    pub fn new(request: ConfirmationRequest, ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            prompt: request.prompt(),
            request,
            status: ConfirmationStatus::Pending,
            created_at: now,
            expires_at: now + ttl,
            updated_at: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Server to client events on the confirmation feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfirmEvent {
    /// A new prompt is waiting.
    NewConfirmation { confirmation: PendingConfirmation },
    /// A prompt was answered.
    ConfirmationUpdate { id: Uuid, status: ConfirmationStatus },
    ConfirmationExpired { id: Uuid },
    /// Every pending prompt (sent on connect and after lag).
    ConfirmationsSync {
        confirmations: Vec<PendingConfirmation>,
    },
}

/// Client to server actions on the confirmation feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    Accept { id: Uuid },
    Decline { id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intents::IntentKind;

    fn request() -> ConfirmationRequest {
        ConfirmationRequest {
            message_key: "wamid.1".into(),
            sender: "5491".into(),
            sequence_index: 0,
            position: 1,
            total: 1,
            kind: IntentKind::Expense,
            fields: vec![("Total".into(), "6000".into())],
        }
    }

    #[test]
    fn new_confirmation_is_pending() {
        let c = PendingConfirmation::new(request(), chrono::Duration::minutes(5));
        assert_eq!(c.status, ConfirmationStatus::Pending);
        assert!(!c.is_expired());
        assert!(c.prompt.starts_with("Expense"));

        let stale = PendingConfirmation::new(request(), chrono::Duration::zero());
        assert!(stale.is_expired());
    }

    #[test]
    fn event_wire_format() {
        let c = PendingConfirmation::new(request(), chrono::Duration::minutes(5));
        let json = serde_json::to_string(&ConfirmEvent::NewConfirmation { confirmation: c }).unwrap();
        assert!(json.contains("\"type\":\"new_confirmation\""));
        assert!(json.contains("\"message_key\":\"wamid.1\""));
        assert!(json.contains("\"kind\":\"expense\""));

        let action: ClientAction = serde_json::from_str(&format!(
            "{{\"action\":\"decline\",\"id\":\"{}\"}}",
            Uuid::nil()
        ))
        .unwrap();
        assert!(matches!(action, ClientAction::Decline { id } if id.is_nil()));
    }
}
