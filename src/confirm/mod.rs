//! Per-intent confirmation: the prompt, the user's answer, and the queue of
//! prompts still waiting for one.

pub mod model;
pub mod queue;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use model::{ClientAction, ConfirmEvent, ConfirmationStatus, PendingConfirmation};
pub use queue::{ConfirmationQueue, spawn_expiry_task};

use crate::channels::ReplyButton;
use crate::error::PipelineError;
use crate::intents::{Intent, IntentKind};

pub const CONFIRM_YES: &str = "confirm_yes";
pub const CONFIRM_NO: &str = "confirm_no";

/// The user's answer to one confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Decline,
}

/// Everything needed to ask about one intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub message_key: String,
    /// Conversation the prompt goes to.
    pub sender: String,
    pub sequence_index: usize,
    /// 1-based position among the message's valid intents, and their count.
    pub position: usize,
    pub total: usize,
    pub kind: IntentKind,
    pub fields: Vec<(String, String)>,
}

impl ConfirmationRequest {
    pub fn for_intent(
        message_key: &str,
        sender: &str,
        sequence_index: usize,
        position: usize,
        total: usize,
        intent: &Intent,
    ) -> Self {
        Self {
            message_key: message_key.to_string(),
            sender: sender.to_string(),
            sequence_index,
            position,
            total,
            kind: intent.kind(),
            fields: intent.confirmation_fields(),
        }
    }

    /// Prompt text shown to the user.
    pub fn prompt(&self) -> String {
        let mut out = if self.total > 1 {
            format!("{} ({}/{})", self.kind.title(), self.position, self.total)
        } else {
            self.kind.title().to_string()
        };
        for (label, value) in &self.fields {
            out.push_str(&format!("\n• {label}: {value}"));
        }
        out.push_str("\n\nSave this?");
        out
    }

    pub fn buttons() -> Vec<ReplyButton> {
        vec![
            ReplyButton::new(CONFIRM_YES, "Yes"),
            ReplyButton::new(CONFIRM_NO, "No"),
        ]
    }
}

/// Asks the user to accept or decline one intent.
///
/// The caller bounds the wait; dropping the future abandons the prompt.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn ask(&self, request: ConfirmationRequest) -> Result<Decision, PipelineError>;
}

const YES_WORDS: &[&str] = &[
    "yes", "y", "si", "sí", "ok", "okay", "yep", "confirm", "confirmar", "dale", "adelante",
    "go",
];
const NO_WORDS: &[&str] = &["no", "n", "nope", "cancel", "cancelar", "abortar"];
const NO_PHRASES: &[&str] = &["no thanks", "no gracias"];

/// Interpret a button id or a free-text reply.
pub fn parse_reply(reply: &str) -> Option<Decision> {
    let folded = reply.trim().to_lowercase();
    match folded.as_str() {
        CONFIRM_YES => return Some(Decision::Accept),
        CONFIRM_NO => return Some(Decision::Decline),
        _ => {}
    }

    let words: Vec<&str> = folded
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '.' | '!' | '?' | '¡' | '¿'))
        .filter(|w| !w.is_empty())
        .collect();
    let first_two = words.iter().take(2).copied().collect::<Vec<_>>().join(" ");
    if NO_PHRASES.contains(&first_two.as_str()) {
        return Some(Decision::Decline);
    }
    let first = words.first()?;
    if YES_WORDS.contains(first) {
        Some(Decision::Accept)
    } else if NO_WORDS.contains(first) {
        Some(Decision::Decline)
    } else {
        None
    }
}
