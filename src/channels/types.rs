//! Inbound message shapes shared by every transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A media item attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Transport media id, used to download the bytes.
    pub media_id: Option<String>,
    pub mime_type: String,
    pub caption: Option<String>,
    /// Transcript supplied by the transport for voice notes.
    pub transcript: Option<String>,
    /// Raw bytes once downloaded.
    #[serde(skip)]
    pub data: Option<Vec<u8>>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }
}

/// One message received from a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Transport message id, when the transport assigns one.
    pub id: Option<String>,
    /// Conversation / phone number the message came from.
    pub sender: String,
    pub text: String,
    /// Id of the quick-reply button pressed, if this is a button reply.
    pub reply: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: None,
            sender: sender.into(),
            text: text.into(),
            reply: None,
            attachments: Vec::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_reply(mut self, button_id: impl Into<String>) -> Self {
        self.reply = Some(button_id.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Identity used to detect redelivery.
    ///
    /// The transport id when present; otherwise a name-based UUID over the
    /// sender, the text and the attachment ids, so the same content from the
    /// same sender maps to the same key.
    pub fn message_key(&self) -> String {
        if let Some(id) = self.id.as_deref().filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        let mut material = format!("{}\n{}", self.sender, self.text.trim());
        for a in &self.attachments {
            material.push('\n');
            material.push_str(a.media_id.as_deref().unwrap_or(&a.mime_type));
        }
        format!(
            "content:{}",
            Uuid::new_v5(&Uuid::NAMESPACE_OID, material.as_bytes())
        )
    }

    /// The first image attachment with downloaded bytes.
    pub fn photo(&self) -> Option<&Attachment> {
        self.attachments
            .iter()
            .find(|a| a.is_image() && a.data.is_some())
    }

    /// Text plus captions and transcripts, as the extractor sees it.
    pub fn full_text(&self) -> String {
        let mut parts = Vec::new();
        if !self.text.trim().is_empty() {
            parts.push(self.text.trim().to_string());
        }
        for a in &self.attachments {
            if let Some(c) = a.caption.as_deref().filter(|c| !c.trim().is_empty()) {
                parts.push(c.trim().to_string());
            }
            if let Some(t) = a.transcript.as_deref().filter(|t| !t.trim().is_empty()) {
                parts.push(format!("[voice note] {}", t.trim()));
            }
        }
        parts.join("\n")
    }
}
