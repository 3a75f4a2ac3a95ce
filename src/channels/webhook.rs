//! WhatsApp webhook payload parsing.
//!
//! Only `entry[].changes[].value.messages[]` matters here; status callbacks
//! and unsupported message types are skipped.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use super::types::{Attachment, InboundMessage};
use crate::error::ChannelError;

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    entry: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(default)]
    changes: Vec<Change>,
}

#[derive(Debug, Deserialize)]
struct Change {
    #[serde(default)]
    value: ChangeValue,
}

#[derive(Debug, Default, Deserialize)]
struct ChangeValue {
    #[serde(default)]
    messages: Vec<WaMessage>,
}

#[derive(Debug, Deserialize)]
struct WaMessage {
    from: String,
    id: Option<String>,
    timestamp: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    text: Option<WaText>,
    interactive: Option<WaInteractive>,
    button: Option<WaButton>,
    image: Option<WaMedia>,
    document: Option<WaMedia>,
    audio: Option<WaMedia>,
}

#[derive(Debug, Deserialize)]
struct WaText {
    body: String,
}

#[derive(Debug, Deserialize)]
struct WaInteractive {
    button_reply: Option<WaButtonReply>,
}

#[derive(Debug, Deserialize)]
struct WaButtonReply {
    id: String,
    #[serde(default)]
    title: String,
}

/// Template quick-reply buttons arrive as `button` instead of `interactive`.
#[derive(Debug, Deserialize)]
struct WaButton {
    payload: Option<String>,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct WaMedia {
    id: Option<String>,
    mime_type: Option<String>,
    caption: Option<String>,
    transcript: Option<String>,
}

impl WaMedia {
    fn into_attachment(self, default_mime: &str) -> Attachment {
        Attachment {
            media_id: self.id,
            mime_type: self.mime_type.unwrap_or_else(|| default_mime.to_string()),
            caption: self.caption,
            transcript: self.transcript,
            data: None,
        }
    }
}

/// Parse a webhook body into inbound messages.
pub fn parse_webhook(body: &serde_json::Value) -> Result<Vec<InboundMessage>, ChannelError> {
    let payload: WebhookPayload = serde_json::from_value(body.clone())
        .map_err(|e| ChannelError::InvalidMessage(format!("webhook payload: {e}")))?;

    let mut out = Vec::new();
    for message in payload
        .entry
        .into_iter()
        .flat_map(|e| e.changes)
        .flat_map(|c| c.value.messages)
    {
        if let Some(parsed) = convert(message) {
            out.push(parsed);
        }
    }
    Ok(out)
}

fn convert(m: WaMessage) -> Option<InboundMessage> {
    let received_at = m
        .timestamp
        .as_deref()
        .and_then(|t| t.parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    let mut msg = InboundMessage::new(m.from, "");
    msg.id = m.id;
    msg.received_at = received_at;

    match m.kind.as_str() {
        "text" => msg.text = m.text?.body,
        "interactive" => {
            let reply = m.interactive?.button_reply?;
            msg.text = reply.title;
            msg.reply = Some(reply.id);
        }
        "button" => {
            let button = m.button?;
            msg.reply = button.payload;
            msg.text = button.text;
        }
        "image" => msg.attachments.push(m.image?.into_attachment("image/jpeg")),
        "document" => msg
            .attachments
            .push(m.document?.into_attachment("application/octet-stream")),
        "audio" => msg.attachments.push(m.audio?.into_attachment("audio/ogg")),
        other => {
            debug!(kind = other, "Skipping unsupported message type");
            return None;
        }
    }
    Some(msg)
}
