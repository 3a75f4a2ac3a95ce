//! Chat transport: inbound message shapes, outbound replies, media download.

pub mod types;
pub mod webhook;
pub mod whatsapp;

use async_trait::async_trait;
use tracing::info;

pub use types::{Attachment, InboundMessage};
pub use webhook::parse_webhook;
pub use whatsapp::WhatsAppClient;

use crate::error::ChannelError;

/// A quick-reply option shown under a confirmation prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyButton {
    pub id: String,
    pub title: String,
}

impl ReplyButton {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

/// Outbound side of a conversation. Delivery is fire-and-forget from the
/// engine's point of view: a failure here never rolls back a commit.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Ask the user something and offer quick-reply buttons.
    async fn send_confirmation(
        &self,
        to: &str,
        text: &str,
        options: &[ReplyButton],
    ) -> Result<(), ChannelError>;

    /// Report what was done.
    async fn send_result_summary(&self, to: &str, text: &str) -> Result<(), ChannelError>;
}

/// Downloads attachment bytes by transport media id.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, media_id: &str) -> Result<Vec<u8>, ChannelError>;
}

/// Reply sink that only logs; used when no transport token is configured.
#[derive(Debug, Default, Clone)]
pub struct LogReplySink;

#[async_trait]
impl ReplySink for LogReplySink {
    async fn send_confirmation(
        &self,
        to: &str,
        text: &str,
        options: &[ReplyButton],
    ) -> Result<(), ChannelError> {
        let options: Vec<&str> = options.iter().map(|o| o.title.as_str()).collect();
        info!(to, text, ?options, "Confirmation prompt (not delivered)");
        Ok(())
    }

    async fn send_result_summary(&self, to: &str, text: &str) -> Result<(), ChannelError> {
        info!(to, text, "Result summary (not delivered)");
        Ok(())
    }
}

/// Split `text` into chunks of at most `max_len` bytes, preferring line
/// then word boundaries.
pub(crate) fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut end = max_len;
        while !remaining.is_char_boundary(end) {
            end -= 1;
        }
        let chunk = &remaining[..end];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .filter(|i| *i > 0)
            .unwrap_or(end);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
