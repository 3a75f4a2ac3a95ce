//! WhatsApp Cloud API client: text and button replies, media download.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::debug;

use super::{MediaFetcher, ReplyButton, ReplySink, split_message};
use crate::error::ChannelError;

const DEFAULT_GRAPH_URL: &str = "https://graph.facebook.com/v21.0";
/// Maximum text body length for a text message.
const MAX_TEXT_LENGTH: usize = 4096;
/// Interactive bodies are shorter than plain text.
const MAX_INTERACTIVE_BODY: usize = 1024;
const MAX_BUTTONS: usize = 3;
const MAX_BUTTON_TITLE: usize = 20;

pub struct WhatsAppClient {
    phone_number_id: String,
    access_token: SecretString,
    base_url: String,
    client: reqwest::Client,
}

impl WhatsAppClient {
    pub fn new(phone_number_id: String, access_token: SecretString) -> Self {
        Self {
            phone_number_id,
            access_token,
            base_url: DEFAULT_GRAPH_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the client at another Graph API root (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/{}/messages", self.base_url, self.phone_number_id)
    }

    async fn post_message(&self, body: serde_json::Value) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(self.messages_url())
            .bearer_auth(self.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;
        check_status(resp).await.map(|_| ())
    }

    /// Send plain text, split into several messages when too long.
    pub async fn send_text(&self, to: &str, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, MAX_TEXT_LENGTH) {
            self.post_message(text_body(to, &chunk)).await?;
        }
        debug!(to, "WhatsApp text sent");
        Ok(())
    }

    /// Send text with up to three quick-reply buttons.
    pub async fn send_buttons(
        &self,
        to: &str,
        text: &str,
        buttons: &[ReplyButton],
    ) -> Result<(), ChannelError> {
        if buttons.is_empty() {
            return self.send_text(to, text).await;
        }
        if text.len() > MAX_INTERACTIVE_BODY {
            // Too long for an interactive body: text first, then the buttons
            // under a short prompt.
            self.send_text(to, text).await?;
            return self.post_message(buttons_body(to, "Confirm?", buttons)).await;
        }
        self.post_message(buttons_body(to, text, buttons)).await?;
        debug!(to, buttons = buttons.len(), "WhatsApp buttons sent");
        Ok(())
    }

    /// Download media bytes: resolve the media id to a URL, then fetch it.
    pub async fn download_media(&self, media_id: &str) -> Result<Vec<u8>, ChannelError> {
        let resp = self
            .client
            .get(format!("{}/{media_id}", self.base_url))
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;
        let meta: serde_json::Value = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| ChannelError::InvalidMessage(format!("media metadata: {e}")))?;
        let url = meta
            .get("url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| ChannelError::InvalidMessage(format!("media {media_id} has no url")))?;

        let resp = self
            .client
            .get(url)
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;
        let bytes = check_status(resp)
            .await?
            .bytes()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;
        debug!(media_id, size = bytes.len(), "Media downloaded");
        Ok(bytes.to_vec())
    }
}

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: "whatsapp".into(),
        reason,
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ChannelError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ChannelError::AuthFailed {
            name: "whatsapp".into(),
            reason: format!("{status}: {body}"),
        });
    }
    Err(send_failed(format!("{status}: {body}")))
}

fn text_body(to: &str, text: &str) -> serde_json::Value {
    json!({
        "messaging_product": "whatsapp",
        "to": to,
        "type": "text",
        "text": { "body": text }
    })
}

fn buttons_body(to: &str, text: &str, buttons: &[ReplyButton]) -> serde_json::Value {
    let buttons: Vec<serde_json::Value> = buttons
        .iter()
        .take(MAX_BUTTONS)
        .map(|b| {
            json!({
                "type": "reply",
                "reply": {
                    "id": b.id,
                    "title": b.title.chars().take(MAX_BUTTON_TITLE).collect::<String>()
                }
            })
        })
        .collect();
    json!({
        "messaging_product": "whatsapp",
        "to": to,
        "type": "interactive",
        "interactive": {
            "type": "button",
            "body": { "text": text },
            "action": { "buttons": buttons }
        }
    })
}

#[async_trait]
impl ReplySink for WhatsAppClient {
    async fn send_confirmation(
        &self,
        to: &str,
        text: &str,
        options: &[ReplyButton],
    ) -> Result<(), ChannelError> {
        self.send_buttons(to, text, options).await
    }

    async fn send_result_summary(&self, to: &str, text: &str) -> Result<(), ChannelError> {
        self.send_text(to, text).await
    }
}

#[async_trait]
impl MediaFetcher for WhatsAppClient {
    async fn fetch(&self, media_id: &str) -> Result<Vec<u8>, ChannelError> {
        self.download_media(media_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_shape() {
        let body = text_body("5491", "hola");
        assert_eq!(body["type"], "text");
        assert_eq!(body["text"]["body"], "hola");
        assert_eq!(body["messaging_product"], "whatsapp");
    }

    #[test]
    fn button_payload_is_capped() {
        let buttons: Vec<ReplyButton> = (0..5)
            .map(|i| ReplyButton::new(format!("b{i}"), "a very long button title indeed"))
            .collect();
        let body = buttons_body("5491", "Confirm?", &buttons);
        let rendered = body["interactive"]["action"]["buttons"].as_array().unwrap();
        assert_eq!(rendered.len(), MAX_BUTTONS);
        assert_eq!(
            rendered[0]["reply"]["title"].as_str().unwrap().chars().count(),
            MAX_BUTTON_TITLE
        );
        assert_eq!(rendered[2]["reply"]["id"], "b2");
    }

    #[test]
    fn urls() {
        let client = WhatsAppClient::new("12345".into(), SecretString::from("token"))
            .with_base_url("http://localhost:9999/");
        assert_eq!(client.messages_url(), "http://localhost:9999/12345/messages");
    }
}
