//! Chat webhook: verification handshake and inbound delivery.

use std::collections::HashMap;

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::AppState;
use crate::channels::{InboundMessage, parse_webhook};
use crate::error::Error;

/// `GET /webhook`: echo `hub.challenge` when the verify token matches.
pub async fn verify(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    match (&state.verify_token, mode, token) {
        (Some(expected), Some("subscribe"), Some(token)) if token == expected => {
            info!("Webhook verified");
            (StatusCode::OK, challenge)
        }
        _ => {
            warn!("Webhook verification refused");
            (StatusCode::FORBIDDEN, String::new())
        }
    }
}

/// `POST /webhook`: answers to open prompts resolve them inline; every
/// other message is processed in the background. Always acknowledges
/// quickly so the transport does not redeliver.
pub async fn receive(State(state): State<AppState>, Json(body): Json<Value>) -> impl IntoResponse {
    let messages = match parse_webhook(&body) {
        Ok(messages) => messages,
        Err(e) => {
            warn!(error = %e, "Unreadable webhook payload");
            return StatusCode::OK;
        }
    };

    for message in messages {
        let answer = message.reply.as_deref().unwrap_or(&message.text);
        if let Some(id) = state.queue.answer_from_reply(&message.sender, answer).await {
            debug!(confirmation_id = %id, sender = %message.sender, "Reply answered a confirmation");
            continue;
        }
        let state = state.clone();
        tokio::spawn(async move {
            handle_message(state, message).await;
        });
    }
    StatusCode::OK
}

/// Download attachment bytes, extract intents and run the sequencer.
///
/// The sender's recent incomplete requests go to the extractor as context
/// and are closed once the follow-up message has been processed.
pub async fn handle_message(state: AppState, mut message: InboundMessage) {
    if let Some(fetcher) = &state.media_fetcher {
        for attachment in message
            .attachments
            .iter_mut()
            .filter(|a| a.is_image() || (a.is_audio() && a.transcript.is_none()))
        {
            let Some(media_id) = attachment.media_id.as_deref() else {
                continue;
            };
            match fetcher.fetch(media_id).await {
                Ok(bytes) => attachment.data = Some(bytes),
                Err(e) => warn!(media_id, error = %e, "Attachment download failed"),
            }
        }
    }

    let since = Utc::now() - state.incomplete_window;
    let earlier = match state.ledger.open_incomplete(&message.sender, since).await {
        Ok(earlier) => earlier,
        Err(e) => {
            warn!(sender = %message.sender, error = %e, "Incomplete requests unavailable");
            Vec::new()
        }
    };

    let intents = match state.extractor.extract(&message, &earlier).await {
        Ok(intents) => intents,
        Err(e) => {
            error!(sender = %message.sender, error = %e, "Intent extraction failed");
            notify(
                &state,
                &message.sender,
                "Sorry, I couldn't read that message. Please try again.",
            )
            .await;
            return;
        }
    };

    match state.sequencer.process(&message, intents).await {
        Ok(_) if !earlier.is_empty() => {
            let ids: Vec<i64> = earlier.iter().map(|r| r.id).collect();
            if let Err(e) = state.ledger.resolve_incomplete(&ids).await {
                warn!(sender = %message.sender, error = %e, "Incomplete requests left open");
            }
        }
        Ok(_) => {}
        Err(Error::Duplicate(e)) => {
            debug!(message_key = %e.key, "Already processed");
        }
        Err(e) => {
            error!(sender = %message.sender, error = %e, "Message processing failed");
            notify(
                &state,
                &message.sender,
                "Something went wrong saving that. Please try again.",
            )
            .await;
        }
    }
}

async fn notify(state: &AppState, to: &str, text: &str) {
    if let Err(e) = state.replies.send_result_summary(to, text).await {
        warn!(to, error = %e, "Reply not delivered");
    }
}
