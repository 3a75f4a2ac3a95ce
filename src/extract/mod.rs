//! Intent extraction: one inbound message in, an ordered list of raw
//! intents out.
//!
//! Voice notes without a transport transcript are transcribed first, and
//! downloaded images go to the classifier as image parts. Requests the
//! sender left incomplete shortly before are prepended as context so a
//! follow-up message can complete them.

pub mod parse;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{debug, warn};

pub use parse::{extract_json, parse_intents};

use crate::categories::CATEGORIES;
use crate::channels::InboundMessage;
use crate::error::PipelineError;
use crate::intents::RawIntent;
use crate::llm::{ChatMessage, CompletionRequest, FinishReason, LlmProvider, image_data_url};
use crate::store::IncompleteRequest;

#[async_trait]
pub trait IntentExtractor: Send + Sync {
    /// Classify `message`. `earlier` holds the sender's open incomplete
    /// requests, oldest first.
    async fn extract(
        &self,
        message: &InboundMessage,
        earlier: &[IncompleteRequest],
    ) -> Result<Vec<RawIntent>, PipelineError>;
}

/// Classifies messages with a chat model.
pub struct LlmExtractor {
    llm: Arc<dyn LlmProvider>,
}

impl LlmExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

const SCHEMAS: &str = r#"Intent types and payload fields (* = required):
- "new-rescue": name*, species*, age, coat_colors [{color, percentage}], health_condition, status, location, person
- "status-change": animal_name* (or animal_id), status*, location*, person, date
- "vet-visit": animal_name, vet, date, diagnosis, treatment, next_appointment, companion, provider, payment_method, responsible_party, items [line item]
- "expense": date, provider, responsible_party, payment_method, items* [line item]
- "movement-tracking": direction* ("departure" | "return"), destination* ("park" | "vet" | "shopping" | "adoption-handover"), animals* (list of names, or ["all"]), responsible, date, notes
- "inquiry": topic*, animal_name, suggested_answer

A line item is {amount*, category_id*, description*, animal_name}. Only set
animal_name on an item when the text ties that cost to one animal."#;

/// System prompt for one classification call.
pub fn system_prompt(today: NaiveDate) -> String {
    let categories = CATEGORIES
        .iter()
        .map(|c| format!("{} = {}", c.id, c.code))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "You record events for an animal shelter. A message may describe several \
         things at once; return one intent per thing, in the order they appear.\n\n\
         {SCHEMAS}\n\n\
         Expense categories: {categories}.\n\
         Today is {today}. Write dates as YYYY-MM-DD and amounts as plain numbers.\n\
         Attached images are usually receipts or animal photos; read amounts, items \
         and providers from them.\n\
         A block marked [Earlier request: ...] is something the sender started but \
         left incomplete. If this message supplies what was missing, return that \
         request complete, merging the data already provided.\n\n\
         Respond with JSON only: {{\"intents\": [{{\"type\": \"...\", \"payload\": {{...}}}}]}}. \
         If nothing should be recorded, return {{\"intents\": []}}."
    )
}

/// Context block for requests the sender left incomplete.
pub fn earlier_context(earlier: &[IncompleteRequest]) -> String {
    earlier
        .iter()
        .map(|r| {
            format!(
                "[Earlier request: {} - incomplete]\nAlready provided: {}\nMissing: {}",
                r.kind,
                r.payload,
                r.missing_fields.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

impl LlmExtractor {
    /// Fill in transcripts for voice notes the transport did not transcribe.
    async fn transcribe_voice_notes(&self, message: &mut InboundMessage) {
        for attachment in message.attachments.iter_mut() {
            if !attachment.is_audio() || attachment.transcript.is_some() {
                continue;
            }
            let Some(audio) = attachment.data.as_deref() else {
                continue;
            };
            match self.llm.transcribe(audio, &attachment.mime_type).await {
                Ok(text) => attachment.transcript = Some(text),
                Err(e) => warn!(sender = %message.sender, error = %e, "Voice note not transcribed"),
            }
        }
    }
}

#[async_trait]
impl IntentExtractor for LlmExtractor {
    async fn extract(
        &self,
        message: &InboundMessage,
        earlier: &[IncompleteRequest],
    ) -> Result<Vec<RawIntent>, PipelineError> {
        let mut message = message.clone();
        self.transcribe_voice_notes(&mut message).await;

        let images: Vec<String> = message
            .attachments
            .iter()
            .filter(|a| a.is_image())
            .filter_map(|a| a.data.as_deref().map(|bytes| image_data_url(bytes, &a.mime_type)))
            .collect();
        let text = message.full_text();
        if text.trim().is_empty() && images.is_empty() {
            return Ok(Vec::new());
        }

        let content = if earlier.is_empty() {
            text
        } else {
            format!("{}\n\n{text}", earlier_context(earlier))
        };
        let user = images
            .into_iter()
            .fold(ChatMessage::user(content), |m, url| m.with_image(url));

        let request = CompletionRequest::new(vec![
            ChatMessage::system(system_prompt(chrono::Local::now().date_naive())),
            user,
        ])
        .with_temperature(0.1)
        .with_max_tokens(1500)
        .with_json_mode();

        let response = self.llm.complete(request).await?;
        if response.finish_reason == FinishReason::Length {
            warn!(
                model = self.llm.model_name(),
                "Classifier reply truncated; parsing what arrived"
            );
        }

        let intents = parse_intents(&response.content)?;
        debug!(
            sender = %message.sender,
            count = intents.len(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Intents extracted"
        );
        Ok(intents)
    }
}
