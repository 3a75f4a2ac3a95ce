//! Confirmation Sequencer: drives one message's intents through
//! validate → confirm → commit, strictly in extraction order.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::channels::{InboundMessage, ReplySink};
use crate::commit::{self, CommitContext, CommitOutcome};
use crate::confirm::{ConfirmationRequest, Confirmer, Decision};
use crate::error::{DuplicateMessageError, Error, ValidationError};
use crate::intents::{self, Intent, IntentKind, RawIntent};
use crate::media::MediaStore;
use crate::store::{Claim, Ledger, MessageStatus, NewIncompleteRequest};

/// Timing knobs for the sequencer.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// How long to wait for an accept/decline before discarding an intent.
    pub confirm_timeout: Duration,
    /// Age after which an unfinished message claim may be taken over.
    pub claim_lease: chrono::Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(300),
            claim_lease: chrono::Duration::seconds(900),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Committed,
    Rejected,
    Invalid,
    Declined,
    TimedOut,
    AlreadyCommitted,
    Failed,
}

/// What happened to one intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntentReport {
    pub sequence_index: usize,
    /// Canonical kind label, or the raw label when it was not recognised.
    pub kind: String,
    pub status: IntentStatus,
    pub detail: Option<String>,
}

impl IntentReport {
    fn new(sequence_index: usize, kind: impl Into<String>, status: IntentStatus) -> Self {
        Self {
            sequence_index,
            kind: kind.into(),
            status,
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn title(&self) -> String {
        IntentKind::parse(&self.kind)
            .map(|k| k.title().to_string())
            .unwrap_or_else(|| "Unrecognised entry".to_string())
    }

    /// An invalid intent the sender can complete in a later message.
    fn can_follow_up(&self) -> bool {
        IntentKind::parse(&self.kind).is_some() && self.detail.as_deref() != Some("payload")
    }

    /// One line of the result summary.
    fn render(&self) -> String {
        let title = self.title();
        let detail = self.detail.as_deref().unwrap_or_default();
        match self.status {
            IntentStatus::Committed => detail.to_string(),
            IntentStatus::Rejected => format!("{title}: not saved ({detail})."),
            IntentStatus::Invalid if self.can_follow_up() => format!(
                "{title}: not saved, missing or invalid: {detail}. Send the missing details to finish it."
            ),
            IntentStatus::Invalid => format!("{title}: not saved, missing or invalid: {detail}."),
            IntentStatus::Declined => format!("{title}: discarded."),
            IntentStatus::TimedOut => format!("{title}: no answer, discarded."),
            IntentStatus::AlreadyCommitted => format!("{title}: already saved earlier."),
            IntentStatus::Failed => format!("{title}: could not be saved, please try again."),
        }
    }
}

/// Outcome of processing one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageReport {
    pub message_key: String,
    pub intents: Vec<IntentReport>,
}

impl MessageReport {
    pub fn count(&self, status: IntentStatus) -> usize {
        self.intents.iter().filter(|i| i.status == status).count()
    }

    /// Text sent back to the conversation.
    pub fn summary(&self) -> String {
        if self.intents.is_empty() {
            return help_text();
        }
        self.intents
            .iter()
            .map(IntentReport::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn help_text() -> String {
    let kinds = IntentKind::ALL
        .iter()
        .map(|k| k.title().to_lowercase())
        .collect::<Vec<_>>()
        .join(", ");
    format!("I didn't find anything to record. I can record: {kinds}.")
}

/// Whether committing this kind may reference the message photo.
fn uses_photo(intent: &Intent) -> bool {
    matches!(
        intent,
        Intent::NewRescue(_) | Intent::Expense(_) | Intent::VetVisit(_)
    )
}

pub struct ConfirmationSequencer {
    ledger: Arc<dyn Ledger>,
    confirmer: Arc<dyn Confirmer>,
    media: Arc<dyn MediaStore>,
    replies: Arc<dyn ReplySink>,
    config: SequencerConfig,
}

impl ConfirmationSequencer {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        confirmer: Arc<dyn Confirmer>,
        media: Arc<dyn MediaStore>,
        replies: Arc<dyn ReplySink>,
        config: SequencerConfig,
    ) -> Self {
        Self {
            ledger,
            confirmer,
            media,
            replies,
            config,
        }
    }

    /// Process one message's extracted intents.
    ///
    /// A redelivered message that was already claimed returns
    /// `Err(Error::Duplicate)` before anything is written.
    pub async fn process(
        &self,
        message: &InboundMessage,
        intents: Vec<RawIntent>,
    ) -> Result<MessageReport, Error> {
        let message_key = message.message_key();

        let resuming = match self
            .ledger
            .claim_message(&message_key, &message.sender, self.config.claim_lease)
            .await?
        {
            Claim::Duplicate => {
                info!(message_key = %message_key, "Duplicate delivery ignored");
                return Err(DuplicateMessageError { key: message_key }.into());
            }
            Claim::TakenOver => {
                info!(message_key = %message_key, "Resuming unfinished message");
                true
            }
            Claim::Acquired => false,
        };

        let report = self.run(message, &message_key, intents, resuming).await;

        let status = if report.count(IntentStatus::Failed) > 0 {
            MessageStatus::Failed
        } else {
            MessageStatus::Completed
        };
        if let Err(e) = self.ledger.finish_message(&message_key, status).await {
            error!(message_key = %message_key, error = %e, "Could not record message status");
        }

        self.reply(&message.sender, &report.summary()).await;
        info!(
            message_key = %message_key,
            intents = report.intents.len(),
            committed = report.count(IntentStatus::Committed),
            status = status.as_str(),
            "Message processed"
        );
        Ok(report)
    }

    async fn run(
        &self,
        message: &InboundMessage,
        message_key: &str,
        intents: Vec<RawIntent>,
        resuming: bool,
    ) -> MessageReport {
        // Only a taken-over claim can have intents that committed before.
        let mut validated: Vec<(RawIntent, Result<Intent, ValidationError>, bool)> =
            Vec::with_capacity(intents.len());
        for raw in intents {
            let checked = intents::validate(&raw);
            let done = resuming
                && checked.is_ok()
                && self.committed_before(message_key, raw.sequence_index).await;
            validated.push((raw, checked, done));
        }
        let total = validated
            .iter()
            .filter(|(_, v, done)| v.is_ok() && !done)
            .count();

        let mut photo = LazyPhoto::new(message, self.media.as_ref());
        let today = chrono::Local::now().date_naive();
        let mut reports = Vec::with_capacity(validated.len());
        let mut position = 0;

        for (raw, checked, done) in validated {
            let intent = match checked {
                Ok(intent) if done => {
                    debug!(message_key, sequence_index = raw.sequence_index, "Intent already committed");
                    reports.push(IntentReport::new(
                        raw.sequence_index,
                        intent.kind().label(),
                        IntentStatus::AlreadyCommitted,
                    ));
                    continue;
                }
                Ok(intent) => intent,
                Err(e) => {
                    warn!(
                        message_key,
                        sequence_index = raw.sequence_index,
                        intent = %e.intent,
                        missing = ?e.missing_fields,
                        "Intent failed validation"
                    );
                    self.keep_incomplete(message, message_key, &raw, &e).await;
                    reports.push(
                        IntentReport::new(raw.sequence_index, e.intent, IntentStatus::Invalid)
                            .with_detail(e.missing_fields.join(", ")),
                    );
                    continue;
                }
            };
            position += 1;
            let kind = intent.kind();
            let report = IntentReport::new(raw.sequence_index, kind.label(), IntentStatus::Failed);

            let request = ConfirmationRequest::for_intent(
                message_key,
                &message.sender,
                raw.sequence_index,
                position,
                total,
                &intent,
            );
            match tokio::time::timeout(self.config.confirm_timeout, self.confirmer.ask(request))
                .await
            {
                Ok(Ok(Decision::Accept)) => {}
                Ok(Ok(Decision::Decline)) => {
                    debug!(message_key, sequence_index = raw.sequence_index, "Intent declined");
                    reports.push(IntentReport {
                        status: IntentStatus::Declined,
                        ..report
                    });
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(message_key, sequence_index = raw.sequence_index, error = %e, "Confirmation failed");
                    reports.push(
                        IntentReport {
                            status: IntentStatus::TimedOut,
                            ..report
                        }
                        .with_detail(e.to_string()),
                    );
                    continue;
                }
                Err(_) => {
                    info!(message_key, sequence_index = raw.sequence_index, "Confirmation timed out");
                    reports.push(IntentReport {
                        status: IntentStatus::TimedOut,
                        ..report
                    });
                    continue;
                }
            }

            let photo_reference = if uses_photo(&intent) {
                photo.reference().await
            } else {
                None
            };
            let ctx = CommitContext {
                message_key,
                sender: &message.sender,
                photo_reference: photo_reference.as_deref(),
                today,
            };

            let report = match commit::commit(self.ledger.as_ref(), &ctx, raw.sequence_index, &intent)
                .await
            {
                Ok(CommitOutcome::Committed { summary, .. }) => IntentReport {
                    status: IntentStatus::Committed,
                    ..report
                }
                .with_detail(summary),
                Ok(CommitOutcome::Rejected { reason }) => IntentReport {
                    status: IntentStatus::Rejected,
                    ..report
                }
                .with_detail(reason),
                Ok(CommitOutcome::AlreadyCommitted) => IntentReport {
                    status: IntentStatus::AlreadyCommitted,
                    ..report
                },
                Err(e) => report.with_detail(e.to_string()),
            };
            reports.push(report);
        }

        MessageReport {
            message_key: message_key.to_string(),
            intents: reports,
        }
    }

    async fn committed_before(&self, message_key: &str, sequence_index: usize) -> bool {
        match self.ledger.intent_committed(message_key, sequence_index).await {
            Ok(done) => done,
            Err(e) => {
                // The commit re-checks inside its transaction.
                warn!(message_key, sequence_index, error = %e, "Could not check earlier commit");
                false
            }
        }
    }

    /// Remember a recognisable but incomplete request so the sender's next
    /// message can complete it.
    async fn keep_incomplete(
        &self,
        message: &InboundMessage,
        message_key: &str,
        raw: &RawIntent,
        error: &ValidationError,
    ) {
        if IntentKind::parse(&error.intent).is_none() || !raw.payload.is_object() {
            return;
        }
        let request = NewIncompleteRequest {
            sender: message.sender.clone(),
            message_key: message_key.to_string(),
            kind: error.intent.clone(),
            payload: raw.payload.clone(),
            missing_fields: error.missing_fields.clone(),
        };
        if let Err(e) = self.ledger.save_incomplete(&request).await {
            warn!(message_key, error = %e, "Incomplete request not kept");
        }
    }

    async fn reply(&self, to: &str, text: &str) {
        if let Err(e) = self.replies.send_result_summary(to, text).await {
            warn!(to, error = %e, "Result summary not delivered");
        }
    }
}

/// Uploads the message photo on first use and remembers the result, so a
/// message with many records stores its photo at most once.
struct LazyPhoto<'a> {
    message: &'a InboundMessage,
    media: &'a dyn MediaStore,
    uploaded: Option<Option<String>>,
}

impl<'a> LazyPhoto<'a> {
    fn new(message: &'a InboundMessage, media: &'a dyn MediaStore) -> Self {
        Self {
            message,
            media,
            uploaded: None,
        }
    }

    async fn reference(&mut self) -> Option<String> {
        if let Some(done) = &self.uploaded {
            return done.clone();
        }
        let result = match self.message.photo() {
            Some(attachment) => {
                let bytes = attachment.data.as_deref().unwrap_or_default();
                match self.media.upload(bytes, &attachment.mime_type).await {
                    Ok(media) => Some(media.url),
                    Err(e) => {
                        warn!(error = %e, "Photo upload failed; saving without it");
                        None
                    }
                }
            }
            None => None,
        };
        self.uploaded = Some(result.clone());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{Attachment, ReplyButton};
    use crate::error::{ChannelError, MediaError, PipelineError};
    use crate::media::MediaRef;
    use crate::store::{LedgerTx, LibSqlBackend};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers prompts from a script; `None` never answers.
    struct ScriptedConfirmer {
        answers: Mutex<VecDeque<Option<Decision>>>,
        asked: Mutex<Vec<ConfirmationRequest>>,
    }

    impl ScriptedConfirmer {
        fn new(answers: Vec<Option<Decision>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                asked: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Confirmer for ScriptedConfirmer {
        async fn ask(&self, request: ConfirmationRequest) -> Result<Decision, PipelineError> {
            self.asked.lock().unwrap().push(request);
            let answer = self.answers.lock().unwrap().pop_front().flatten();
            match answer {
                Some(decision) => Ok(decision),
                None => std::future::pending().await,
            }
        }
    }

    #[derive(Default)]
    struct CountingMedia {
        uploads: AtomicUsize,
    }

    #[async_trait]
    impl MediaStore for CountingMedia {
        async fn upload(&self, _: &[u8], _: &str) -> Result<MediaRef, MediaError> {
            let n = self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(MediaRef {
                url: format!("file:///media/{n}.jpg"),
                reference_id: n.to_string(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingReplies {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReplySink for RecordingReplies {
        async fn send_confirmation(
            &self,
            _: &str,
            text: &str,
            _: &[ReplyButton],
        ) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_result_summary(&self, _: &str, text: &str) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct Harness {
        ledger: Arc<LibSqlBackend>,
        confirmer: Arc<ScriptedConfirmer>,
        media: Arc<CountingMedia>,
        replies: Arc<RecordingReplies>,
        sequencer: ConfirmationSequencer,
    }

    async fn harness(answers: Vec<Option<Decision>>) -> Harness {
        let ledger = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        ledger.run_migrations().await.unwrap();
        let confirmer = ScriptedConfirmer::new(answers);
        let media = Arc::new(CountingMedia::default());
        let replies = Arc::new(RecordingReplies::default());
        let sequencer = ConfirmationSequencer::new(
            ledger.clone(),
            confirmer.clone(),
            media.clone(),
            replies.clone(),
            SequencerConfig {
                confirm_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );
        Harness {
            ledger,
            confirmer,
            media,
            replies,
            sequencer,
        }
    }

    fn food(amount: i64) -> RawIntent {
        RawIntent::new(
            0,
            "expense",
            json!({"items": [{"amount": amount, "category_id": 2, "description": "kibble"}]}),
        )
    }

    fn message(text: &str) -> InboundMessage {
        InboundMessage::new("5491100000000", text).with_id(format!("wamid.{text}"))
    }

    #[tokio::test]
    async fn accepted_expense_commits() {
        let h = harness(vec![Some(Decision::Accept)]).await;
        let report = h
            .sequencer
            .process(&message("food"), vec![food(6000)])
            .await
            .unwrap();

        assert_eq!(report.intents[0].status, IntentStatus::Committed);
        assert_eq!(h.ledger.count_expenses().await.unwrap(), 1);
        assert_eq!(
            h.ledger.message_status("wamid.food").await.unwrap(),
            Some(MessageStatus::Completed)
        );
        let sent = h.replies.sent.lock().unwrap();
        assert!(sent.last().unwrap().contains("1 expense record created"));
    }

    #[tokio::test]
    async fn invalid_sibling_is_isolated() {
        let h = harness(vec![Some(Decision::Accept)]).await;
        let bad = RawIntent::new(0, "expense", json!({"items": []}));
        let mut good = food(900);
        good.sequence_index = 1;

        let report = h
            .sequencer
            .process(&message("mixed"), vec![bad, good])
            .await
            .unwrap();

        assert_eq!(report.intents[0].status, IntentStatus::Invalid);
        assert_eq!(report.intents[0].detail.as_deref(), Some("items"));
        assert_eq!(report.intents[1].status, IntentStatus::Committed);
        // Only the valid intent is asked about, as 1 of 1.
        let asked = h.confirmer.asked.lock().unwrap();
        assert_eq!(asked.len(), 1);
        assert_eq!((asked[0].position, asked[0].total), (1, 1));
    }

    #[tokio::test]
    async fn unanswered_prompt_times_out_and_next_intent_runs() {
        let h = harness(vec![None, Some(Decision::Accept)]).await;
        let mut second = food(300);
        second.sequence_index = 1;

        let report = h
            .sequencer
            .process(&message("slow"), vec![food(100), second])
            .await
            .unwrap();

        assert_eq!(report.intents[0].status, IntentStatus::TimedOut);
        assert_eq!(report.intents[1].status, IntentStatus::Committed);
        assert_eq!(h.ledger.count_expenses().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn redelivery_is_a_duplicate() {
        let h = harness(vec![Some(Decision::Accept), Some(Decision::Accept)]).await;
        let msg = message("again");
        h.sequencer.process(&msg, vec![food(6000)]).await.unwrap();

        let err = h.sequencer.process(&msg, vec![food(6000)]).await.unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
        assert_eq!(h.ledger.count_expenses().await.unwrap(), 1);
        assert_eq!(h.confirmer.asked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn photo_uploads_once_per_message() {
        let h = harness(vec![Some(Decision::Accept), Some(Decision::Accept)]).await;
        let msg = message("receipt").with_attachment(Attachment {
            media_id: Some("m1".into()),
            mime_type: "image/jpeg".into(),
            data: Some(b"jpeg".to_vec()),
            ..Default::default()
        });
        let mut second = food(200);
        second.sequence_index = 1;

        h.sequencer.process(&msg, vec![food(100), second]).await.unwrap();

        assert_eq!(h.media.uploads.load(Ordering::SeqCst), 1);
        let records = h.ledger.expenses_for_message("wamid.receipt").await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(
            records
                .iter()
                .all(|r| r.photo_reference.as_deref() == Some("file:///media/0.jpg"))
        );
    }

    #[tokio::test]
    async fn no_photo_upload_for_inquiries() {
        let h = harness(vec![Some(Decision::Accept)]).await;
        let msg = message("question").with_attachment(Attachment {
            mime_type: "image/png".into(),
            data: Some(b"png".to_vec()),
            ..Default::default()
        });
        let inquiry = RawIntent::new(0, "inquiry", json!({"topic": "vaccines"}));

        h.sequencer.process(&msg, vec![inquiry]).await.unwrap();
        assert_eq!(h.media.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resumed_message_skips_committed_intents() {
        let h = harness(vec![Some(Decision::Accept)]).await;
        let msg = message("resume");
        let key = msg.message_key();
        h.ledger
            .claim_message(&key, &msg.sender, chrono::Duration::minutes(15))
            .await
            .unwrap();
        let mut tx = h.ledger.begin().await.unwrap();
        tx.record_intent(&key, 0, "expense").await.unwrap();
        tx.commit().await.unwrap();
        h.ledger.finish_message(&key, MessageStatus::Failed).await.unwrap();

        let mut second = food(300);
        second.sequence_index = 1;
        let report = h.sequencer.process(&msg, vec![food(100), second]).await.unwrap();

        assert_eq!(report.intents[0].status, IntentStatus::AlreadyCommitted);
        assert_eq!(report.intents[1].status, IntentStatus::Committed);
        let asked = h.confirmer.asked.lock().unwrap();
        assert_eq!(asked.len(), 1);
        assert_eq!(asked[0].sequence_index, 1);
        assert_eq!((asked[0].position, asked[0].total), (1, 1));
    }

    #[tokio::test]
    async fn incomplete_request_is_kept_for_the_sender() {
        let h = harness(Vec::new()).await;
        let rescue = RawIntent::new(0, "new-rescue", json!({"name": "Luna"}));
        let unknown = RawIntent::new(1, "weather", json!({"sky": "grey"}));

        let report = h
            .sequencer
            .process(&message("partial"), vec![rescue, unknown])
            .await
            .unwrap();
        assert_eq!(report.intents[0].status, IntentStatus::Invalid);
        assert_eq!(report.intents[1].status, IntentStatus::Invalid);

        // Only the recognisable request is kept.
        let since = chrono::Utc::now() - chrono::Duration::minutes(5);
        let open = h.ledger.open_incomplete("5491100000000", since).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, "new-rescue");
        assert_eq!(open[0].message_key, "wamid.partial");
        assert_eq!(open[0].payload["name"], "Luna");
        assert_eq!(open[0].missing_fields, vec!["species".to_string()]);

        let sent = h.replies.sent.lock().unwrap();
        assert!(sent.last().unwrap().starts_with(
            "New rescue: not saved, missing or invalid: species. Send the missing details"
        ));
    }

    #[tokio::test]
    async fn zero_intents_gets_help() {
        let h = harness(Vec::new()).await;
        let report = h.sequencer.process(&message("hola"), Vec::new()).await.unwrap();
        assert!(report.intents.is_empty());
        let sent = h.replies.sent.lock().unwrap();
        assert!(sent[0].starts_with("I didn't find anything to record"));
        assert!(sent[0].contains("vet visit"));
    }

    #[test]
    fn summary_lines() {
        let report = MessageReport {
            message_key: "k".into(),
            intents: vec![
                IntentReport::new(0, "movement-tracking", IntentStatus::Declined),
                IntentReport::new(1, "expense", IntentStatus::Committed)
                    .with_detail("1 expense record created, 3 allocations."),
                IntentReport::new(2, "weather", IntentStatus::Invalid).with_detail("type"),
            ],
        };
        assert_eq!(
            report.summary(),
            "Movement: discarded.\n\
             1 expense record created, 3 allocations.\n\
             Unrecognised entry: not saved, missing or invalid: type."
        );
    }
}
