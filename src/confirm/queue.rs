//! Confirmation queue: in-memory pending prompts with broadcast to
//! WebSocket watchers.
//!
//! Each pending prompt owns a oneshot responder. The prompt is answered from
//! the chat (a button or a yes/no reply), from the REST API, or from a
//! WebSocket client; whichever comes first wins.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, broadcast, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{ConfirmEvent, ConfirmationStatus, PendingConfirmation};
use super::{ConfirmationRequest, Confirmer, Decision, parse_reply};
use crate::channels::ReplySink;
use crate::error::PipelineError;

const DEFAULT_BROADCAST_CAPACITY: usize = 256;
/// Answered prompts kept for the dashboard history.
const HISTORY_LIMIT: usize = 100;

pub struct ConfirmationQueue {
    entries: RwLock<VecDeque<PendingConfirmation>>,
    responders: Mutex<HashMap<Uuid, oneshot::Sender<Decision>>>,
    tx: broadcast::Sender<ConfirmEvent>,
    replies: Arc<dyn ReplySink>,
    ttl: chrono::Duration,
}

impl ConfirmationQueue {
    /// `ttl` bounds how long a prompt stays answerable.
    pub fn new(replies: Arc<dyn ReplySink>, ttl: chrono::Duration) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            entries: RwLock::new(VecDeque::new()),
            responders: Mutex::new(HashMap::new()),
            tx,
            replies,
            ttl,
        })
    }

    /// Subscribe to real-time confirmation events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfirmEvent> {
        self.tx.subscribe()
    }

    /// Register a prompt and return its id and the receiver for the answer.
    pub async fn push(
        &self,
        request: ConfirmationRequest,
    ) -> (Uuid, oneshot::Receiver<Decision>) {
        let entry = PendingConfirmation::new(request, self.ttl);
        let id = entry.id;
        let (responder, rx) = oneshot::channel();

        info!(
            confirmation_id = %id,
            sender = %entry.request.sender,
            message_key = %entry.request.message_key,
            intent = %entry.request.kind,
            "Confirmation pending"
        );

        self.responders.lock().await.insert(id, responder);
        let event = ConfirmEvent::NewConfirmation {
            confirmation: entry.clone(),
        };
        self.entries.write().await.push_back(entry);

        // No watchers is fine.
        let _ = self.tx.send(event);
        (id, rx)
    }

    pub async fn accept(&self, id: Uuid) -> Option<PendingConfirmation> {
        self.resolve(id, Decision::Accept).await
    }

    pub async fn decline(&self, id: Uuid) -> Option<PendingConfirmation> {
        self.resolve(id, Decision::Decline).await
    }

    /// Answer a pending prompt. Returns the updated record, or `None` when it
    /// is unknown, already answered, or nobody is waiting any more.
    pub async fn resolve(&self, id: Uuid, decision: Decision) -> Option<PendingConfirmation> {
        let mut entries = self.entries.write().await;
        let entry = entries.iter_mut().find(|c| c.id == id)?;
        if entry.status != ConfirmationStatus::Pending {
            warn!(confirmation_id = %id, status = ?entry.status, "Cannot answer non-pending confirmation");
            return None;
        }

        let responder = self.responders.lock().await.remove(&id);
        let delivered = match responder {
            Some(responder) => responder.send(decision).is_ok(),
            None => false,
        };
        let status = if delivered {
            ConfirmationStatus::from(decision)
        } else {
            ConfirmationStatus::Expired
        };
        entry.status = status;
        entry.updated_at = chrono::Utc::now();
        let updated = entry.clone();

        if delivered {
            info!(confirmation_id = %id, ?decision, "Confirmation answered");
            let _ = self.tx.send(ConfirmEvent::ConfirmationUpdate { id, status });
            Some(updated)
        } else {
            debug!(confirmation_id = %id, "Asker gone, confirmation expired");
            let _ = self.tx.send(ConfirmEvent::ConfirmationExpired { id });
            None
        }
    }

    /// Treat an inbound chat message as an answer to the sender's oldest
    /// open prompt. Returns the prompt id when it was consumed as an answer.
    pub async fn answer_from_reply(&self, sender: &str, reply: &str) -> Option<Uuid> {
        let decision = parse_reply(reply)?;
        let candidates: Vec<Uuid> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|c| {
                    c.request.sender == sender
                        && c.status == ConfirmationStatus::Pending
                        && !c.is_expired()
                })
                .map(|c| c.id)
                .collect()
        };
        for id in candidates {
            if self.resolve(id, decision).await.is_some() {
                return Some(id);
            }
        }
        None
    }

    /// Pending, unexpired prompts.
    pub async fn pending(&self) -> Vec<PendingConfirmation> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|c| c.status == ConfirmationStatus::Pending && !c.is_expired())
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: Uuid) -> Option<PendingConfirmation> {
        self.entries.read().await.iter().find(|c| c.id == id).cloned()
    }

    /// Expire prompts past their deadline or abandoned by their asker, and
    /// prune old history. Returns how many expired.
    pub async fn expire_old(&self) -> usize {
        let mut entries = self.entries.write().await;
        let mut responders = self.responders.lock().await;
        let mut expired = 0;

        for entry in entries.iter_mut() {
            if entry.status != ConfirmationStatus::Pending {
                continue;
            }
            let abandoned = responders.get(&entry.id).is_none_or(|r| r.is_closed());
            if entry.is_expired() || abandoned {
                entry.status = ConfirmationStatus::Expired;
                entry.updated_at = chrono::Utc::now();
                // Dropping the responder wakes the asker with an error.
                responders.remove(&entry.id);
                expired += 1;
                debug!(confirmation_id = %entry.id, "Confirmation expired");
                let _ = self.tx.send(ConfirmEvent::ConfirmationExpired { id: entry.id });
            }
        }

        let answered = entries
            .iter()
            .filter(|c| c.status != ConfirmationStatus::Pending)
            .count();
        let mut to_remove = answered.saturating_sub(HISTORY_LIMIT);
        if to_remove > 0 {
            entries.retain(|c| {
                if c.status != ConfirmationStatus::Pending && to_remove > 0 {
                    to_remove -= 1;
                    false
                } else {
                    true
                }
            });
        }

        if expired > 0 {
            info!(count = expired, "Expired confirmations");
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Confirmer for ConfirmationQueue {
    async fn ask(&self, request: ConfirmationRequest) -> Result<Decision, PipelineError> {
        let sender = request.sender.clone();
        let (id, rx) = self.push(request).await;

        let prompt = self
            .get(id)
            .await
            .map(|c| c.prompt)
            .unwrap_or_default();
        if let Err(e) = self
            .replies
            .send_confirmation(&sender, &prompt, &ConfirmationRequest::buttons())
            .await
        {
            warn!(confirmation_id = %id, error = %e, "Failed to deliver confirmation prompt");
            // Nobody can answer a prompt they never saw.
            self.responders.lock().await.remove(&id);
            self.expire_old().await;
            return Err(PipelineError::Confirmation(format!("prompt not delivered: {e}")));
        }

        rx.await
            .map_err(|_| PipelineError::Confirmation(format!("confirmation {id} expired")))
    }
}

/// Spawn a background task that periodically expires old prompts.
pub fn spawn_expiry_task(queue: Arc<ConfirmationQueue>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            queue.expire_old().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::channels::ReplyButton;
    use crate::error::ChannelError;
    use crate::intents::IntentKind;

    /// Records prompts; optionally fails every send.
    #[derive(Default)]
    struct RecordingSink {
        prompts: StdMutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl ReplySink for RecordingSink {
        async fn send_confirmation(
            &self,
            to: &str,
            text: &str,
            _options: &[ReplyButton],
        ) -> Result<(), ChannelError> {
            if self.fail {
                return Err(ChannelError::SendFailed {
                    name: "test".into(),
                    reason: "offline".into(),
                });
            }
            self.prompts.lock().unwrap().push((to.into(), text.into()));
            Ok(())
        }

        async fn send_result_summary(&self, _to: &str, _text: &str) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    fn request(sender: &str, index: usize) -> ConfirmationRequest {
        ConfirmationRequest {
            message_key: "wamid.1".into(),
            sender: sender.into(),
            sequence_index: index,
            position: index + 1,
            total: 2,
            kind: IntentKind::Expense,
            fields: vec![("Total".into(), "6000".into())],
        }
    }

    fn queue() -> Arc<ConfirmationQueue> {
        ConfirmationQueue::new(Arc::new(RecordingSink::default()), chrono::Duration::minutes(5))
    }

    #[tokio::test]
    async fn push_and_accept() {
        let queue = queue();
        let (id, rx) = queue.push(request("5491", 0)).await;
        assert_eq!(queue.pending().await.len(), 1);

        let updated = queue.accept(id).await.unwrap();
        assert_eq!(updated.status, ConfirmationStatus::Accepted);
        assert_eq!(rx.await.unwrap(), Decision::Accept);
        assert!(queue.pending().await.is_empty());

        // A second answer is refused.
        assert!(queue.decline(id).await.is_none());
    }

    #[tokio::test]
    async fn unknown_id() {
        let queue = queue();
        assert!(queue.accept(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn reply_answers_oldest_prompt_of_that_sender() {
        let queue = queue();
        let (first, first_rx) = queue.push(request("5491", 0)).await;
        let (_other, _other_rx) = queue.push(request("5492", 0)).await;

        assert_eq!(queue.answer_from_reply("5491", "no gracias").await, Some(first));
        assert_eq!(first_rx.await.unwrap(), Decision::Decline);

        // Not an answer, and nothing left for this sender.
        assert_eq!(queue.answer_from_reply("5492", "compré alimento").await, None);
        assert_eq!(queue.answer_from_reply("5491", "sí").await, None);
    }

    #[tokio::test]
    async fn abandoned_prompts_expire() {
        let queue = queue();
        let (id, rx) = queue.push(request("5491", 0)).await;
        assert_eq!(queue.pending().await.len(), 1);
        drop(rx);

        assert_eq!(queue.expire_old().await, 1);
        assert_eq!(queue.get(id).await.unwrap().status, ConfirmationStatus::Expired);
        assert!(queue.accept(id).await.is_none());
    }

    #[tokio::test]
    async fn deadline_expiry_wakes_the_asker() {
        let queue = ConfirmationQueue::new(
            Arc::new(RecordingSink::default()),
            chrono::Duration::zero(),
        );
        let (_id, rx) = queue.push(request("5491", 0)).await;
        assert_eq!(queue.expire_old().await, 1);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn broadcasts_events() {
        let queue = queue();
        let mut events = queue.subscribe();
        let (id, _rx) = queue.push(request("5491", 0)).await;
        queue.accept(id).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), ConfirmEvent::NewConfirmation { .. }));
        match events.recv().await.unwrap() {
            ConfirmEvent::ConfirmationUpdate { id: got, status } => {
                assert_eq!(got, id);
                assert_eq!(status, ConfirmationStatus::Accepted);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn ask_sends_prompt_and_waits() {
        let sink = Arc::new(RecordingSink::default());
        let queue = ConfirmationQueue::new(sink.clone(), chrono::Duration::minutes(5));

        let asker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.ask(request("5491", 1)).await })
        };
        // Wait for the prompt to land.
        let id = loop {
            if let Some(c) = queue.pending().await.first() {
                break c.id;
            }
            tokio::task::yield_now().await;
        };
        queue.accept(id).await.unwrap();
        assert_eq!(asker.await.unwrap().unwrap(), Decision::Accept);

        let prompts = sink.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].0, "5491");
        assert!(prompts[0].1.starts_with("Expense (2/2)"));
    }

    #[tokio::test]
    async fn undeliverable_prompt_fails_fast() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let queue = ConfirmationQueue::new(sink, chrono::Duration::minutes(5));
        assert!(queue.ask(request("5491", 0)).await.is_err());
        assert!(queue.pending().await.is_empty());
    }

    #[tokio::test]
    async fn history_is_pruned() {
        let queue = queue();
        for i in 0..(HISTORY_LIMIT + 20) {
            let (id, _rx) = queue.push(request("5491", i)).await;
            queue.accept(id).await;
        }
        let (_open, _rx) = queue.push(request("5491", 999)).await;
        queue.expire_old().await;
        assert_eq!(queue.len().await, HISTORY_LIMIT + 1);
        assert_eq!(queue.pending().await.len(), 1);
    }
}
