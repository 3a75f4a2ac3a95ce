//! End-to-end sequencer scenarios against an in-memory ledger.
//!
//! Each test wires the real sequencer, commit routines and allocation engine
//! to scripted collaborators and checks what ends up in the store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;
use serde_json::json;

use shelter_ledger::channels::{InboundMessage, ReplyButton, ReplySink};
use shelter_ledger::confirm::{ConfirmationRequest, Confirmer, Decision};
use shelter_ledger::error::{ChannelError, Error, MediaError, PipelineError, StoreError};
use shelter_ledger::intents::{IntentKind, RawIntent};
use shelter_ledger::media::{MediaRef, MediaStore};
use shelter_ledger::sequencer::{ConfirmationSequencer, IntentStatus, SequencerConfig};
use shelter_ledger::store::{
    Animal, AnimalStatus, AnimalSummary, Claim, ExpenseAllocation, ExpenseRecord,
    IncompleteRequest, Ledger, LedgerTx, LibSqlBackend, MessageStatus, NewIncompleteRequest,
};

/// Answers by intent kind; kinds not listed are accepted.
struct ByKind {
    decline: Vec<IntentKind>,
    asked: Mutex<VecDeque<IntentKind>>,
}

impl ByKind {
    fn accept_all() -> Arc<Self> {
        Self::declining(Vec::new())
    }

    fn declining(decline: Vec<IntentKind>) -> Arc<Self> {
        Arc::new(Self {
            decline,
            asked: Mutex::new(VecDeque::new()),
        })
    }
}

#[async_trait]
impl Confirmer for ByKind {
    async fn ask(&self, request: ConfirmationRequest) -> Result<Decision, PipelineError> {
        self.asked.lock().unwrap().push_back(request.kind);
        // Let concurrent deliveries interleave.
        tokio::task::yield_now().await;
        if self.decline.contains(&request.kind) {
            Ok(Decision::Decline)
        } else {
            Ok(Decision::Accept)
        }
    }
}

struct NoMedia;

#[async_trait]
impl MediaStore for NoMedia {
    async fn upload(&self, _: &[u8], _: &str) -> Result<MediaRef, MediaError> {
        Err(MediaError::Upload("not configured".into()))
    }
}

#[derive(Default)]
struct Outbox(Mutex<Vec<String>>);

#[async_trait]
impl ReplySink for Outbox {
    async fn send_confirmation(
        &self,
        _: &str,
        text: &str,
        _: &[ReplyButton],
    ) -> Result<(), ChannelError> {
        self.0.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn send_result_summary(&self, _: &str, text: &str) -> Result<(), ChannelError> {
        self.0.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

struct World {
    ledger: Arc<LibSqlBackend>,
    outbox: Arc<Outbox>,
    sequencer: ConfirmationSequencer,
}

async fn world(confirmer: Arc<ByKind>) -> World {
    let ledger = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    ledger.run_migrations().await.unwrap();
    let outbox = Arc::new(Outbox::default());
    let sequencer = ConfirmationSequencer::new(
        ledger.clone(),
        confirmer,
        Arc::new(NoMedia),
        outbox.clone(),
        SequencerConfig {
            confirm_timeout: Duration::from_secs(2),
            ..Default::default()
        },
    );
    World {
        ledger,
        outbox,
        sequencer,
    }
}

async fn seed_trio(ledger: &LibSqlBackend) {
    for (name, species) in [("Luna", "dog"), ("Michi", "cat"), ("Tom", "cat")] {
        ledger
            .add_animal(name, species, "in-shelter", "shelter")
            .await
            .unwrap();
    }
}

fn intent(index: usize, kind: &str, payload: serde_json::Value) -> RawIntent {
    RawIntent::new(index, kind, payload)
}

fn food_6000() -> serde_json::Value {
    json!({
        "provider": "PetShop",
        "date": "2024-03-02",
        "items": [{"amount": 6000, "category_id": 2, "description": "kibble"}]
    })
}

#[tokio::test]
async fn food_is_split_across_present_animals() {
    let w = world(ByKind::accept_all()).await;
    seed_trio(&w.ledger).await;
    let msg = InboundMessage::new("5491100000000", "6000 de alimento").with_id("wamid.food");

    let report = w
        .sequencer
        .process(&msg, vec![intent(0, "expense", food_6000())])
        .await
        .unwrap();
    assert_eq!(report.intents[0].status, IntentStatus::Committed);

    let records = w.ledger.expenses_for_message("wamid.food").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].amount, dec!(6000));
    let rows = w.ledger.expense_allocations(records[0].id).await.unwrap();
    let portions: Vec<_> = rows.iter().map(|r| (r.animal_id, r.portion_amount)).collect();
    assert_eq!(
        portions,
        vec![(1, dec!(2000)), (2, dec!(2000)), (3, dec!(2000))]
    );
}

#[tokio::test]
async fn named_item_goes_to_one_animal() {
    let w = world(ByKind::accept_all()).await;
    for name in ["Luna", "Michi", "Tom", "Olivia", "Panchi"] {
        w.ledger.add_animal(name, "dog", "in-shelter", "shelter").await.unwrap();
    }
    let msg = InboundMessage::new("5491100000000", "collar para Panchi").with_id("wamid.collar");
    let payload = json!({"items": [
        {"amount": 1200, "category_id": 7, "description": "collar", "animal_name": "Panchi"}
    ]});

    w.sequencer
        .process(&msg, vec![intent(0, "expense", payload)])
        .await
        .unwrap();

    let records = w.ledger.expenses_for_message("wamid.collar").await.unwrap();
    let rows = w.ledger.expense_allocations(records[0].id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!((rows[0].animal_id, rows[0].portion_amount), (5, dec!(1200)));
}

#[tokio::test]
async fn declined_movement_does_not_block_expense() {
    let w = world(ByKind::declining(vec![IntentKind::MovementTracking])).await;
    seed_trio(&w.ledger).await;
    let msg = InboundMessage::new(
        "5491100000000",
        "Saqué a Luna al parque y compré 6000 de alimento",
    )
    .with_id("wamid.mixed");

    let report = w
        .sequencer
        .process(
            &msg,
            vec![
                intent(
                    0,
                    "movement-tracking",
                    json!({"direction": "departure", "destination": "park", "animals": ["Luna"]}),
                ),
                intent(1, "expense", food_6000()),
            ],
        )
        .await
        .unwrap();

    assert_eq!(report.intents[0].status, IntentStatus::Declined);
    assert_eq!(report.intents[1].status, IntentStatus::Committed);
    // Luna never left, so the split is still three ways.
    assert_eq!(w.ledger.present_animals().await.unwrap().len(), 3);
    assert_eq!(w.ledger.count_allocations().await.unwrap(), 3);
}

#[tokio::test]
async fn accepted_movement_changes_the_next_split() {
    let w = world(ByKind::accept_all()).await;
    seed_trio(&w.ledger).await;
    let msg = InboundMessage::new("5491100000000", "Luna al veterinario; 6000 alimento")
        .with_id("wamid.seq");

    w.sequencer
        .process(
            &msg,
            vec![
                intent(
                    0,
                    "movement-tracking",
                    json!({"direction": "departure", "destination": "vet", "animals": ["Luna"]}),
                ),
                intent(1, "expense", food_6000()),
            ],
        )
        .await
        .unwrap();

    let records = w.ledger.expenses_for_message("wamid.seq").await.unwrap();
    let rows = w.ledger.expense_allocations(records[0].id).await.unwrap();
    let ids: Vec<i64> = rows.iter().map(|r| r.animal_id).collect();
    assert_eq!(ids, vec![2, 3]);
    assert!(rows.iter().all(|r| r.portion_amount == dec!(3000)));
}

#[tokio::test]
async fn concurrent_duplicate_deliveries_commit_once() {
    let w = world(ByKind::accept_all()).await;
    seed_trio(&w.ledger).await;
    let msg = InboundMessage::new("5491100000000", "6000 de alimento").with_id("wamid.retry");

    let attempts = (0..4).map(|_| {
        w.sequencer
            .process(&msg, vec![intent(0, "expense", food_6000())])
    });
    let results = futures::future::join_all(attempts).await;

    let committed = results.iter().filter(|r| r.is_ok()).count();
    let duplicates = results
        .iter()
        .filter(|r| matches!(r, Err(Error::Duplicate(_))))
        .count();
    assert_eq!((committed, duplicates), (1, 3));
    assert_eq!(w.ledger.count_expenses().await.unwrap(), 1);
    assert_eq!(w.ledger.count_allocations().await.unwrap(), 3);
}

#[tokio::test]
async fn content_key_catches_redelivery_without_transport_id() {
    let w = world(ByKind::accept_all()).await;
    let first = InboundMessage::new("5491100000000", "6000 de alimento");
    let again = InboundMessage::new("5491100000000", "  6000 de alimento ");

    w.sequencer
        .process(&first, vec![intent(0, "expense", food_6000())])
        .await
        .unwrap();
    let err = w
        .sequencer
        .process(&again, vec![intent(0, "expense", food_6000())])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Duplicate(_)));
    assert_eq!(w.ledger.count_expenses().await.unwrap(), 1);
}

#[tokio::test]
async fn unresolved_name_and_empty_shelter_leave_cost_unassigned() {
    let w = world(ByKind::accept_all()).await;
    let msg = InboundMessage::new("5491100000000", "gastos").with_id("wamid.general");
    let payload = json!({"items": [
        {"amount": 500, "category_id": 3, "description": "litter"},
        {"amount": 800, "category_id": 4, "description": "drops", "animal_name": "Ghost"}
    ]});

    let report = w
        .sequencer
        .process(&msg, vec![intent(0, "expense", payload)])
        .await
        .unwrap();

    assert_eq!(report.intents[0].status, IntentStatus::Committed);
    assert_eq!(w.ledger.count_expenses().await.unwrap(), 2);
    assert_eq!(w.ledger.count_allocations().await.unwrap(), 0);
    let summary = w.outbox.0.lock().unwrap().last().cloned().unwrap();
    assert!(summary.contains("Warning: animal 'Ghost' not found"), "{summary}");
}

#[tokio::test]
async fn malformed_sibling_does_not_stop_the_rest() {
    let w = world(ByKind::accept_all()).await;
    let msg = InboundMessage::new("5491100000000", "varios").with_id("wamid.partial");

    let report = w
        .sequencer
        .process(
            &msg,
            vec![
                intent(0, "expense", json!({"items": [{"amount": -3, "category_id": 2}]})),
                intent(1, "inquiry", json!({"topic": "vaccination schedule"})),
                intent(2, "horoscope", json!({})),
            ],
        )
        .await
        .unwrap();

    let statuses: Vec<IntentStatus> = report.intents.iter().map(|i| i.status).collect();
    assert_eq!(
        statuses,
        vec![
            IntentStatus::Invalid,
            IntentStatus::Committed,
            IntentStatus::Invalid
        ]
    );
    assert_eq!(w.ledger.count_expenses().await.unwrap(), 0);
    assert_eq!(
        w.ledger.message_status("wamid.partial").await.unwrap(),
        Some(MessageStatus::Completed)
    );
}

#[tokio::test]
async fn rescue_then_status_change_in_one_message() {
    let w = world(ByKind::accept_all()).await;
    let msg = InboundMessage::new("5491100000000", "rescate y adopción").with_id("wamid.life");

    let report = w
        .sequencer
        .process(
            &msg,
            vec![
                intent(0, "new-rescue", json!({"name": "Nube", "species": "cat"})),
                intent(
                    1,
                    "status-change",
                    json!({"animal_name": "nube", "status": "adopted", "location": "adopter-home"}),
                ),
            ],
        )
        .await
        .unwrap();

    assert!(
        report
            .intents
            .iter()
            .all(|i| i.status == IntentStatus::Committed)
    );
    let roster = w.ledger.animal_roster().await.unwrap();
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].status.as_deref(), Some("adopted"));
    assert!(!roster[0].present);
}

/// The in-memory ledger, except that the listed transactions (1-based,
/// counting every `begin`) fail to open.
struct FlakyLedger {
    inner: Arc<LibSqlBackend>,
    begins: AtomicUsize,
    fail_on: Vec<usize>,
}

#[async_trait]
impl Ledger for FlakyLedger {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        self.inner.run_migrations().await
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let n = self.begins.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.contains(&n) {
            return Err(StoreError::Pool("database is locked".into()));
        }
        self.inner.begin().await
    }

    async fn claim_message(
        &self,
        message_key: &str,
        sender: &str,
        stale_after: chrono::Duration,
    ) -> Result<Claim, StoreError> {
        self.inner.claim_message(message_key, sender, stale_after).await
    }

    async fn finish_message(
        &self,
        message_key: &str,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        self.inner.finish_message(message_key, status).await
    }

    async fn message_status(
        &self,
        message_key: &str,
    ) -> Result<Option<MessageStatus>, StoreError> {
        self.inner.message_status(message_key).await
    }

    async fn intent_committed(
        &self,
        message_key: &str,
        sequence_index: usize,
    ) -> Result<bool, StoreError> {
        self.inner.intent_committed(message_key, sequence_index).await
    }

    async fn save_incomplete(&self, request: &NewIncompleteRequest) -> Result<i64, StoreError> {
        self.inner.save_incomplete(request).await
    }

    async fn open_incomplete(
        &self,
        sender: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<IncompleteRequest>, StoreError> {
        self.inner.open_incomplete(sender, since).await
    }

    async fn resolve_incomplete(&self, ids: &[i64]) -> Result<(), StoreError> {
        self.inner.resolve_incomplete(ids).await
    }

    async fn active_animals(&self) -> Result<Vec<Animal>, StoreError> {
        self.inner.active_animals().await
    }

    async fn present_animals(&self) -> Result<Vec<AnimalSummary>, StoreError> {
        self.inner.present_animals().await
    }

    async fn animal_roster(&self) -> Result<Vec<AnimalStatus>, StoreError> {
        self.inner.animal_roster().await
    }

    async fn get_expense(&self, id: i64) -> Result<Option<ExpenseRecord>, StoreError> {
        self.inner.get_expense(id).await
    }

    async fn expense_allocations(
        &self,
        expense_id: i64,
    ) -> Result<Vec<ExpenseAllocation>, StoreError> {
        self.inner.expense_allocations(expense_id).await
    }

    async fn expenses_for_message(
        &self,
        message_key: &str,
    ) -> Result<Vec<ExpenseRecord>, StoreError> {
        self.inner.expenses_for_message(message_key).await
    }

    async fn count_expenses(&self) -> Result<i64, StoreError> {
        self.inner.count_expenses().await
    }

    async fn count_allocations(&self) -> Result<i64, StoreError> {
        self.inner.count_allocations().await
    }
}

#[tokio::test]
async fn store_failure_keeps_siblings_and_redelivery_retries_the_rest() {
    let inner = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    inner.run_migrations().await.unwrap();
    seed_trio(&inner).await;
    let ledger = Arc::new(FlakyLedger {
        inner: inner.clone(),
        begins: AtomicUsize::new(0),
        fail_on: vec![2],
    });
    let confirmer = ByKind::accept_all();
    let outbox = Arc::new(Outbox::default());
    let sequencer = ConfirmationSequencer::new(
        ledger.clone(),
        confirmer.clone(),
        Arc::new(NoMedia),
        outbox.clone(),
        SequencerConfig::default(),
    );
    let msg = InboundMessage::new("5491100000000", "alimento y arena").with_id("wamid.flaky");
    let intents = || {
        vec![
            intent(0, "expense", food_6000()),
            intent(
                1,
                "expense",
                json!({"items": [{"amount": 900, "category_id": 3, "description": "litter"}]}),
            ),
        ]
    };

    let report = sequencer.process(&msg, intents()).await.unwrap();
    assert_eq!(report.intents[0].status, IntentStatus::Committed);
    assert_eq!(report.intents[1].status, IntentStatus::Failed);
    assert!(report.intents[1].detail.as_deref().unwrap().contains("database is locked"));
    assert_eq!(inner.count_expenses().await.unwrap(), 1);
    assert_eq!(
        inner.message_status("wamid.flaky").await.unwrap(),
        Some(MessageStatus::Failed)
    );
    let summary = outbox.0.lock().unwrap().last().cloned().unwrap();
    assert!(summary.contains("Expense: could not be saved, please try again."), "{summary}");

    // The failed claim is retaken; only the failed intent is asked and saved.
    let report = sequencer.process(&msg, intents()).await.unwrap();
    assert_eq!(report.intents[0].status, IntentStatus::AlreadyCommitted);
    assert_eq!(report.intents[1].status, IntentStatus::Committed);
    assert_eq!(confirmer.asked.lock().unwrap().len(), 3);
    assert_eq!(inner.count_expenses().await.unwrap(), 2);
    assert_eq!(inner.count_allocations().await.unwrap(), 6);
    assert_eq!(
        inner.message_status("wamid.flaky").await.unwrap(),
        Some(MessageStatus::Completed)
    );
}
