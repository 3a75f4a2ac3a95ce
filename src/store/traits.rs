//! `Ledger` trait: the async persistence interface for the shelter ledger.
//!
//! Writes only happen inside a [`LedgerTx`]. Each intent commit opens one,
//! so a failure rolls back that intent alone and never touches work that
//! another intent or message already committed.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::StoreError;

/// An animal on the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Animal {
    pub id: i64,
    pub name: String,
    pub species: String,
    pub is_active: bool,
}

/// Compact animal view returned by presence queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnimalSummary {
    pub id: i64,
    pub name: String,
    pub species: String,
}

/// The most recent status/location event for an animal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnimalEvent {
    pub id: i64,
    pub animal_id: i64,
    pub status: String,
    pub location: String,
    pub person: Option<String>,
    pub event_date: NaiveDate,
    pub recorded_at: DateTime<Utc>,
}

/// Roster row: an active animal and its derived presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnimalStatus {
    pub animal: AnimalSummary,
    pub status: Option<String>,
    pub location: Option<String>,
    pub present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAnimal {
    pub name: String,
    pub species: String,
    pub age: Option<String>,
    /// JSON array of `{color, percentage}`.
    pub coat_colors: String,
    pub health_condition: Option<String>,
    pub photo_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAnimalEvent {
    pub animal_id: i64,
    pub status: String,
    pub location: String,
    pub person: Option<String>,
    pub event_date: NaiveDate,
    pub message_key: Option<String>,
}

/// One expense record to insert (one per line item).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExpense {
    pub date: NaiveDate,
    pub category_id: i64,
    pub amount: Decimal,
    pub description: String,
    pub provider: Option<String>,
    pub responsible_party: Option<String>,
    pub payment_method: Option<String>,
    pub photo_reference: Option<String>,
    pub message_key: Option<String>,
}

/// A persisted expense record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpenseRecord {
    pub id: i64,
    pub date: NaiveDate,
    pub category_id: i64,
    pub amount: Decimal,
    pub description: String,
    pub provider: Option<String>,
    pub responsible_party: Option<String>,
    pub payment_method: Option<String>,
    pub photo_reference: Option<String>,
    pub message_key: Option<String>,
}

/// Expense to animal link with its monetary portion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpenseAllocation {
    pub expense_id: i64,
    pub animal_id: i64,
    pub portion_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVetVisit {
    pub animal_id: Option<i64>,
    pub vet: Option<String>,
    pub visit_date: NaiveDate,
    pub diagnosis: Option<String>,
    pub treatment: Option<String>,
    pub next_appointment: Option<String>,
    pub companion: Option<String>,
    pub message_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMovement {
    pub direction: String,
    pub destination: String,
    pub responsible: Option<String>,
    pub movement_date: NaiveDate,
    pub notes: Option<String>,
    pub message_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInquiry {
    pub topic: String,
    pub animal_name: Option<String>,
    pub animal_id: Option<i64>,
    pub suggested_answer: Option<String>,
    pub sender: Option<String>,
    pub message_key: Option<String>,
}

/// Result of trying to take ownership of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// First delivery; this caller processes it.
    Acquired,
    /// A stale unfinished claim was taken over.
    TakenOver,
    /// Someone else owns or finished it.
    Duplicate,
}

/// Lifecycle of a message claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Processing,
    Completed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A request that failed validation, kept so the sender's next message can
/// supply what was missing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncompleteRequest {
    pub id: i64,
    pub sender: String,
    pub message_key: String,
    pub kind: String,
    /// The payload as the classifier produced it.
    pub payload: serde_json::Value,
    pub missing_fields: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewIncompleteRequest {
    pub sender: String,
    pub message_key: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub missing_fields: Vec<String>,
}

/// Backend-agnostic ledger store.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    /// Open a write transaction.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError>;

    // ── Message claims ──────────────────────────────────────────────

    /// Atomically claim a message key. Exactly one concurrent caller gets
    /// `Acquired` (or `TakenOver` when the previous claim is older than
    /// `stale_after` and still processing); every other caller gets
    /// `Duplicate`.
    async fn claim_message(
        &self,
        message_key: &str,
        sender: &str,
        stale_after: chrono::Duration,
    ) -> Result<Claim, StoreError>;

    /// Record the final status of a claimed message.
    async fn finish_message(
        &self,
        message_key: &str,
        status: MessageStatus,
    ) -> Result<(), StoreError>;

    /// Status of a message claim, if any.
    async fn message_status(&self, message_key: &str)
    -> Result<Option<MessageStatus>, StoreError>;

    /// Whether this message's intent at `sequence_index` already committed.
    async fn intent_committed(
        &self,
        message_key: &str,
        sequence_index: usize,
    ) -> Result<bool, StoreError>;

    // ── Incomplete requests ─────────────────────────────────────────

    async fn save_incomplete(&self, request: &NewIncompleteRequest) -> Result<i64, StoreError>;

    /// Unresolved requests from `sender` created at or after `since`, oldest
    /// first.
    async fn open_incomplete(
        &self,
        sender: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<IncompleteRequest>, StoreError>;

    async fn resolve_incomplete(&self, ids: &[i64]) -> Result<(), StoreError>;

    // ── Read path ───────────────────────────────────────────────────

    /// Active animals ordered by id.
    async fn active_animals(&self) -> Result<Vec<Animal>, StoreError>;

    /// Animals whose latest event is in-shelter at the shelter, by id.
    async fn present_animals(&self) -> Result<Vec<AnimalSummary>, StoreError>;

    /// Active animals with their latest status/location.
    async fn animal_roster(&self) -> Result<Vec<AnimalStatus>, StoreError>;

    async fn get_expense(&self, id: i64) -> Result<Option<ExpenseRecord>, StoreError>;

    async fn expense_allocations(
        &self,
        expense_id: i64,
    ) -> Result<Vec<ExpenseAllocation>, StoreError>;

    /// Expenses created from one message, in insertion order.
    async fn expenses_for_message(
        &self,
        message_key: &str,
    ) -> Result<Vec<ExpenseRecord>, StoreError>;

    async fn count_expenses(&self) -> Result<i64, StoreError>;

    async fn count_allocations(&self) -> Result<i64, StoreError>;
}

/// One open write transaction. Dropping it without `commit` rolls back.
#[async_trait]
pub trait LedgerTx: Send {
    // ── Expenses ────────────────────────────────────────────────────

    /// Insert an expense record and return its id.
    async fn insert_expense(&mut self, record: &NewExpense) -> Result<i64, StoreError>;

    async fn insert_allocation(&mut self, row: &ExpenseAllocation) -> Result<(), StoreError>;

    /// Id assigned by the most recent insert into `table` within this
    /// transaction. Only meaningful right after that insert.
    fn last_inserted_id(&self, table: &str) -> Option<i64>;

    // ── Animals ─────────────────────────────────────────────────────

    async fn active_animals(&mut self) -> Result<Vec<Animal>, StoreError>;

    async fn present_animals(&mut self) -> Result<Vec<AnimalSummary>, StoreError>;

    async fn find_animal(&mut self, id: i64) -> Result<Option<Animal>, StoreError>;

    async fn insert_animal(&mut self, animal: &NewAnimal) -> Result<i64, StoreError>;

    async fn insert_animal_event(&mut self, event: &NewAnimalEvent) -> Result<i64, StoreError>;

    async fn latest_event(&mut self, animal_id: i64) -> Result<Option<AnimalEvent>, StoreError>;

    // ── Other intake records ────────────────────────────────────────

    async fn insert_vet_visit(&mut self, visit: &NewVetVisit) -> Result<i64, StoreError>;

    async fn insert_movement(
        &mut self,
        movement: &NewMovement,
        animal_ids: &[i64],
    ) -> Result<i64, StoreError>;

    async fn insert_inquiry(&mut self, inquiry: &NewInquiry) -> Result<i64, StoreError>;

    // ── Intent bookkeeping ──────────────────────────────────────────

    /// Whether this message's intent at `sequence_index` already committed.
    async fn intent_committed(
        &mut self,
        message_key: &str,
        sequence_index: usize,
    ) -> Result<bool, StoreError>;

    /// Mark an intent committed, in the same transaction as its writes.
    async fn record_intent(
        &mut self,
        message_key: &str,
        sequence_index: usize,
        kind: &str,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
