//! libSQL backend: async `Ledger` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared and SQLite allows one writer, so a gate serialises everything on
//! that connection: transactions hold it from BEGIN to COMMIT/ROLLBACK, and
//! claims and reads take it briefly. A read therefore never sees rows from
//! a transaction that is still open.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::directory::{PRESENT_LOCATION, PRESENT_STATUS};
use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::*;

/// libSQL ledger backend.
pub struct LibSqlBackend {
    conn: Connection,
    gate: Arc<Mutex<()>>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: Database) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            conn,
            gate: Arc::new(Mutex::new(())),
        })
    }

    /// Seed helper: insert an active animal and its first event outside the
    /// message pipeline (imports, fixtures).
    pub async fn add_animal(
        &self,
        name: &str,
        species: &str,
        status: &str,
        location: &str,
    ) -> Result<i64, StoreError> {
        let mut tx = self.begin().await?;
        let id = tx
            .insert_animal(&NewAnimal {
                name: name.to_string(),
                species: species.to_string(),
                age: None,
                coat_colors: "[]".into(),
                health_condition: None,
                photo_reference: None,
            })
            .await?;
        tx.insert_animal_event(&NewAnimalEvent {
            animal_id: id,
            status: status.to_string(),
            location: location.to_string(),
            person: None,
            event_date: Utc::now().date_naive(),
            message_key: None,
        })
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Soft-delete an animal.
    pub async fn deactivate_animal(&self, id: i64) -> Result<(), StoreError> {
        let _gate = self.gate.lock().await;
        let changed = self
            .conn
            .execute("UPDATE animals SET is_active = 0 WHERE id = ?1", params![id])
            .await
            .map_err(|e| StoreError::Query(format!("deactivate_animal: {e}")))?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "animal".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_date(s: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| StoreError::Serialization(format!("bad date '{s}': {e}")))
}

fn parse_money(s: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(s).map_err(|e| StoreError::Serialization(format!("bad amount '{s}': {e}")))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn str_to_msg_status(s: &str) -> MessageStatus {
    match s {
        "completed" => MessageStatus::Completed,
        "failed" => MessageStatus::Failed,
        _ => MessageStatus::Processing,
    }
}

fn row_err(ctx: &str) -> impl Fn(libsql::Error) -> StoreError + '_ {
    move |e| StoreError::Query(format!("{ctx}: {e}"))
}

const EXPENSE_COLUMNS: &str = "id, date, category_id, amount, description, provider, \
     responsible_party, payment_method, photo_reference, message_key";

fn row_to_expense(row: &libsql::Row) -> Result<ExpenseRecord, StoreError> {
    let err = row_err("read expense");
    let date: String = row.get(1).map_err(&err)?;
    let amount: String = row.get(3).map_err(&err)?;
    Ok(ExpenseRecord {
        id: row.get(0).map_err(&err)?,
        date: parse_date(&date)?,
        category_id: row.get(2).map_err(&err)?,
        amount: parse_money(&amount)?,
        description: row.get(4).map_err(&err)?,
        provider: row.get::<String>(5).ok(),
        responsible_party: row.get::<String>(6).ok(),
        payment_method: row.get::<String>(7).ok(),
        photo_reference: row.get::<String>(8).ok(),
        message_key: row.get::<String>(9).ok(),
    })
}

// ── Shared queries (connection or open transaction) ─────────────────

async fn query_active_animals(conn: &Connection) -> Result<Vec<Animal>, StoreError> {
    let err = row_err("active_animals");
    let mut rows = conn
        .query(
            "SELECT id, name, species, is_active FROM animals WHERE is_active = 1 ORDER BY id",
            (),
        )
        .await
        .map_err(&err)?;
    let mut animals = Vec::new();
    while let Some(row) = rows.next().await.map_err(&err)? {
        animals.push(Animal {
            id: row.get(0).map_err(&err)?,
            name: row.get(1).map_err(&err)?,
            species: row.get(2).map_err(&err)?,
            is_active: row.get::<i64>(3).map_err(&err)? != 0,
        });
    }
    Ok(animals)
}

/// Latest event per animal is the one with the highest event id.
const LATEST_EVENT_JOIN: &str = "LEFT JOIN animal_events e ON e.id = (
        SELECT MAX(id) FROM animal_events WHERE animal_id = a.id
    )";

async fn query_present_animals(conn: &Connection) -> Result<Vec<AnimalSummary>, StoreError> {
    let err = row_err("present_animals");
    let sql = format!(
        "SELECT a.id, a.name, a.species FROM animals a {LATEST_EVENT_JOIN}
         WHERE a.is_active = 1 AND e.status = ?1 AND e.location = ?2
         ORDER BY a.id ASC"
    );
    let mut rows = conn
        .query(&sql, params![PRESENT_STATUS, PRESENT_LOCATION])
        .await
        .map_err(&err)?;
    let mut animals = Vec::new();
    while let Some(row) = rows.next().await.map_err(&err)? {
        animals.push(AnimalSummary {
            id: row.get(0).map_err(&err)?,
            name: row.get(1).map_err(&err)?,
            species: row.get(2).map_err(&err)?,
        });
    }
    Ok(animals)
}

async fn query_latest_event(
    conn: &Connection,
    animal_id: i64,
) -> Result<Option<AnimalEvent>, StoreError> {
    let err = row_err("latest_event");
    let mut rows = conn
        .query(
            "SELECT id, animal_id, status, location, person, event_date, recorded_at
             FROM animal_events WHERE animal_id = ?1 ORDER BY id DESC LIMIT 1",
            params![animal_id],
        )
        .await
        .map_err(&err)?;
    let Some(row) = rows.next().await.map_err(&err)? else {
        return Ok(None);
    };
    let event_date: String = row.get(5).map_err(&err)?;
    let recorded_at: String = row.get(6).map_err(&err)?;
    Ok(Some(AnimalEvent {
        id: row.get(0).map_err(&err)?,
        animal_id: row.get(1).map_err(&err)?,
        status: row.get(2).map_err(&err)?,
        location: row.get(3).map_err(&err)?,
        person: row.get::<String>(4).ok(),
        event_date: parse_date(&event_date)?,
        recorded_at: parse_datetime(&recorded_at),
    }))
}

async fn query_intent_committed(
    conn: &Connection,
    message_key: &str,
    sequence_index: usize,
) -> Result<bool, StoreError> {
    let err = row_err("intent_committed");
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM message_intents WHERE message_key = ?1 AND sequence_index = ?2",
            params![message_key, sequence_index as i64],
        )
        .await
        .map_err(&err)?;
    let count = match rows.next().await.map_err(&err)? {
        Some(row) => row.get::<i64>(0).map_err(&err)?,
        None => 0,
    };
    Ok(count > 0)
}

fn row_to_incomplete(row: &libsql::Row) -> Result<IncompleteRequest, StoreError> {
    let err = row_err("read incomplete request");
    let payload: String = row.get(4).map_err(&err)?;
    let missing: String = row.get(5).map_err(&err)?;
    let created_at: String = row.get(6).map_err(&err)?;
    Ok(IncompleteRequest {
        id: row.get(0).map_err(&err)?,
        sender: row.get(1).map_err(&err)?,
        message_key: row.get(2).map_err(&err)?,
        kind: row.get(3).map_err(&err)?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| StoreError::Serialization(format!("incomplete payload: {e}")))?,
        missing_fields: serde_json::from_str(&missing)
            .map_err(|e| StoreError::Serialization(format!("incomplete fields: {e}")))?,
        created_at: parse_datetime(&created_at),
    })
}

async fn query_count(conn: &Connection, sql: &str) -> Result<i64, StoreError> {
    let err = row_err("count");
    let mut rows = conn.query(sql, ()).await.map_err(&err)?;
    match rows.next().await.map_err(&err)? {
        Some(row) => row.get(0).map_err(&err),
        None => Ok(0),
    }
}

#[async_trait]
impl Ledger for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run_migrations(&self.conn).await
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let gate = self.gate.clone().lock_owned().await;
        self.conn
            .execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| StoreError::Pool(format!("begin: {e}")))?;
        Ok(Box::new(LibSqlTx {
            conn: self.conn.clone(),
            gate: Some(gate),
            last_ids: HashMap::new(),
            finished: false,
        }))
    }

    async fn claim_message(
        &self,
        message_key: &str,
        sender: &str,
        stale_after: chrono::Duration,
    ) -> Result<Claim, StoreError> {
        let _gate = self.gate.lock().await;
        let now = Utc::now();
        let inserted = self
            .conn
            .execute(
                "INSERT INTO processed_messages (message_key, sender, status, claimed_at)
                 VALUES (?1, ?2, 'processing', ?3)
                 ON CONFLICT(message_key) DO NOTHING",
                params![message_key, sender, now_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("claim_message: {e}")))?;
        if inserted == 1 {
            debug!(message_key, "Message claimed");
            return Ok(Claim::Acquired);
        }

        let cutoff = (now - stale_after).to_rfc3339_opts(SecondsFormat::Millis, true);
        let taken = self
            .conn
            .execute(
                "UPDATE processed_messages SET status = 'processing', claimed_at = ?2,
                 finished_at = NULL
                 WHERE message_key = ?1
                   AND (status = 'failed' OR (status = 'processing' AND claimed_at < ?3))",
                params![message_key, now_str(), cutoff],
            )
            .await
            .map_err(|e| StoreError::Query(format!("claim_message takeover: {e}")))?;
        if taken == 1 {
            warn!(message_key, "Took over unfinished message claim");
            return Ok(Claim::TakenOver);
        }
        Ok(Claim::Duplicate)
    }

    async fn finish_message(
        &self,
        message_key: &str,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        let _gate = self.gate.lock().await;
        self.conn
            .execute(
                "UPDATE processed_messages SET status = ?2, finished_at = ?3 WHERE message_key = ?1",
                params![message_key, status.as_str(), now_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("finish_message: {e}")))?;
        Ok(())
    }

    async fn message_status(
        &self,
        message_key: &str,
    ) -> Result<Option<MessageStatus>, StoreError> {
        let _gate = self.gate.lock().await;
        let err = row_err("message_status");
        let mut rows = self
            .conn
            .query(
                "SELECT status FROM processed_messages WHERE message_key = ?1",
                params![message_key],
            )
            .await
            .map_err(&err)?;
        match rows.next().await.map_err(&err)? {
            Some(row) => {
                let status: String = row.get(0).map_err(&err)?;
                Ok(Some(str_to_msg_status(&status)))
            }
            None => Ok(None),
        }
    }

    async fn intent_committed(
        &self,
        message_key: &str,
        sequence_index: usize,
    ) -> Result<bool, StoreError> {
        let _gate = self.gate.lock().await;
        query_intent_committed(&self.conn, message_key, sequence_index).await
    }

    async fn save_incomplete(&self, request: &NewIncompleteRequest) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(&request.payload)
            .map_err(|e| StoreError::Serialization(format!("incomplete payload: {e}")))?;
        let missing = serde_json::to_string(&request.missing_fields)
            .map_err(|e| StoreError::Serialization(format!("incomplete fields: {e}")))?;
        let _gate = self.gate.lock().await;
        self.conn
            .execute(
                "INSERT INTO incomplete_requests (sender, message_key, kind, payload,
                 missing_fields, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    request.sender.as_str(),
                    request.message_key.as_str(),
                    request.kind.as_str(),
                    payload,
                    missing,
                    now_str()
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save_incomplete: {e}")))?;
        let id = self.conn.last_insert_rowid();
        debug!(id, sender = %request.sender, kind = %request.kind, "Incomplete request saved");
        Ok(id)
    }

    async fn open_incomplete(
        &self,
        sender: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<IncompleteRequest>, StoreError> {
        let _gate = self.gate.lock().await;
        let err = row_err("open_incomplete");
        let mut rows = self
            .conn
            .query(
                "SELECT id, sender, message_key, kind, payload, missing_fields, created_at
                 FROM incomplete_requests
                 WHERE sender = ?1 AND resolved_at IS NULL AND created_at >= ?2
                 ORDER BY id",
                params![sender, since.to_rfc3339_opts(SecondsFormat::Millis, true)],
            )
            .await
            .map_err(&err)?;
        let mut requests = Vec::new();
        while let Some(row) = rows.next().await.map_err(&err)? {
            requests.push(row_to_incomplete(&row)?);
        }
        Ok(requests)
    }

    async fn resolve_incomplete(&self, ids: &[i64]) -> Result<(), StoreError> {
        let _gate = self.gate.lock().await;
        let resolved_at = now_str();
        for id in ids {
            self.conn
                .execute(
                    "UPDATE incomplete_requests SET resolved_at = ?2
                     WHERE id = ?1 AND resolved_at IS NULL",
                    params![*id, resolved_at.as_str()],
                )
                .await
                .map_err(|e| StoreError::Query(format!("resolve_incomplete: {e}")))?;
        }
        Ok(())
    }

    async fn active_animals(&self) -> Result<Vec<Animal>, StoreError> {
        let _gate = self.gate.lock().await;
        query_active_animals(&self.conn).await
    }

    async fn present_animals(&self) -> Result<Vec<AnimalSummary>, StoreError> {
        let _gate = self.gate.lock().await;
        query_present_animals(&self.conn).await
    }

    async fn animal_roster(&self) -> Result<Vec<AnimalStatus>, StoreError> {
        let _gate = self.gate.lock().await;
        let err = row_err("animal_roster");
        let sql = format!(
            "SELECT a.id, a.name, a.species, e.status, e.location FROM animals a
             {LATEST_EVENT_JOIN}
             WHERE a.is_active = 1 ORDER BY a.id"
        );
        let mut rows = self.conn.query(&sql, ()).await.map_err(&err)?;
        let mut roster = Vec::new();
        while let Some(row) = rows.next().await.map_err(&err)? {
            let status = row.get::<String>(3).ok();
            let location = row.get::<String>(4).ok();
            let present = status.as_deref() == Some(PRESENT_STATUS)
                && location.as_deref() == Some(PRESENT_LOCATION);
            roster.push(AnimalStatus {
                animal: AnimalSummary {
                    id: row.get(0).map_err(&err)?,
                    name: row.get(1).map_err(&err)?,
                    species: row.get(2).map_err(&err)?,
                },
                status,
                location,
                present,
            });
        }
        Ok(roster)
    }

    async fn get_expense(&self, id: i64) -> Result<Option<ExpenseRecord>, StoreError> {
        let _gate = self.gate.lock().await;
        let sql = format!("SELECT {EXPENSE_COLUMNS} FROM expenses WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(|e| StoreError::Query(format!("get_expense: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_expense: {e}")))?
        {
            Some(row) => Ok(Some(row_to_expense(&row)?)),
            None => Ok(None),
        }
    }

    async fn expense_allocations(
        &self,
        expense_id: i64,
    ) -> Result<Vec<ExpenseAllocation>, StoreError> {
        let _gate = self.gate.lock().await;
        let err = row_err("expense_allocations");
        let mut rows = self
            .conn
            .query(
                "SELECT expense_id, animal_id, portion_amount FROM expense_allocations
                 WHERE expense_id = ?1 ORDER BY id",
                params![expense_id],
            )
            .await
            .map_err(&err)?;
        let mut allocations = Vec::new();
        while let Some(row) = rows.next().await.map_err(&err)? {
            let portion: String = row.get(2).map_err(&err)?;
            allocations.push(ExpenseAllocation {
                expense_id: row.get(0).map_err(&err)?,
                animal_id: row.get(1).map_err(&err)?,
                portion_amount: parse_money(&portion)?,
            });
        }
        Ok(allocations)
    }

    async fn expenses_for_message(
        &self,
        message_key: &str,
    ) -> Result<Vec<ExpenseRecord>, StoreError> {
        let _gate = self.gate.lock().await;
        let err = row_err("expenses_for_message");
        let sql = format!("SELECT {EXPENSE_COLUMNS} FROM expenses WHERE message_key = ?1 ORDER BY id");
        let mut rows = self
            .conn
            .query(&sql, params![message_key])
            .await
            .map_err(&err)?;
        let mut expenses = Vec::new();
        while let Some(row) = rows.next().await.map_err(&err)? {
            expenses.push(row_to_expense(&row)?);
        }
        Ok(expenses)
    }

    async fn count_expenses(&self) -> Result<i64, StoreError> {
        let _gate = self.gate.lock().await;
        query_count(&self.conn, "SELECT COUNT(*) FROM expenses").await
    }

    async fn count_allocations(&self) -> Result<i64, StoreError> {
        let _gate = self.gate.lock().await;
        query_count(&self.conn, "SELECT COUNT(*) FROM expense_allocations").await
    }
}

// ── Transaction ─────────────────────────────────────────────────────

/// An open `BEGIN IMMEDIATE` transaction holding the write gate.
struct LibSqlTx {
    conn: Connection,
    gate: Option<OwnedMutexGuard<()>>,
    last_ids: HashMap<String, i64>,
    finished: bool,
}

impl LibSqlTx {
    /// Run an INSERT and remember the id it assigned for `table`.
    async fn insert(
        &mut self,
        table: &str,
        sql: &str,
        values: Vec<libsql::Value>,
    ) -> Result<i64, StoreError> {
        self.conn
            .execute(sql, libsql::params::Params::Positional(values))
            .await
            .map_err(|e| StoreError::Query(format!("insert into {table}: {e}")))?;
        let id = self.conn.last_insert_rowid();
        self.last_ids.insert(table.to_string(), id);
        Ok(id)
    }

    async fn finish(mut self: Box<Self>, sql: &str) -> Result<(), StoreError> {
        self.finished = true;
        let result = self
            .conn
            .execute(sql, ())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Query(format!("{}: {e}", sql.to_lowercase())));
        // A failed COMMIT can leave the transaction open; close it before
        // the next holder of the gate issues BEGIN.
        if result.is_err() && sql == "COMMIT" {
            if let Err(e) = self.conn.execute("ROLLBACK", ()).await {
                warn!(error = %e, "Rollback after failed commit failed");
            }
        }
        self.gate.take();
        result
    }
}

impl Drop for LibSqlTx {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Abandoned transaction: roll back before releasing the gate so the
        // next writer never sees an open transaction.
        let conn = self.conn.clone();
        let gate = self.gate.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn.execute("ROLLBACK", ()).await {
                        warn!(error = %e, "Rollback of abandoned transaction failed");
                    }
                    drop(gate);
                });
            }
            Err(_) => warn!("Transaction dropped outside a runtime; not rolled back"),
        }
    }
}

#[async_trait]
impl LedgerTx for LibSqlTx {
    async fn insert_expense(&mut self, record: &NewExpense) -> Result<i64, StoreError> {
        let id = self
            .insert(
                "expenses",
                "INSERT INTO expenses (date, category_id, amount, description, provider,
                 responsible_party, payment_method, photo_reference, message_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                vec![
                    record.date.to_string().into(),
                    record.category_id.into(),
                    record.amount.to_string().into(),
                    record.description.clone().into(),
                    opt_text(record.provider.as_deref()),
                    opt_text(record.responsible_party.as_deref()),
                    opt_text(record.payment_method.as_deref()),
                    opt_text(record.photo_reference.as_deref()),
                    opt_text(record.message_key.as_deref()),
                    now_str().into(),
                ],
            )
            .await?;
        debug!(expense_id = id, amount = %record.amount, "Expense inserted");
        Ok(id)
    }

    async fn insert_allocation(&mut self, row: &ExpenseAllocation) -> Result<(), StoreError> {
        self.insert(
            "expense_allocations",
            "INSERT INTO expense_allocations (expense_id, animal_id, portion_amount)
             VALUES (?1, ?2, ?3)",
            vec![
                row.expense_id.into(),
                row.animal_id.into(),
                row.portion_amount.to_string().into(),
            ],
        )
        .await?;
        Ok(())
    }

    fn last_inserted_id(&self, table: &str) -> Option<i64> {
        self.last_ids.get(table).copied()
    }

    async fn active_animals(&mut self) -> Result<Vec<Animal>, StoreError> {
        query_active_animals(&self.conn).await
    }

    async fn present_animals(&mut self) -> Result<Vec<AnimalSummary>, StoreError> {
        query_present_animals(&self.conn).await
    }

    async fn find_animal(&mut self, id: i64) -> Result<Option<Animal>, StoreError> {
        let err = row_err("find_animal");
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, species, is_active FROM animals WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(&err)?;
        match rows.next().await.map_err(&err)? {
            Some(row) => Ok(Some(Animal {
                id: row.get(0).map_err(&err)?,
                name: row.get(1).map_err(&err)?,
                species: row.get(2).map_err(&err)?,
                is_active: row.get::<i64>(3).map_err(&err)? != 0,
            })),
            None => Ok(None),
        }
    }

    async fn insert_animal(&mut self, animal: &NewAnimal) -> Result<i64, StoreError> {
        self.insert(
            "animals",
            "INSERT INTO animals (name, species, age, coat_colors, health_condition,
             photo_reference, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
            vec![
                animal.name.clone().into(),
                animal.species.clone().into(),
                opt_text(animal.age.as_deref()),
                animal.coat_colors.clone().into(),
                opt_text(animal.health_condition.as_deref()),
                opt_text(animal.photo_reference.as_deref()),
                now_str().into(),
            ],
        )
        .await
    }

    async fn insert_animal_event(&mut self, event: &NewAnimalEvent) -> Result<i64, StoreError> {
        self.insert(
            "animal_events",
            "INSERT INTO animal_events (animal_id, status, location, person, event_date,
             message_key, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            vec![
                event.animal_id.into(),
                event.status.clone().into(),
                event.location.clone().into(),
                opt_text(event.person.as_deref()),
                event.event_date.to_string().into(),
                opt_text(event.message_key.as_deref()),
                now_str().into(),
            ],
        )
        .await
    }

    async fn latest_event(&mut self, animal_id: i64) -> Result<Option<AnimalEvent>, StoreError> {
        query_latest_event(&self.conn, animal_id).await
    }

    async fn insert_vet_visit(&mut self, visit: &NewVetVisit) -> Result<i64, StoreError> {
        self.insert(
            "vet_visits",
            "INSERT INTO vet_visits (animal_id, vet, visit_date, diagnosis, treatment,
             next_appointment, companion, message_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            vec![
                opt_int(visit.animal_id),
                opt_text(visit.vet.as_deref()),
                visit.visit_date.to_string().into(),
                opt_text(visit.diagnosis.as_deref()),
                opt_text(visit.treatment.as_deref()),
                opt_text(visit.next_appointment.as_deref()),
                opt_text(visit.companion.as_deref()),
                opt_text(visit.message_key.as_deref()),
                now_str().into(),
            ],
        )
        .await
    }

    async fn insert_movement(
        &mut self,
        movement: &NewMovement,
        animal_ids: &[i64],
    ) -> Result<i64, StoreError> {
        let movement_id = self
            .insert(
                "movements",
                "INSERT INTO movements (direction, destination, responsible, movement_date,
                 notes, message_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                vec![
                    movement.direction.clone().into(),
                    movement.destination.clone().into(),
                    opt_text(movement.responsible.as_deref()),
                    movement.movement_date.to_string().into(),
                    opt_text(movement.notes.as_deref()),
                    opt_text(movement.message_key.as_deref()),
                    now_str().into(),
                ],
            )
            .await?;
        for animal_id in animal_ids {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO movement_animals (movement_id, animal_id) VALUES (?1, ?2)",
                    params![movement_id, *animal_id],
                )
                .await
                .map_err(|e| StoreError::Query(format!("insert into movement_animals: {e}")))?;
        }
        Ok(movement_id)
    }

    async fn insert_inquiry(&mut self, inquiry: &NewInquiry) -> Result<i64, StoreError> {
        self.insert(
            "inquiries",
            "INSERT INTO inquiries (topic, animal_name, animal_id, suggested_answer, sender,
             message_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            vec![
                inquiry.topic.clone().into(),
                opt_text(inquiry.animal_name.as_deref()),
                opt_int(inquiry.animal_id),
                opt_text(inquiry.suggested_answer.as_deref()),
                opt_text(inquiry.sender.as_deref()),
                opt_text(inquiry.message_key.as_deref()),
                now_str().into(),
            ],
        )
        .await
    }

    async fn intent_committed(
        &mut self,
        message_key: &str,
        sequence_index: usize,
    ) -> Result<bool, StoreError> {
        query_intent_committed(&self.conn, message_key, sequence_index).await
    }

    async fn record_intent(
        &mut self,
        message_key: &str,
        sequence_index: usize,
        kind: &str,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO message_intents (message_key, sequence_index, kind, committed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![message_key, sequence_index as i64, kind, now_str()],
            )
            .await
            .map_err(|e| StoreError::Constraint(format!("record_intent: {e}")))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.finish("ROLLBACK").await
    }
}
