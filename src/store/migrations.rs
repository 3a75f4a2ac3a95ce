//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "ledger_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                label TEXT NOT NULL,
                distributable INTEGER NOT NULL DEFAULT 0
            );
            INSERT OR IGNORE INTO categories (id, code, label, distributable) VALUES
                (1, 'veterinary', 'Veterinary', 0),
                (2, 'food', 'Food', 1),
                (3, 'litter', 'Litter', 1),
                (4, 'medicine', 'Medicine', 0),
                (5, 'transport', 'Transport', 0),
                (6, 'supplies', 'Supplies', 0),
                (7, 'other', 'Other', 0);

            CREATE TABLE IF NOT EXISTS animals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                species TEXT NOT NULL,
                age TEXT,
                coat_colors TEXT NOT NULL DEFAULT '[]',
                health_condition TEXT,
                photo_reference TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_animals_active ON animals(is_active);

            CREATE TABLE IF NOT EXISTS animal_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                animal_id INTEGER NOT NULL REFERENCES animals(id),
                status TEXT NOT NULL,
                location TEXT NOT NULL,
                person TEXT,
                event_date TEXT NOT NULL,
                message_key TEXT,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_animal_events_animal ON animal_events(animal_id, id);

            CREATE TABLE IF NOT EXISTS expenses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                category_id INTEGER NOT NULL REFERENCES categories(id),
                amount TEXT NOT NULL,
                description TEXT NOT NULL,
                provider TEXT,
                responsible_party TEXT,
                payment_method TEXT,
                photo_reference TEXT,
                message_key TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_expenses_message ON expenses(message_key);

            CREATE TABLE IF NOT EXISTS expense_allocations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                expense_id INTEGER NOT NULL REFERENCES expenses(id),
                animal_id INTEGER NOT NULL REFERENCES animals(id),
                portion_amount TEXT NOT NULL,
                UNIQUE (expense_id, animal_id)
            );
            CREATE INDEX IF NOT EXISTS idx_allocations_animal ON expense_allocations(animal_id);
        "#,
    },
    Migration {
        version: 2,
        name: "intake_records",
        sql: r#"
            CREATE TABLE IF NOT EXISTS vet_visits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                animal_id INTEGER REFERENCES animals(id),
                vet TEXT,
                visit_date TEXT NOT NULL,
                diagnosis TEXT,
                treatment TEXT,
                next_appointment TEXT,
                companion TEXT,
                message_key TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS movements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                direction TEXT NOT NULL,
                destination TEXT NOT NULL,
                responsible TEXT,
                movement_date TEXT NOT NULL,
                notes TEXT,
                message_key TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS movement_animals (
                movement_id INTEGER NOT NULL REFERENCES movements(id),
                animal_id INTEGER NOT NULL REFERENCES animals(id),
                PRIMARY KEY (movement_id, animal_id)
            );

            CREATE TABLE IF NOT EXISTS inquiries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                animal_name TEXT,
                animal_id INTEGER REFERENCES animals(id),
                suggested_answer TEXT,
                sender TEXT,
                message_key TEXT,
                created_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 3,
        name: "message_claims",
        sql: r#"
            CREATE TABLE IF NOT EXISTS processed_messages (
                message_key TEXT PRIMARY KEY,
                sender TEXT NOT NULL,
                status TEXT NOT NULL,
                claimed_at TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_processed_messages_status ON processed_messages(status);

            CREATE TABLE IF NOT EXISTS message_intents (
                message_key TEXT NOT NULL,
                sequence_index INTEGER NOT NULL,
                kind TEXT NOT NULL,
                committed_at TEXT NOT NULL,
                PRIMARY KEY (message_key, sequence_index)
            );
        "#,
    },
    Migration {
        version: 4,
        name: "incomplete_requests",
        sql: r#"
            CREATE TABLE IF NOT EXISTS incomplete_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender TEXT NOT NULL,
                message_key TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                missing_fields TEXT NOT NULL,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_incomplete_sender
                ON incomplete_requests(sender, resolved_at);
        "#,
    },
];

/// Run all pending migrations against the connection.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                StoreError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| StoreError::Migration(format!("Failed to parse migration version: {e}"))),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::CATEGORIES;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "categories",
            "animals",
            "animal_events",
            "expenses",
            "expense_allocations",
            "vet_visits",
            "movements",
            "movement_animals",
            "inquiries",
            "processed_messages",
            "message_intents",
            "incomplete_requests",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 4);
    }

    #[tokio::test]
    async fn seeded_categories_match_static_table() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT id, code, distributable FROM categories ORDER BY id", ())
            .await
            .unwrap();
        let mut seeded = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let id: i64 = row.get(0).unwrap();
            let code: String = row.get(1).unwrap();
            let distributable: i64 = row.get(2).unwrap();
            seeded.push((id, code, distributable == 1));
        }

        let expected: Vec<_> = CATEGORIES
            .iter()
            .map(|c| (c.id, c.code.to_string(), c.distributable))
            .collect();
        assert_eq!(seeded, expected);
    }
}
