//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

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
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                last_history_id TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_users_email ON users(lower(email));

            CREATE TABLE IF NOT EXISTS outbound_messages (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                investor_id TEXT NOT NULL,
                to_addresses TEXT NOT NULL DEFAULT '[]',
                cc_addresses TEXT NOT NULL DEFAULT '[]',
                subject TEXT NOT NULL,
                from_address TEXT NOT NULL,
                body TEXT NOT NULL,
                status TEXT NOT NULL,
                thread_id TEXT,
                gmail_message_id TEXT,
                gmail_references TEXT,
                previous_message_id TEXT,
                provider_message_id TEXT,
                scheduled_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outbound_user_status
                ON outbound_messages(user_id, status, created_at);
            CREATE INDEX IF NOT EXISTS idx_outbound_investor
                ON outbound_messages(user_id, investor_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_outbound_one_draft
                ON outbound_messages(user_id, investor_id) WHERE status = 'DRAFT';
            CREATE UNIQUE INDEX IF NOT EXISTS idx_outbound_answered_provider
                ON outbound_messages(provider_message_id)
                WHERE status = 'ANSWERED' AND provider_message_id IS NOT NULL;

            CREATE TABLE IF NOT EXISTS shortlists (
                user_id TEXT NOT NULL,
                investor_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'shortlisted',
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, investor_id)
            );
        "#,
    },
];

/// Run all pending migrations. Safe to call on every startup.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let final_version = get_current_version(conn).await?;
    tracing::info!(version = final_version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
