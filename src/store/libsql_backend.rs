//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Address lists are stored as
//! JSON arrays and matched with `json_each`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::messages::{
    DraftFields, MessageStatus, OutboundMessage, Shortlist, ShortlistStatus, User,
};
use crate::store::migrations;
use crate::store::traits::{AnsweredKey, Database, SentMessageQuery};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_messages(
        &self,
        op: &str,
        sql: &str,
        values: Vec<libsql::Value>,
    ) -> Result<Vec<OutboundMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, libsql::params::Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            out.push(row_to_message(&row)?);
        }
        Ok(out)
    }

    async fn query_one_message(
        &self,
        op: &str,
        sql: &str,
        values: Vec<libsql::Value>,
    ) -> Result<Option<OutboundMessage>, DatabaseError> {
        Ok(self.query_messages(op, sql, values).await?.into_iter().next())
    }

    async fn find_draft(
        &self,
        user_id: &str,
        investor_id: &str,
    ) -> Result<Option<OutboundMessage>, DatabaseError> {
        self.query_one_message(
            "find_draft",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM outbound_messages
                 WHERE user_id = ?1 AND investor_id = ?2 AND status = 'DRAFT'"
            ),
            vec![text(user_id), text(investor_id)],
        )
        .await
    }

    async fn update_draft(
        &self,
        id: Uuid,
        fields: &DraftFields,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE outbound_messages
                 SET to_addresses = ?2, cc_addresses = ?3, subject = ?4, from_address = ?5,
                     body = ?6, thread_id = ?7, previous_message_id = ?8, updated_at = ?9
                 WHERE id = ?1 AND status = 'DRAFT'",
                params![
                    id.to_string(),
                    json_list(&fields.to)?,
                    json_list(&fields.cc)?,
                    fields.subject.clone(),
                    fields.from_address.clone(),
                    fields.body.clone(),
                    opt_text(fields.thread_id.as_deref()),
                    opt_text(fields.previous_message_id.map(|u| u.to_string()).as_deref()),
                    fmt_ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_draft: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn text(s: &str) -> libsql::Value {
    libsql::Value::Text(s.to_string())
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn json_list(items: &[String]) -> Result<String, DatabaseError> {
    serde_json::to_string(items).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// `?start, ?start+1, ...` for `count` values.
/// `lower(?n), lower(?n+1), ...` for case-insensitive `IN` lists.
fn lower_placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("lower(?{i})"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn map_write_error(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

const MESSAGE_COLUMNS: &str = "id, user_id, investor_id, to_addresses, cc_addresses, subject, \
    from_address, body, status, thread_id, gmail_message_id, gmail_references, \
    previous_message_id, provider_message_id, scheduled_at, created_at, updated_at";

/// Map a libsql Row (in MESSAGE_COLUMNS order) to an OutboundMessage.
fn row_to_message(row: &libsql::Row) -> Result<OutboundMessage, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let to_json: String = row.get(3).map_err(get_err)?;
    let cc_json: String = row.get(4).map_err(get_err)?;
    let status_str: String = row.get(8).map_err(get_err)?;
    let previous: Option<String> = row.get(12).map_err(get_err)?;
    let scheduled: Option<String> = row.get(14).map_err(get_err)?;
    let created_str: String = row.get(15).map_err(get_err)?;
    let updated_str: String = row.get(16).map_err(get_err)?;

    Ok(OutboundMessage {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("message id {id_str}: {e}")))?,
        user_id: row.get(1).map_err(get_err)?,
        investor_id: row.get(2).map_err(get_err)?,
        to: serde_json::from_str(&to_json).unwrap_or_default(),
        cc: serde_json::from_str(&cc_json).unwrap_or_default(),
        subject: row.get(5).map_err(get_err)?,
        from_address: row.get(6).map_err(get_err)?,
        body: row.get(7).map_err(get_err)?,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        thread_id: row.get(9).map_err(get_err)?,
        gmail_message_id: row.get(10).map_err(get_err)?,
        gmail_references: row.get(11).map_err(get_err)?,
        previous_message_id: previous.and_then(|p| Uuid::parse_str(&p).ok()),
        provider_message_id: row.get(13).map_err(get_err)?,
        scheduled_at: scheduled.as_deref().map(parse_datetime),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_user(row: &libsql::Row) -> Result<User, libsql::Error> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        last_history_id: row.get(2)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Users ───────────────────────────────────────────────────────

    async fn upsert_user(&self, user: &User) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO users (id, email, last_history_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    email = excluded.email,
                    last_history_id = COALESCE(excluded.last_history_id, users.last_history_id)",
                params![
                    user.id.clone(),
                    user.email.clone(),
                    opt_text(user.last_history_id.as_deref()),
                ],
            )
            .await
            .map_err(|e| map_write_error("upsert_user", e))?;
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, email, last_history_id FROM users WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_user: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_user(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_user: {e}"))),
        }
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, email, last_history_id FROM users WHERE lower(email) = lower(?1)",
                params![email.trim()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_user_by_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_user(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_user_by_email: {e}"))),
        }
    }

    async fn set_last_history_id(
        &self,
        user_id: &str,
        history_id: &str,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE users SET last_history_id = ?2 WHERE id = ?1",
                params![user_id, history_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_last_history_id: {e}")))?;
        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "user".into(),
                id: user_id.to_string(),
            });
        }
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &OutboundMessage) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO outbound_messages ({MESSAGE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    message.id.to_string(),
                    message.user_id.clone(),
                    message.investor_id.clone(),
                    json_list(&message.to)?,
                    json_list(&message.cc)?,
                    message.subject.clone(),
                    message.from_address.clone(),
                    message.body.clone(),
                    message.status.as_str(),
                    opt_text(message.thread_id.as_deref()),
                    opt_text(message.gmail_message_id.as_deref()),
                    opt_text(message.gmail_references.as_deref()),
                    opt_text(message.previous_message_id.map(|u| u.to_string()).as_deref()),
                    opt_text(message.provider_message_id.as_deref()),
                    opt_text(message.scheduled_at.map(fmt_ts).as_deref()),
                    fmt_ts(message.created_at),
                    fmt_ts(message.updated_at),
                ],
            )
            .await
            .map_err(|e| map_write_error("insert_message", e))?;

        debug!(id = %message.id, status = %message.status, "Message inserted into DB");
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<OutboundMessage>, DatabaseError> {
        self.query_one_message(
            "get_message",
            &format!("SELECT {MESSAGE_COLUMNS} FROM outbound_messages WHERE id = ?1"),
            vec![text(&id.to_string())],
        )
        .await
    }

    async fn save_draft(
        &self,
        user_id: &str,
        investor_id: &str,
        fields: DraftFields,
    ) -> Result<OutboundMessage, DatabaseError> {
        if let Some(existing) = self.find_draft(user_id, investor_id).await? {
            self.update_draft(existing.id, &fields).await?;
            debug!(id = %existing.id, "Draft updated");
            return self.get_message(existing.id).await?.ok_or(DatabaseError::NotFound {
                entity: "message".into(),
                id: existing.id.to_string(),
            });
        }

        let draft = OutboundMessage::draft(user_id, investor_id, fields.clone());
        match self.insert_message(&draft).await {
            Ok(()) => Ok(draft),
            // Lost a race with a concurrent save; update the winner instead.
            Err(DatabaseError::Constraint(_)) => {
                let existing = self.find_draft(user_id, investor_id).await?.ok_or(
                    DatabaseError::NotFound {
                        entity: "draft".into(),
                        id: format!("{user_id}/{investor_id}"),
                    },
                )?;
                self.update_draft(existing.id, &fields).await?;
                self.get_message(existing.id).await?.ok_or(DatabaseError::NotFound {
                    entity: "message".into(),
                    id: existing.id.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn update_message_status(
        &self,
        id: Uuid,
        status: MessageStatus,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE outbound_messages SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), status.as_str(), fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| map_write_error("update_message_status", e))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            });
        }
        debug!(id = %id, status = %status, "Message status updated");
        Ok(())
    }

    async fn set_scheduled_at(
        &self,
        id: Uuid,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE outbound_messages SET scheduled_at = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    id.to_string(),
                    opt_text(scheduled_at.map(fmt_ts).as_deref()),
                    fmt_ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_scheduled_at: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn find_latest_sent(
        &self,
        query: &SentMessageQuery,
    ) -> Result<Option<OutboundMessage>, DatabaseError> {
        if query.from_any.is_empty() || (query.to_any.is_empty() && query.subject.is_none()) {
            return Ok(None);
        }

        let mut values = vec![text(&query.user_id)];
        let from_start = values.len() + 1;
        values.extend(query.from_any.iter().map(|a| text(a)));

        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbound_messages
             WHERE user_id = ?1 AND status = 'SENT'
               AND lower(from_address) IN ({})",
            lower_placeholders(from_start, query.from_any.len()),
        );
        if !query.to_any.is_empty() {
            let to_start = values.len() + 1;
            values.extend(query.to_any.iter().map(|a| text(a)));
            sql.push_str(&format!(
                " AND EXISTS (
                    SELECT 1 FROM json_each(outbound_messages.to_addresses)
                    WHERE lower(json_each.value) IN ({})
                )",
                lower_placeholders(to_start, query.to_any.len()),
            ));
        }
        if let Some(subject) = &query.subject {
            values.push(text(subject));
            sql.push_str(&format!(" AND lower(subject) = lower(?{})", values.len()));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT 1");

        self.query_one_message("find_latest_sent", &sql, values).await
    }

    async fn find_answered(
        &self,
        key: &AnsweredKey<'_>,
    ) -> Result<Option<OutboundMessage>, DatabaseError> {
        let mut values = vec![
            text(key.user_id),
            text(key.investor_id),
            text(key.from_address),
            text(key.subject),
            text(key.body),
        ];
        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbound_messages
             WHERE status = 'ANSWERED' AND user_id = ?1 AND investor_id = ?2
               AND from_address = ?3 AND subject = ?4 AND body = ?5"
        );
        if let Some(since) = key.since {
            values.push(libsql::Value::Text(fmt_ts(since)));
            sql.push_str(" AND created_at >= ?6");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT 1");

        self.query_one_message("find_answered", &sql, values).await
    }

    async fn find_answered_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<OutboundMessage>, DatabaseError> {
        self.query_one_message(
            "find_answered_by_provider_id",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM outbound_messages
                 WHERE status = 'ANSWERED' AND provider_message_id = ?1"
            ),
            vec![text(provider_message_id)],
        )
        .await
    }

    async fn list_messages_for_investor(
        &self,
        user_id: &str,
        investor_id: &str,
    ) -> Result<Vec<OutboundMessage>, DatabaseError> {
        self.query_messages(
            "list_messages_for_investor",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM outbound_messages
                 WHERE user_id = ?1 AND investor_id = ?2
                 ORDER BY created_at DESC, rowid DESC"
            ),
            vec![text(user_id), text(investor_id)],
        )
        .await
    }

    // ── Shortlists ──────────────────────────────────────────────────

    async fn get_shortlist(
        &self,
        user_id: &str,
        investor_id: &str,
    ) -> Result<Option<Shortlist>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, investor_id, status, updated_at FROM shortlists
                 WHERE user_id = ?1 AND investor_id = ?2",
                params![user_id, investor_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_shortlist: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_shortlist: {e}")))?
        else {
            return Ok(None);
        };

        let get_err = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
        let status_str: String = row.get(2).map_err(get_err)?;
        let updated_str: String = row.get(3).map_err(get_err)?;
        let status = status_str.parse().unwrap_or_else(|e| {
            warn!(error = %e, "Unknown shortlist status in DB");
            ShortlistStatus::Shortlisted
        });

        Ok(Some(Shortlist {
            user_id: row.get(0).map_err(get_err)?,
            investor_id: row.get(1).map_err(get_err)?,
            status,
            updated_at: parse_datetime(&updated_str),
        }))
    }

    async fn set_shortlist_status(
        &self,
        user_id: &str,
        investor_id: &str,
        status: ShortlistStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO shortlists (user_id, investor_id, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, investor_id) DO UPDATE SET
                    status = excluded.status, updated_at = excluded.updated_at",
                params![user_id, investor_id, status.as_str(), fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_shortlist_status: {e}")))?;
        Ok(())
    }
}
