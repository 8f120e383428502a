//! libSQL backend: async `ScheduleStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::funnel::record::{EntryPoint, LastSend, ScheduleRecord, SendStatus, TrackSlot};
use crate::store::migrations;
use crate::store::traits::ScheduleStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
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
        migrations::run_migrations(&backend.conn).await?;
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
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_records(
        &self,
        sql: &str,
        op: &str,
    ) -> Result<Vec<ScheduleRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut records = Vec::new();
        loop {
            let row = match rows.next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            };
            match row_to_record(&row) {
                Ok(r) => records.push(r),
                Err(e) => tracing::warn!("Skipping schedule row in {op}: {e}"),
            }
        }
        Ok(records)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Spreadsheet-era exports wrote plain "YYYY-MM-DD HH:MM:SS"
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

/// Both halves present, or no slot at all.
fn slot_from_columns(
    message_id: Option<String>,
    run_at: Option<String>,
    attempt: i64,
) -> Option<TrackSlot> {
    match (message_id, run_at) {
        (Some(id), Some(at)) if !id.is_empty() && !at.is_empty() => Some(TrackSlot::retry(
            id,
            parse_datetime(&at),
            u32::try_from(attempt).unwrap_or(0),
        )),
        _ => None,
    }
}

/// Map a libsql Row to a ScheduleRecord.
///
/// Column order matches RECORD_COLUMNS.
fn row_to_record(row: &libsql::Row) -> Result<ScheduleRecord, DatabaseError> {
    let text = |idx: i32| row.get::<String>(idx).ok();

    let user_id = row
        .get::<String>(0)
        .map_err(|e| DatabaseError::Serialization(format!("user_id: {e}")))?;

    let entry_point = text(10).and_then(|s| s.parse::<EntryPoint>().ok());
    let attempt = |idx: i32| row.get::<i64>(idx).unwrap_or(0);

    let last_send = match (text(11), text(12), text(13)) {
        (Some(message_id), Some(sent_at), Some(status)) => Some(LastSend {
            message_id,
            sent_at: parse_datetime(&sent_at),
            status: status
                .parse::<SendStatus>()
                .map_err(DatabaseError::Serialization)?,
        }),
        _ => None,
    };

    Ok(ScheduleRecord {
        user_id,
        chat_destination: text(1).unwrap_or_default(),
        display_name: text(2),
        main_track: slot_from_columns(text(3), text(4), attempt(16)),
        reminder_track: slot_from_columns(text(5), text(6), attempt(17)),
        stopped: row.get::<i64>(7).unwrap_or(0) != 0,
        last_activity_at: parse_datetime(&text(8).unwrap_or_default()),
        form_state: text(9),
        entry_point,
        last_send,
        created_at: parse_datetime(&text(14).unwrap_or_default()),
        updated_at: parse_datetime(&text(15).unwrap_or_default()),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const RECORD_COLUMNS: &str = "user_id, chat_destination, display_name, main_message_id, main_run_at, reminder_message_id, reminder_run_at, stopped, last_activity_at, form_state, entry_point, last_send_message_id, last_send_at, last_send_status, created_at, updated_at, main_attempt, reminder_attempt";

#[async_trait]
impl ScheduleStore for LibSqlBackend {
    async fn get_record(&self, user_id: &str) -> Result<Option<ScheduleRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM schedule_records WHERE user_id = ?1"),
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_record: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_record: {e}"))),
        }
    }

    async fn put_record(&self, record: &ScheduleRecord) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let main = record.main_track.as_ref();
        let reminder = record.reminder_track.as_ref();
        let last = record.last_send.as_ref();

        self.conn()
            .execute(
                "INSERT INTO schedule_records (user_id, chat_destination, display_name, main_message_id, main_run_at, reminder_message_id, reminder_run_at, stopped, last_activity_at, form_state, entry_point, last_send_message_id, last_send_at, last_send_status, created_at, updated_at, main_attempt, reminder_attempt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                 ON CONFLICT(user_id) DO UPDATE SET
                    chat_destination = excluded.chat_destination,
                    display_name = excluded.display_name,
                    main_message_id = excluded.main_message_id,
                    main_run_at = excluded.main_run_at,
                    reminder_message_id = excluded.reminder_message_id,
                    reminder_run_at = excluded.reminder_run_at,
                    stopped = excluded.stopped,
                    last_activity_at = excluded.last_activity_at,
                    form_state = excluded.form_state,
                    entry_point = excluded.entry_point,
                    last_send_message_id = excluded.last_send_message_id,
                    last_send_at = excluded.last_send_at,
                    last_send_status = excluded.last_send_status,
                    updated_at = excluded.updated_at,
                    main_attempt = excluded.main_attempt,
                    reminder_attempt = excluded.reminder_attempt",
                params![
                    record.user_id.clone(),
                    record.chat_destination.clone(),
                    opt_text(record.display_name.as_deref()),
                    opt_text(main.map(|s| s.message_id.as_str())),
                    opt_datetime(main.map(|s| s.run_at)),
                    opt_text(reminder.map(|s| s.message_id.as_str())),
                    opt_datetime(reminder.map(|s| s.run_at)),
                    record.stopped as i64,
                    record.last_activity_at.to_rfc3339(),
                    opt_text(record.form_state.as_deref()),
                    opt_text(record.entry_point.map(|e| e.as_str())),
                    opt_text(last.map(|l| l.message_id.as_str())),
                    opt_datetime(last.map(|l| l.sent_at)),
                    opt_text(last.map(|l| l.status.to_string()).as_deref()),
                    record.created_at.to_rfc3339(),
                    now,
                    main.map_or(0, |s| s.attempt as i64),
                    reminder.map_or(0, |s| s.attempt as i64),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_record: {e}")))?;

        debug!(user_id = %record.user_id, "Schedule record written");
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<ScheduleRecord>, DatabaseError> {
        self.query_records(
            &format!("SELECT {RECORD_COLUMNS} FROM schedule_records ORDER BY user_id"),
            "list_records",
        )
        .await
    }

    async fn list_failed(&self) -> Result<Vec<ScheduleRecord>, DatabaseError> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM schedule_records WHERE last_send_status = 'FAILED_MAX_RETRIES' ORDER BY last_send_at"
            ),
            "list_failed",
        )
        .await
    }
}

// ── Tests ───────────────────────────────────────────────────────────
