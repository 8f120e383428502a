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
        name: "schedule_records",
        sql: r#"
            CREATE TABLE IF NOT EXISTS schedule_records (
                user_id TEXT PRIMARY KEY,
                chat_destination TEXT NOT NULL,
                display_name TEXT,
                main_message_id TEXT,
                main_run_at TEXT,
                reminder_message_id TEXT,
                reminder_run_at TEXT,
                stopped INTEGER NOT NULL DEFAULT 0,
                last_activity_at TEXT NOT NULL,
                form_state TEXT,
                entry_point TEXT NOT NULL DEFAULT 'funnel',
                last_send_message_id TEXT,
                last_send_at TEXT,
                last_send_status TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_schedule_main_run_at ON schedule_records(main_run_at);
            CREATE INDEX IF NOT EXISTS idx_schedule_reminder_run_at ON schedule_records(reminder_run_at);
        "#,
    },
    Migration {
        version: 2,
        name: "last_send_status_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_schedule_last_send_status
                ON schedule_records(last_send_status);
            CREATE INDEX IF NOT EXISTS idx_schedule_last_activity
                ON schedule_records(last_activity_at);
        "#,
    },
    Migration {
        version: 3,
        name: "per_track_attempts_nullable_entry",
        sql: r#"
            CREATE TABLE schedule_records_v3 (
                user_id TEXT PRIMARY KEY,
                chat_destination TEXT NOT NULL,
                display_name TEXT,
                main_message_id TEXT,
                main_run_at TEXT,
                reminder_message_id TEXT,
                reminder_run_at TEXT,
                stopped INTEGER NOT NULL DEFAULT 0,
                last_activity_at TEXT NOT NULL,
                form_state TEXT,
                entry_point TEXT,
                last_send_message_id TEXT,
                last_send_at TEXT,
                last_send_status TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                main_attempt INTEGER NOT NULL DEFAULT 0,
                reminder_attempt INTEGER NOT NULL DEFAULT 0
            );
            INSERT INTO schedule_records_v3 (user_id, chat_destination, display_name, main_message_id, main_run_at, reminder_message_id, reminder_run_at, stopped, last_activity_at, form_state, entry_point, last_send_message_id, last_send_at, last_send_status, created_at, updated_at)
                SELECT user_id, chat_destination, display_name, main_message_id, main_run_at, reminder_message_id, reminder_run_at, stopped, last_activity_at, form_state, entry_point, last_send_message_id, last_send_at, last_send_status, created_at, updated_at
                FROM schedule_records;
            DROP TABLE schedule_records;
            ALTER TABLE schedule_records_v3 RENAME TO schedule_records;
            CREATE INDEX IF NOT EXISTS idx_schedule_main_run_at ON schedule_records(main_run_at);
            CREATE INDEX IF NOT EXISTS idx_schedule_reminder_run_at ON schedule_records(reminder_run_at);
            CREATE INDEX IF NOT EXISTS idx_schedule_last_send_status
                ON schedule_records(last_send_status);
            CREATE INDEX IF NOT EXISTS idx_schedule_last_activity
                ON schedule_records(last_activity_at);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
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

    tracing::info!(
        version = get_current_version(conn).await?,
        "Database migrations complete"
    );

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
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &["schedule_records", "_migrations"] {
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
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        assert_eq!(row1.get::<i64>(0).unwrap(), 1);
        assert_eq!(row1.get::<String>(1).unwrap(), "schedule_records");

        let row2 = rows.next().await.unwrap().unwrap();
        assert_eq!(row2.get::<i64>(0).unwrap(), 2);
        assert_eq!(row2.get::<String>(1).unwrap(), "last_send_status_index");

        let row3 = rows.next().await.unwrap().unwrap();
        assert_eq!(row3.get::<i64>(0).unwrap(), 3);
        assert_eq!(row3.get::<String>(1).unwrap(), "per_track_attempts_nullable_entry");
    }

    #[tokio::test]
    async fn rebuild_keeps_existing_rows() {
        let conn = test_conn().await;
        conn.execute(
            "CREATE TABLE _migrations (version INTEGER PRIMARY KEY, name TEXT NOT NULL, applied_at TEXT NOT NULL DEFAULT (datetime('now')))",
            (),
        )
        .await
        .unwrap();
        for m in &MIGRATIONS[..2] {
            conn.execute_batch(m.sql).await.unwrap();
            seed_version(&conn, m.version, m.name).await.unwrap();
        }
        conn.execute(
            "INSERT INTO schedule_records (user_id, chat_destination, main_message_id, main_run_at, last_activity_at, created_at, updated_at)
             VALUES ('old', '9', 'message_2', '2026-01-05 10:30:00', '2026-01-04 09:00:00', '2026-01-01 00:00:00', '2026-01-01 00:00:00')",
            (),
        )
        .await
        .unwrap();

        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query(
                "SELECT main_message_id, entry_point, main_attempt FROM schedule_records WHERE user_id = 'old'",
                (),
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<String>(0).unwrap(), "message_2");
        assert_eq!(row.get::<String>(1).unwrap(), "funnel");
        assert_eq!(row.get::<i64>(2).unwrap(), 0);
    }
}
