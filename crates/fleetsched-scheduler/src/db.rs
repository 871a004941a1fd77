use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the schedule schema in `conn`.
///
/// Creates the `profile_schedules` table (idempotent) and an index matching
/// the due-scan predicate so the per-run query stays cheap.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS profile_schedules (
            id                 TEXT    NOT NULL PRIMARY KEY,
            name               TEXT    NOT NULL,
            enabled            INTEGER NOT NULL DEFAULT 1,
            schedule_type      TEXT    NOT NULL,   -- one_shot | recurring
            start_time         TEXT    NOT NULL,   -- fixed-width RFC 3339 UTC
            recurrence_pattern TEXT    NOT NULL DEFAULT 'none',
            recurrence_days    TEXT    NOT NULL DEFAULT '[]',  -- JSON array, 0=Sunday
            device_filter      TEXT,               -- JSON object or NULL
            profile_id         TEXT    NOT NULL,
            last_executed_at   TEXT,               -- claim marker; NULL = eligible
            created_at         TEXT    NOT NULL,
            updated_at         TEXT    NOT NULL
        ) STRICT;

        -- Due-scan: WHERE enabled = 1 AND last_executed_at IS NULL AND start_time BETWEEN …
        CREATE INDEX IF NOT EXISTS idx_profile_schedules_due
            ON profile_schedules (enabled, last_executed_at, start_time);
        ",
    )?;
    Ok(())
}

/// Timestamps are stored with fixed millisecond precision and a `Z` suffix so
/// that string comparison in SQL orders them chronologically.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}
