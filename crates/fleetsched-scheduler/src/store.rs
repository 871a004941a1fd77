use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{error, info};
use uuid::Uuid;

use crate::db::{format_ts, init_db, parse_ts};
use crate::schedule::release_start;
use crate::error::{Result, SchedulerError};
use crate::types::{ClaimResult, Job, NewJob, RecurrencePattern, ScheduleType};

/// How long a writer waits on a locked database file before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "id, name, enabled, schedule_type, start_time, recurrence_pattern,
     recurrence_days, device_filter, profile_id, last_executed_at, created_at, updated_at";

/// Persistent job state as the execution engine sees it.
///
/// `claim` is the only concurrency-control primitive: it must be an atomic
/// conditional update, never a read followed by a write.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enabled, unclaimed jobs with `window_start <= start_time <= window_end`,
    /// earliest first.
    async fn due_jobs(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<Job>>;

    /// Set `last_executed_at = at` only if it is still NULL.
    async fn claim(&self, id: &str, at: DateTime<Utc>) -> Result<ClaimResult>;

    /// Move a claimed job to `next_start` and clear its claim marker.
    async fn rearm(&self, id: &str, next_start: DateTime<Utc>) -> Result<()>;

    /// Enabled, unclaimed jobs whose start time is already before `before`.
    /// These fell out of the due window and will not be selected again.
    async fn overdue_jobs(&self, before: DateTime<Utc>) -> Result<Vec<Job>>;
}

/// SQLite-backed [`JobStore`].
///
/// Several stores (or processes) may point at the same database file; the
/// claim is a single conditional `UPDATE`, so only one of them wins.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Wrap an existing connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open (or create) the database file at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    /// Every statement is self-contained, so a holder that panicked cannot
    /// leave the connection mid-transaction; recover the guard instead of
    /// failing every later call.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a job. Management layers normally own this; the engine never calls it.
    pub fn insert_job(&self, new: NewJob) -> Result<Job> {
        let now = Utc::now();
        let id = Uuid::now_v7().to_string();
        let days_json = serde_json::to_string(&new.recurrence_days).map_err(|e| {
            SchedulerError::InvalidJob {
                id: id.clone(),
                reason: e.to_string(),
            }
        })?;

        let conn = self.conn();
        conn.execute(
            "INSERT INTO profile_schedules
             (id, name, enabled, schedule_type, start_time, recurrence_pattern,
              recurrence_days, device_filter, profile_id, last_executed_at,
              created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,NULL,?10,?10)",
            params![
                id,
                new.name,
                new.enabled,
                new.schedule_type.to_string(),
                format_ts(new.start_time),
                new.recurrence_pattern.to_string(),
                days_json,
                new.device_filter,
                new.profile_id,
                format_ts(now),
            ],
        )?;
        info!(job_id = %id, name = %new.name, "job added");

        Ok(Job {
            id,
            name: new.name,
            enabled: new.enabled,
            schedule_type: new.schedule_type,
            start_time: new.start_time,
            recurrence_pattern: new.recurrence_pattern,
            recurrence_days: new.recurrence_days,
            device_filter: new.device_filter,
            profile_id: new.profile_id,
            last_executed_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM profile_schedules WHERE id = ?1"),
                [id],
                JobRow::from_row,
            )
            .optional()?;
        match row {
            Some(row) => row.into_job(),
            None => Err(SchedulerError::JobNotFound { id: id.to_string() }),
        }
    }

    /// Return all jobs ordered by start time.
    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM profile_schedules ORDER BY start_time, id"
        ))?;
        let rows = stmt
            .query_map([], JobRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Administrative re-arm of a job left claimed by a failed commit.
    ///
    /// The claim marker is cleared and `start_time` is moved past every
    /// occurrence that already left the due window ending at `now`, so the
    /// job fires again instead of sitting overdue.
    pub fn release_claim(
        &self,
        id: &str,
        now: DateTime<Utc>,
        due_window: ChronoDuration,
    ) -> Result<Job> {
        let job = self.get_job(id)?;
        if job.last_executed_at.is_none() {
            return Err(SchedulerError::NotClaimed { id: id.to_string() });
        }
        let start_time = release_start(&job, now, due_window);
        let updated_at = Utc::now();

        let conn = self.conn();
        let n = conn.execute(
            "UPDATE profile_schedules
             SET start_time = ?1, last_executed_at = NULL, updated_at = ?2
             WHERE id = ?3 AND last_executed_at IS NOT NULL",
            params![format_ts(start_time), format_ts(updated_at), id],
        )?;
        if n == 0 {
            return Err(missing_or_unclaimed(&conn, id));
        }
        info!(job_id = %id, start_time = %start_time, "claim released");

        Ok(Job {
            start_time,
            last_executed_at: None,
            updated_at,
            ..job
        })
    }

    fn select_jobs(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(args, JobRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        // A single undecodable row must not hide every other due job.
        let jobs = rows
            .into_iter()
            .filter_map(|row| match row.into_job() {
                Ok(job) => Some(job),
                Err(e) => {
                    error!("skipping stored job: {e}");
                    None
                }
            })
            .collect();
        Ok(jobs)
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn due_jobs(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let (start, end) = (format_ts(window_start), format_ts(window_end));
        self.select_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM profile_schedules
                 WHERE enabled = 1 AND last_executed_at IS NULL
                   AND start_time >= ?1 AND start_time <= ?2
                 ORDER BY start_time ASC, id ASC"
            ),
            &[&start, &end],
        )
    }

    async fn claim(&self, id: &str, at: DateTime<Utc>) -> Result<ClaimResult> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE profile_schedules SET last_executed_at = ?1, updated_at = ?1
             WHERE id = ?2 AND enabled = 1 AND last_executed_at IS NULL",
            params![format_ts(at), id],
        )?;
        Ok(if n == 1 {
            ClaimResult::Claimed
        } else {
            ClaimResult::AlreadyClaimed
        })
    }

    async fn rearm(&self, id: &str, next_start: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE profile_schedules
             SET start_time = ?1, last_executed_at = NULL, updated_at = ?2
             WHERE id = ?3 AND last_executed_at IS NOT NULL",
            params![format_ts(next_start), format_ts(Utc::now()), id],
        )?;
        if n == 0 {
            return Err(missing_or_unclaimed(&conn, id));
        }
        Ok(())
    }

    async fn overdue_jobs(&self, before: DateTime<Utc>) -> Result<Vec<Job>> {
        let before = format_ts(before);
        self.select_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM profile_schedules
                 WHERE enabled = 1 AND last_executed_at IS NULL AND start_time < ?1
                 ORDER BY start_time ASC"
            ),
            &[&before],
        )
    }
}

fn missing_or_unclaimed(conn: &Connection, id: &str) -> SchedulerError {
    let exists = conn
        .query_row(
            "SELECT 1 FROM profile_schedules WHERE id = ?1",
            [id],
            |_| Ok(()),
        )
        .optional();
    match exists {
        Ok(Some(())) => SchedulerError::NotClaimed { id: id.to_string() },
        Ok(None) => SchedulerError::JobNotFound { id: id.to_string() },
        Err(e) => SchedulerError::Database(e),
    }
}

/// Raw column values; decoded separately so a bad value names its job.
struct JobRow {
    id: String,
    name: String,
    enabled: bool,
    schedule_type: String,
    start_time: String,
    recurrence_pattern: String,
    recurrence_days: String,
    device_filter: Option<String>,
    profile_id: String,
    last_executed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            enabled: row.get(2)?,
            schedule_type: row.get(3)?,
            start_time: row.get(4)?,
            recurrence_pattern: row.get(5)?,
            recurrence_days: row.get(6)?,
            device_filter: row.get(7)?,
            profile_id: row.get(8)?,
            last_executed_at: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let id = self.id;
        let invalid = |reason: String| SchedulerError::InvalidJob {
            id: id.clone(),
            reason,
        };
        let ts = |field: &str, raw: &str| {
            parse_ts(raw).map_err(|e| invalid(format!("bad {field} {raw:?}: {e}")))
        };

        let schedule_type: ScheduleType = self.schedule_type.parse().map_err(invalid)?;
        // Out-of-range weekday indices are dropped, not fatal.
        let raw_days: Vec<i64> = serde_json::from_str(&self.recurrence_days)
            .map_err(|e| invalid(format!("bad recurrence_days: {e}")))?;
        let recurrence_days = raw_days
            .into_iter()
            .filter_map(|d| u8::try_from(d).ok().filter(|d| *d <= 6))
            .collect();

        let start_time = ts("start_time", &self.start_time)?;
        let last_executed_at = self
            .last_executed_at
            .as_deref()
            .map(|raw| ts("last_executed_at", raw))
            .transpose()?;
        let created_at = ts("created_at", &self.created_at)?;
        let updated_at = ts("updated_at", &self.updated_at)?;

        Ok(Job {
            id: id.clone(),
            name: self.name,
            enabled: self.enabled,
            schedule_type,
            start_time,
            recurrence_pattern: RecurrencePattern::from(self.recurrence_pattern.as_str()),
            recurrence_days,
            device_filter: self.device_filter,
            profile_id: self.profile_id,
            last_executed_at,
            created_at,
            updated_at,
        })
    }
}
