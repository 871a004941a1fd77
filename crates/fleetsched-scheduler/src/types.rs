use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use fleetsched_mdm::DeviceOutcome;
use serde::{Deserialize, Serialize};

/// Whether a job fires once or re-arms itself after each run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    OneShot,
    Recurring,
}

impl std::fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScheduleType::OneShot => "one_shot",
            ScheduleType::Recurring => "recurring",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "one_shot" => Ok(ScheduleType::OneShot),
            "recurring" => Ok(ScheduleType::Recurring),
            other => Err(format!("unknown schedule type: {other}")),
        }
    }
}

/// How a recurring job advances. Unknown stored values are kept verbatim and
/// never produce a next occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrencePattern {
    None,
    Daily,
    Weekly,
    Monthly,
    #[serde(untagged)]
    Unrecognized(String),
}

impl std::fmt::Display for RecurrencePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecurrencePattern::None => "none",
            RecurrencePattern::Daily => "daily",
            RecurrencePattern::Weekly => "weekly",
            RecurrencePattern::Monthly => "monthly",
            RecurrencePattern::Unrecognized(other) => other.as_str(),
        };
        write!(f, "{s}")
    }
}

impl From<&str> for RecurrencePattern {
    fn from(s: &str) -> Self {
        match s {
            "none" => RecurrencePattern::None,
            "daily" => RecurrencePattern::Daily,
            "weekly" => RecurrencePattern::Weekly,
            "monthly" => RecurrencePattern::Monthly,
            other => RecurrencePattern::Unrecognized(other.to_string()),
        }
    }
}

/// A persisted scheduled profile push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// UUID v7 string, primary key.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    /// Disabled jobs are never selected.
    pub enabled: bool,
    pub schedule_type: ScheduleType,
    /// Next (or only) fire time.
    pub start_time: DateTime<Utc>,
    pub recurrence_pattern: RecurrencePattern,
    /// Weekday indices, 0 = Sunday … 6 = Saturday. Only meaningful for weekly.
    pub recurrence_days: BTreeSet<u8>,
    /// Raw JSON device filter; `None` targets the whole directory.
    pub device_filter: Option<String>,
    pub profile_id: String,
    /// Claim marker. `Some` means claimed (or terminally executed).
    pub last_executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub enabled: bool,
    pub schedule_type: ScheduleType,
    pub start_time: DateTime<Utc>,
    pub recurrence_pattern: RecurrencePattern,
    pub recurrence_days: BTreeSet<u8>,
    pub device_filter: Option<String>,
    pub profile_id: String,
}

impl NewJob {
    pub fn one_shot(name: &str, profile_id: &str, start_time: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            schedule_type: ScheduleType::OneShot,
            start_time,
            recurrence_pattern: RecurrencePattern::None,
            recurrence_days: BTreeSet::new(),
            device_filter: None,
            profile_id: profile_id.to_string(),
        }
    }

    pub fn recurring(
        name: &str,
        profile_id: &str,
        start_time: DateTime<Utc>,
        pattern: RecurrencePattern,
    ) -> Self {
        Self {
            schedule_type: ScheduleType::Recurring,
            recurrence_pattern: pattern,
            ..Self::one_shot(name, profile_id, start_time)
        }
    }

    pub fn with_days(mut self, days: impl IntoIterator<Item = u8>) -> Self {
        self.recurrence_days = days.into_iter().collect();
        self
    }

    pub fn with_filter(mut self, filter: &str) -> Self {
        self.device_filter = Some(filter.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Outcome of the conditional claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    Claimed,
    /// Another run got there first, or the job is no longer eligible.
    AlreadyClaimed,
}

/// Per-job result of one run. Returned to the trigger caller, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub job_id: String,
    pub profile_id: String,
    pub devices_count: usize,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_time: Option<DateTime<Utc>>,
    pub pushes_succeeded: usize,
    pub pushes_failed: usize,
    #[serde(default)]
    pub device_results: Vec<DeviceOutcome>,
}

impl ExecutionOutcome {
    /// A job that failed before any device was targeted.
    pub fn failure(job: &Job, message: impl Into<String>) -> Self {
        Self {
            job_id: job.id.clone(),
            profile_id: job.profile_id.clone(),
            devices_count: 0,
            success: false,
            message: message.into(),
            next_fire_time: None,
            pushes_succeeded: 0,
            pushes_failed: 0,
            device_results: Vec::new(),
        }
    }
}

/// Aggregate of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    /// Jobs returned by the due-scan, including ones lost to a concurrent claim.
    #[serde(skip)]
    pub selected: usize,
    pub executed: usize,
    pub failed: usize,
    pub results: Vec<ExecutionOutcome>,
}

impl RunReport {
    pub fn from_outcomes(selected: usize, results: Vec<ExecutionOutcome>) -> Self {
        let executed = results.iter().filter(|o| o.success).count();
        Self {
            selected,
            executed,
            failed: results.len() - executed,
            results,
        }
    }

    /// `true` when the due-scan found nothing to do.
    pub fn nothing_due(&self) -> bool {
        self.selected == 0
    }
}
