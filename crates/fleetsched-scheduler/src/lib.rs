//! `fleetsched-scheduler`: due-schedule claiming and execution for profile pushes.
//!
//! # Overview
//!
//! Jobs live in a SQLite `profile_schedules` table. Each call to
//! [`engine::ExecutionEngine::run_once`] selects the enabled, unclaimed jobs whose
//! `start_time` falls inside the due window, claims each one with a conditional
//! update, pushes its profile to the resolved devices and commits the job's
//! next state. Overlapping runs are safe: a job is executed by whichever run
//! wins its claim.
//!
//! # Recurrence
//!
//! | Pattern   | Next fire time                                              |
//! |-----------|-------------------------------------------------------------|
//! | `daily`   | +1 day                                                      |
//! | `weekly`  | next configured weekday (0 = Sunday), wrapping; +7 days if none |
//! | `monthly` | +1 month, day clamped to the month's length                 |
//! | other     | none: the job is terminal after this run                    |

pub mod claimer;
pub mod db;
pub mod engine;
pub mod error;
pub mod schedule;
pub mod store;
pub mod types;

pub use claimer::{JobClaimer, Settlement};
pub use engine::{EngineSettings, ExecutionEngine};
pub use error::{EngineError, Result, SchedulerError};
pub use store::{JobStore, SqliteJobStore};
pub use types::{
    ClaimResult, ExecutionOutcome, Job, NewJob, RecurrencePattern, RunReport, ScheduleType,
};
