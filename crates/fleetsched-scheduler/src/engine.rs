use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetsched_core::config::{EngineConfig, FleetConfig};
use fleetsched_mdm::{push_to_devices, resolve_devices, DeviceManagement};
use futures_util::{future, stream, FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::claimer::{JobClaimer, Settlement};
use crate::error::EngineError;
use crate::store::JobStore;
use crate::types::{ClaimResult, ExecutionOutcome, Job, RunReport};

/// Tuning knobs for one [`ExecutionEngine`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Jobs with `start_time` in `[now - due_window, now]` are due.
    pub due_window: chrono::Duration,
    pub max_concurrent_jobs: usize,
    pub max_concurrent_pushes: usize,
    /// Deadline applied to each remote call.
    pub call_timeout: Duration,
}

impl EngineSettings {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            due_window: chrono::Duration::seconds(cfg.due_window_secs as i64),
            max_concurrent_jobs: cfg.max_concurrent_jobs.max(1),
            max_concurrent_pushes: cfg.max_concurrent_pushes.max(1),
            call_timeout: Duration::from_secs(cfg.call_timeout_secs),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Scans for due jobs, claims them, pushes their profile and commits their
/// next state. Safe to run concurrently with itself: the claim decides which
/// run executes a given job.
pub struct ExecutionEngine {
    store: Arc<dyn JobStore>,
    api: Arc<dyn DeviceManagement>,
    settings: EngineSettings,
    /// Overdue job ids already reported, so each is warned about once.
    overdue_reported: Mutex<HashSet<String>>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        api: Arc<dyn DeviceManagement>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            api,
            settings,
            overdue_reported: Mutex::new(HashSet::new()),
        }
    }

    /// Build an engine after validating the configuration; nothing runs on a
    /// config without credentials.
    pub fn from_config(
        cfg: &FleetConfig,
        store: Arc<dyn JobStore>,
        api: Arc<dyn DeviceManagement>,
    ) -> Result<Self, EngineError> {
        cfg.validate()?;
        Ok(Self::new(store, api, EngineSettings::from_config(&cfg.engine)))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Execute every job due at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RunReport, EngineError> {
        self.run_once_with_cancel(now, &CancellationToken::new()).await
    }

    /// Like [`run_once`](Self::run_once), but stops claiming new jobs once
    /// `cancel` fires. Jobs already claimed still run to completion and commit.
    pub async fn run_once_with_cancel(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RunReport, EngineError> {
        let window_start = now - self.settings.due_window;

        let due = self
            .store
            .due_jobs(window_start, now)
            .await
            .map_err(|e| {
                error!(error = %e, "due-scan failed");
                EngineError::Selection(e)
            })?;

        self.warn_overdue(window_start).await;

        if due.is_empty() {
            info!("no schedules due");
            return Ok(RunReport::default());
        }

        let selected = due.len();
        info!(selected, window_start = %window_start, now = %now, "executing due schedules");

        let results: Vec<ExecutionOutcome> = stream::iter(due)
            .map(|job| self.execute_job(job, now, cancel))
            .buffered(self.settings.max_concurrent_jobs)
            .filter_map(future::ready)
            .collect()
            .await;

        let report = RunReport::from_outcomes(selected, results);
        info!(
            selected,
            executed = report.executed,
            failed = report.failed,
            "run complete"
        );
        Ok(report)
    }

    /// Claim and run one job. `None` means the job was skipped: lost to a
    /// concurrent run, or the run was cancelled before it was claimed.
    async fn execute_job(
        &self,
        job: Job,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Option<ExecutionOutcome> {
        if cancel.is_cancelled() {
            info!(job_id = %job.id, "run cancelled, leaving job unclaimed");
            return None;
        }

        let claimer = JobClaimer::new(self.store.as_ref());
        match claimer.claim(&job.id, now).await {
            Ok(ClaimResult::Claimed) => {}
            Ok(ClaimResult::AlreadyClaimed) => return None,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "claim failed");
                return Some(ExecutionOutcome::failure(&job, format!("claim failed: {e}")));
            }
        }

        let outcome = AssertUnwindSafe(self.run_claimed(&job, &claimer))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(job_id = %job.id, "job pipeline panicked; job stays claimed");
                ExecutionOutcome::failure(&job, "job pipeline panicked; job stays claimed")
            });
        Some(outcome)
    }

    /// resolve → push → compute next state → commit.
    async fn run_claimed(&self, job: &Job, claimer: &JobClaimer<'_>) -> ExecutionOutcome {
        let resolution = resolve_devices(
            self.api.as_ref(),
            job.device_filter.as_deref(),
            self.settings.call_timeout,
        )
        .await;

        let device_results = push_to_devices(
            self.api.as_ref(),
            &job.profile_id,
            &resolution.devices,
            self.settings.max_concurrent_pushes,
            self.settings.call_timeout,
        )
        .await;

        let devices_count = resolution.devices.len();
        let pushes_succeeded = device_results.iter().filter(|r| r.success).count();
        let pushes_failed = device_results.len() - pushes_succeeded;

        let settlement = Settlement::for_job(job);
        let mut outcome = ExecutionOutcome {
            job_id: job.id.clone(),
            profile_id: job.profile_id.clone(),
            devices_count,
            success: true,
            message: String::new(),
            next_fire_time: None,
            pushes_succeeded,
            pushes_failed,
            device_results,
        };

        // Device-level failures are reported but do not fail the job.
        if let Err(e) = claimer.finalize(job, settlement).await {
            outcome.success = false;
            outcome.message = format!("failed to commit job state, job left claimed: {e}");
            return outcome;
        }

        outcome.next_fire_time = settlement.next_start();
        outcome.message = match resolution.degraded {
            Some(reason) => format!("No devices targeted ({reason})"),
            None => format!(
                "Profile {} pushed to {}/{} devices",
                job.profile_id, pushes_succeeded, devices_count
            ),
        };
        info!(
            job_id = %job.id,
            profile_id = %job.profile_id,
            devices = devices_count,
            pushes_failed,
            "job executed"
        );
        outcome
    }

    async fn warn_overdue(&self, window_start: DateTime<Utc>) {
        let overdue = match self.store.overdue_jobs(window_start).await {
            Ok(overdue) => overdue,
            Err(e) => {
                warn!(error = %e, "overdue scan failed");
                return;
            }
        };

        let fresh = self.newly_overdue(&overdue);
        if fresh.is_empty() {
            if !overdue.is_empty() {
                debug!(count = overdue.len(), "overdue jobs unchanged");
            }
            return;
        }
        let ids: Vec<&str> = fresh.iter().take(10).copied().collect();
        warn!(
            count = fresh.len(),
            total = overdue.len(),
            job_ids = ?ids,
            "jobs missed their due window and will not fire"
        );
    }

    /// Ids in `overdue` not reported by an earlier run. The remembered set is
    /// replaced each time, so a job that is released and later goes overdue
    /// again is reported again.
    fn newly_overdue<'a>(&self, overdue: &'a [Job]) -> Vec<&'a str> {
        let mut reported = self
            .overdue_reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let fresh = overdue
            .iter()
            .filter(|j| !reported.contains(&j.id))
            .map(|j| j.id.as_str())
            .collect();
        *reported = overdue.iter().map(|j| j.id.clone()).collect();
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result as StoreResult, SchedulerError};
    use crate::store::SqliteJobStore;
    use crate::types::NewJob;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use fleetsched_mdm::{Device, MdmError};
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingStore;

    #[async_trait]
    impl JobStore for FailingStore {
        async fn due_jobs(&self, _: DateTime<Utc>, _: DateTime<Utc>) -> StoreResult<Vec<Job>> {
            Err(SchedulerError::Database(rusqlite::Error::QueryReturnedNoRows))
        }
        async fn claim(&self, _: &str, _: DateTime<Utc>) -> StoreResult<ClaimResult> {
            unreachable!("no job is ever selected")
        }
        async fn rearm(&self, _: &str, _: DateTime<Utc>) -> StoreResult<()> {
            unreachable!("no job is ever selected")
        }
        async fn overdue_jobs(&self, _: DateTime<Utc>) -> StoreResult<Vec<Job>> {
            Ok(Vec::new())
        }
    }

    struct NoDevices;

    #[async_trait]
    impl DeviceManagement for NoDevices {
        fn name(&self) -> &str {
            "none"
        }
        async fn list_devices(&self) -> fleetsched_mdm::Result<Vec<Device>> {
            Ok(Vec::new())
        }
        async fn apply_profile(&self, _: &str, _: &str) -> fleetsched_mdm::Result<()> {
            Err(MdmError::Parse("unexpected push".to_string()))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn selection_failure_aborts_the_run() {
        let engine = ExecutionEngine::new(
            Arc::new(FailingStore),
            Arc::new(NoDevices),
            EngineSettings::default(),
        );
        let err = engine.run_once(now()).await.unwrap_err();
        assert_eq!(err.code(), "SELECTION_ERROR");
    }

    #[test]
    fn from_config_rejects_missing_credentials() {
        let cfg = FleetConfig::default();
        let result = ExecutionEngine::from_config(&cfg, Arc::new(FailingStore), Arc::new(NoDevices));
        match result {
            Err(e) => assert_eq!(e.code(), "CONFIG_ERROR"),
            Ok(_) => panic!("engine built without credentials"),
        }
    }

    #[test]
    fn settings_default_to_fifteen_minute_window() {
        let settings = EngineSettings::default();
        assert_eq!(settings.due_window, chrono::Duration::minutes(15));
        assert!(settings.max_concurrent_jobs >= 1);
    }

    /// One device per job; pushes of profile "boom" panic, every push is slow
    /// enough for concurrent jobs to overlap.
    struct Gauge {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DeviceManagement for Gauge {
        fn name(&self) -> &str {
            "gauge"
        }
        async fn list_devices(&self) -> fleetsched_mdm::Result<Vec<Device>> {
            Ok(vec![Device::new("d1", "Lobby iPad")])
        }
        async fn apply_profile(&self, profile_id: &str, _: &str) -> fleetsched_mdm::Result<()> {
            if profile_id == "boom" {
                panic!("device backend crashed");
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn memory_store() -> SqliteJobStore {
        SqliteJobStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn run_future_is_send() {
        let engine = ExecutionEngine::new(
            Arc::new(memory_store()),
            Arc::new(NoDevices),
            EngineSettings::default(),
        );
        let fut = engine.run_once(now());
        assert_send(&fut);
        let cancel = CancellationToken::new();
        let fut = engine.run_once_with_cancel(now(), &cancel);
        assert_send(&fut);
    }

    #[tokio::test]
    async fn panicking_job_is_isolated_from_siblings() {
        let store = memory_store();
        let boom = store
            .insert_job(NewJob::one_shot("boom", "boom", now() - ChronoDuration::minutes(5)))
            .unwrap();
        let fine = store
            .insert_job(NewJob::one_shot("fine", "wifi", now() - ChronoDuration::minutes(4)))
            .unwrap();
        let engine = ExecutionEngine::new(
            Arc::new(store.clone()),
            Arc::new(Gauge::new()),
            EngineSettings::default(),
        );

        let report = engine.run_once(now()).await.unwrap();
        assert_eq!(report.executed, 1);
        assert_eq!(report.failed, 1);

        let crashed = report.results.iter().find(|o| o.job_id == boom.id).unwrap();
        assert!(!crashed.success);
        assert!(crashed.message.contains("panicked"));
        let sibling = report.results.iter().find(|o| o.job_id == fine.id).unwrap();
        assert!(sibling.success);
        assert_eq!(sibling.pushes_succeeded, 1);

        // The crashed job keeps its claim and is not picked up again.
        assert!(store.get_job(&boom.id).unwrap().last_executed_at.is_some());
        assert!(engine.run_once(now()).await.unwrap().nothing_due());
    }

    #[tokio::test]
    async fn jobs_run_within_the_concurrency_limit() {
        let store = memory_store();
        for i in 0..6 {
            store
                .insert_job(NewJob::one_shot(
                    &format!("job-{i}"),
                    "wifi",
                    now() - ChronoDuration::minutes(6 - i),
                ))
                .unwrap();
        }
        let gauge = Arc::new(Gauge::new());
        let settings = EngineSettings {
            max_concurrent_jobs: 2,
            ..EngineSettings::default()
        };
        let engine = ExecutionEngine::new(Arc::new(store), gauge.clone(), settings);

        let report = engine.run_once(now()).await.unwrap();
        assert_eq!(report.executed, 6);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn overdue_jobs_are_reported_once() {
        let store = memory_store();
        let stale = store
            .insert_job(NewJob::one_shot("stale", "wifi", now() - ChronoDuration::hours(3)))
            .unwrap();
        let engine = ExecutionEngine::new(
            Arc::new(store.clone()),
            Arc::new(NoDevices),
            EngineSettings::default(),
        );
        let overdue = store.overdue_jobs(now()).await.unwrap();

        assert_eq!(engine.newly_overdue(&overdue), vec![stale.id.as_str()]);
        assert!(engine.newly_overdue(&overdue).is_empty());

        // Once it leaves the overdue list, a later return is reported again.
        assert!(engine.newly_overdue(&[]).is_empty());
        assert_eq!(engine.newly_overdue(&overdue), vec![stale.id.as_str()]);
    }
}
