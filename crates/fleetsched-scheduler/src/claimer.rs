use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::Result;
use crate::schedule::next_fire_time;
use crate::store::JobStore;
use crate::types::{ClaimResult, Job};

/// Final state a claimed job is committed to once its pipeline finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Claim marker stays set forever: one-shot jobs, and recurring jobs whose
    /// pattern yields no further occurrence.
    Terminal,
    /// Move `start_time` forward and clear the claim marker.
    Rearm { next_start: DateTime<Utc> },
}

impl Settlement {
    /// Computed from the job as it was selected; never from mutated state.
    pub fn for_job(job: &Job) -> Self {
        match next_fire_time(job) {
            Some(next_start) => Settlement::Rearm { next_start },
            None => Settlement::Terminal,
        }
    }

    pub fn next_start(&self) -> Option<DateTime<Utc>> {
        match self {
            Settlement::Rearm { next_start } => Some(*next_start),
            Settlement::Terminal => None,
        }
    }
}

/// Claims due jobs and commits their final state.
pub struct JobClaimer<'a> {
    store: &'a dyn JobStore,
}

impl<'a> JobClaimer<'a> {
    pub fn new(store: &'a dyn JobStore) -> Self {
        Self { store }
    }

    /// Atomically mark `job_id` as being processed at `now`.
    pub async fn claim(&self, job_id: &str, now: DateTime<Utc>) -> Result<ClaimResult> {
        let result = self.store.claim(job_id, now).await?;
        match result {
            ClaimResult::Claimed => info!(job_id, "job claimed"),
            ClaimResult::AlreadyClaimed => info!(job_id, "job already claimed elsewhere, skipping"),
        }
        Ok(result)
    }

    /// Commit the job's post-run state.
    ///
    /// On error the job stays claimed and needs a manual release; it is never
    /// silently re-armed.
    pub async fn finalize(&self, job: &Job, settlement: Settlement) -> Result<()> {
        match settlement {
            Settlement::Terminal => {
                info!(job_id = %job.id, "job settled as terminal");
                Ok(())
            }
            Settlement::Rearm { next_start } => {
                if let Err(e) = self.store.rearm(&job.id, next_start).await {
                    warn!(job_id = %job.id, error = %e, "failed to re-arm job; it stays claimed");
                    return Err(e);
                }
                info!(job_id = %job.id, next_start = %next_start, "job re-armed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteJobStore;
    use crate::types::{NewJob, RecurrencePattern};
    use chrono::{Duration, TimeZone};
    use rusqlite::Connection;

    fn nine() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    fn store() -> SqliteJobStore {
        SqliteJobStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn settlement_follows_schedule_type_and_pattern() {
        let s = store();
        let one_shot = s.insert_job(NewJob::one_shot("o", "p", nine())).unwrap();
        let daily = s
            .insert_job(NewJob::recurring("d", "p", nine(), RecurrencePattern::Daily))
            .unwrap();
        let odd = s
            .insert_job(NewJob::recurring(
                "x",
                "p",
                nine(),
                RecurrencePattern::from("hourly"),
            ))
            .unwrap();
        let no_pattern = s
            .insert_job(NewJob::recurring("n", "p", nine(), RecurrencePattern::None))
            .unwrap();

        assert_eq!(Settlement::for_job(&one_shot), Settlement::Terminal);
        assert_eq!(
            Settlement::for_job(&daily),
            Settlement::Rearm {
                next_start: nine() + Duration::days(1)
            }
        );
        assert_eq!(Settlement::for_job(&odd), Settlement::Terminal);
        assert_eq!(Settlement::for_job(&no_pattern), Settlement::Terminal);
    }

    #[tokio::test]
    async fn terminal_finalize_keeps_claim_marker() {
        let s = store();
        let job = s.insert_job(NewJob::one_shot("o", "p", nine())).unwrap();
        let claimer = JobClaimer::new(&s);

        assert_eq!(claimer.claim(&job.id, nine()).await.unwrap(), ClaimResult::Claimed);
        claimer.finalize(&job, Settlement::Terminal).await.unwrap();

        let stored = s.get_job(&job.id).unwrap();
        assert_eq!(stored.last_executed_at, Some(nine()));
        let far_future = nine() + Duration::days(365);
        assert!(s
            .due_jobs(nine() - Duration::days(1), far_future)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn rearm_finalize_requires_live_claim() {
        let s = store();
        let job = s
            .insert_job(NewJob::recurring("d", "p", nine(), RecurrencePattern::Daily))
            .unwrap();
        let claimer = JobClaimer::new(&s);
        let settlement = Settlement::for_job(&job);

        // Not claimed: the commit is refused rather than re-arming blindly.
        assert!(claimer.finalize(&job, settlement).await.is_err());

        claimer.claim(&job.id, nine()).await.unwrap();
        claimer.finalize(&job, settlement).await.unwrap();
        let stored = s.get_job(&job.id).unwrap();
        assert_eq!(stored.start_time, nine() + Duration::days(1));
        assert!(stored.last_executed_at.is_none());
    }
}
