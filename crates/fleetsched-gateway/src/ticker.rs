//! Trusted periodic trigger: fires the engine in-process at a fixed cadence.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetsched_scheduler::ExecutionEngine;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Run the engine every `period` until `cancel` fires.
///
/// Ticks never overlap: a slow run delays the next tick instead of stacking.
/// Cancellation stops new claims in the current run; jobs already claimed
/// finish and commit before this returns.
pub async fn run_periodic(engine: Arc<ExecutionEngine>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(period_secs = period.as_secs(), "periodic trigger started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match engine.run_once_with_cancel(Utc::now(), &cancel).await {
            Ok(report) if report.nothing_due() => {}
            Ok(report) => info!(
                executed = report.executed,
                failed = report.failed,
                "periodic run complete"
            ),
            Err(e) => error!(error = %e, code = e.code(), "periodic run failed"),
        }
    }

    info!("periodic trigger stopped");
}
