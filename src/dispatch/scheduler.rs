//! Cron scheduler.
//!
//! Sweeps the store for due functions and runs them through the dispatcher
//! in order. Each run advances `next_execution` from the function's cron
//! expression whether the run succeeded or not (a permanently failing
//! function must not hot-loop the scheduler); an unparseable expression
//! disables the schedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dispatch::schedule::CronSchedule;
use crate::dispatch::Dispatcher;

/// What one sweep did, for the trigger endpoint's reply.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Functions that ran, in order
    pub executed: Vec<ScheduledRun>,
    /// Functions whose schedule was disabled this sweep
    pub disabled: Vec<String>,
}

/// One scheduled execution's summary.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledRun {
    pub function_id: String,
    pub status: u16,
    pub next_execution: Option<chrono::DateTime<Utc>>,
}

/// Interval-driven scheduler over the dispatcher.
pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
        }
    }

    /// Run the sweep loop until `shutdown` resolves.
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()>) {
        info!(interval_secs = self.interval.as_secs(), "scheduler started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = run_due(&self.dispatcher).await;
                    if !report.executed.is_empty() || !report.disabled.is_empty() {
                        debug!(
                            executed = report.executed.len(),
                            disabled = report.disabled.len(),
                            "scheduler sweep finished"
                        );
                    }
                }
                _ = &mut shutdown => {
                    info!("scheduler stopping");
                    return;
                }
            }
        }
    }
}

/// Run every due function once, in `next_execution` order.
pub async fn run_due(dispatcher: &Arc<Dispatcher>) -> SweepReport {
    let now = Utc::now();
    let mut report = SweepReport::default();

    let due = match dispatcher.store().due_scheduled(now).await {
        Ok(due) => due,
        Err(e) => {
            warn!(error = %e, "scheduler could not list due functions");
            return report;
        }
    };

    for descriptor in due {
        let function_id = descriptor.function_id.clone();
        let Some(expression) = descriptor.cron_expression.clone() else {
            continue;
        };

        // An unparseable expression can never fire again; disable it.
        let schedule = match CronSchedule::parse(&expression) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(function_id, error = %e, "disabling broken schedule");
                if let Err(e) = dispatcher.store().set_next_execution(&function_id, None).await {
                    warn!(function_id, error = %e, "failed to disable schedule");
                }
                report.disabled.push(function_id);
                continue;
            }
        };

        let response = dispatcher.invoke_scheduled(&descriptor).await;

        // Advance regardless of how the run went.
        let next = schedule.next_after(Utc::now());
        if let Err(e) = dispatcher
            .store()
            .set_next_execution(&function_id, next)
            .await
        {
            warn!(function_id, error = %e, "failed to advance schedule");
        }
        if next.is_none() {
            report.disabled.push(function_id.clone());
        }
        report.executed.push(ScheduledRun {
            function_id,
            status: response.status,
            next_execution: next,
        });
    }
    report
}
