use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{self, MissedTickBehavior};
use tracing::info;

use crate::pipeline::{Orchestrator, RunReport};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleSummary {
    pub runs: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl ScheduleSummary {
    fn record(&mut self, report: &RunReport) {
        self.runs += 1;
        if report.succeeded() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Triggers one orchestrated run per interval. The first run starts
/// immediately, ticks missed while a run is in progress are dropped rather
/// than replayed, and runs never overlap.
pub struct Scheduler {
    orchestrator: Orchestrator,
    interval: Duration,
}

impl Scheduler {
    pub fn new(orchestrator: Orchestrator, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs until `shutdown` resolves or `max_runs` runs have completed. A run
    /// that has started is always allowed to finish.
    pub async fn run_until<F>(&self, shutdown: F, max_runs: Option<usize>) -> ScheduleSummary
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut summary = ScheduleSummary::default();
        info!(interval_secs = self.interval.as_secs_f64(), "Scheduler started");
        loop {
            if max_runs.is_some_and(|max| summary.runs >= max) {
                break;
            }

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let report = self.orchestrator.run().await;
            summary.record(&report);
        }

        info!(
            runs = summary.runs,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Scheduler stopped"
        );
        summary
    }
}
