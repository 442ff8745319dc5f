//! Periodic health audit, recovery and dispatch.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;

use crate::config::LedgerConfig;
use crate::dispatch::{DispatchSummary, Dispatcher, ReportSummary};
use crate::error::Result;
use crate::models::{HealthReport, RecoverySummary};
use crate::recovery::RecoveryEngine;

/// What one monitor tick observed and did.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub reports: ReportSummary,
    pub health: HealthReport,
    /// `None` when auto recovery is off.
    pub recovery: Option<RecoverySummary>,
    /// Tasks removed by the standalone cleanup pass.
    pub cleaned: usize,
    pub dispatch: DispatchSummary,
}

pub struct Monitor {
    recovery: RecoveryEngine,
    dispatcher: Dispatcher,
    interval: Duration,
    retry_delay: Duration,
    auto_recovery: bool,
    auto_cleanup: bool,
}

impl Monitor {
    pub fn new(recovery: RecoveryEngine, dispatcher: Dispatcher, config: &LedgerConfig) -> Self {
        Self {
            recovery,
            dispatcher,
            interval: config.health_check_interval(),
            retry_delay: config.retry_delay(),
            auto_recovery: config.auto_recovery,
            auto_cleanup: config.auto_cleanup,
        }
    }

    /// Apply agent reports, audit, repair, then hand out pending work.
    pub fn tick(&self) -> Result<TickReport> {
        let reports = self.dispatcher.process_reports()?;
        let health = self.recovery.health_check();

        let recovery = if self.auto_recovery {
            Some(self.recovery.full_recovery()?)
        } else {
            None
        };

        let cleaned = if self.auto_cleanup {
            self.recovery
                .cleanup_completed_tasks(self.recovery.policy().retention_days)?
        } else {
            0
        };

        let dispatch = self.dispatcher.dispatch_pending()?;

        Ok(TickReport {
            reports,
            health,
            recovery,
            cleaned,
            dispatch,
        })
    }

    /// Tick every interval until `shutdown` resolves.
    ///
    /// A failed tick is logged and followed by the retry delay; the loop
    /// itself only ends on shutdown.
    pub async fn run<F>(self, shutdown: F, mut on_tick: impl FnMut(&TickReport))
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        tracing::info!("Monitor running every {:?}", self.interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => match self.tick() {
                    Ok(report) => {
                        tracing::debug!(
                            healthy = report.health.healthy,
                            dispatched = report.dispatch.assigned.len(),
                            "Monitor tick"
                        );
                        on_tick(&report);
                    }
                    Err(e) => {
                        tracing::error!("Monitor tick failed: {}", e);
                        tokio::time::sleep(self.retry_delay).await;
                    }
                },
            }
        }
        tracing::info!("Monitor stopped");
    }
}
