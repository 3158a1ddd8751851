use std::future::Future;

use helpdesk_config::Scheduler as SchedulerConfig;
use helpdesk_contracts::{SweepReport, TicketId};
use helpdesk_kernel::inactivity_window;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::{Desk, SweepOutcome};

/// Periodic sweep that closes IN_PROGRESS tickets whose customer has gone quiet.
pub struct AutoCloseScheduler {
    desk: Desk,
    period: std::time::Duration,
    window: chrono::Duration,
    batch_size: usize,
    run_on_start: bool,
}

impl AutoCloseScheduler {
    pub fn new(desk: Desk, cfg: &SchedulerConfig) -> Self {
        Self {
            desk,
            period: std::time::Duration::from_secs(cfg.interval_secs.max(1)),
            window: inactivity_window(cfg.inactivity_window_hours),
            batch_size: cfg.batch_size.max(1),
            run_on_start: cfg.run_on_start,
        }
    }

    /// Scans every IN_PROGRESS ticket once. A failure on one ticket is logged and counted.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut cursor: Option<TicketId> = None;

        loop {
            let page = match self.desk.in_progress_page(cursor, self.batch_size).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(error = %err, after = ?cursor, "auto-close page fetch failed");
                    report.failed += 1;
                    break;
                }
            };
            let Some(last) = page.last().copied() else {
                break;
            };

            for ticket_id in &page {
                report.scanned += 1;
                match self.desk.close_if_inactive(*ticket_id, self.window).await {
                    Ok(SweepOutcome::Closed) => report.closed += 1,
                    Ok(SweepOutcome::Skipped) => report.skipped += 1,
                    Err(err) => {
                        warn!(ticket_id = %ticket_id, error = %err, "auto-close failed");
                        report.failed += 1;
                    }
                }
            }

            if page.len() < self.batch_size {
                break;
            }
            cursor = Some(last);
        }

        info!(
            scanned = report.scanned,
            closed = report.closed,
            skipped = report.skipped,
            failed = report.failed,
            "auto-close sweep finished"
        );
        report
    }

    /// Sweeps once per period until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if !self.run_on_start {
            // first tick fires immediately
            ticker.tick().await;
        }
        tokio::pin!(shutdown);

        info!(period_secs = self.period.as_secs(), "auto-close scheduler started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("auto-close scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }
    }
}
