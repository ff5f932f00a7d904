//! Retention sweeper.
//!
//! Soft-deletes expired log entries and removes expired metric reports in
//! bounded pages. Billing aggregates are never touched.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::storage::{RetentionStore, StorageError};

/// Rows handled per page.
pub const RETENTION_PAGE_SIZE: i64 = 10_000;

/// Pause between pages so ingestion keeps getting the database.
pub const PAGE_PAUSE: Duration = Duration::from_millis(100);

/// Time between sweeps.
pub const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const SECONDS_PER_DAY: i64 = 86_400;

/// Rows removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub logs_deleted: u64,
    pub metrics_deleted: u64,
}

/// Daily expiry of log entries and metric reports.
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    store: RetentionStore,
    retention_days: i64,
    page_size: i64,
    page_pause: Duration,
}

impl RetentionSweeper {
    /// `retention_days <= 0` disables the sweeper.
    pub fn new(store: RetentionStore, retention_days: i64) -> Self {
        Self {
            store,
            retention_days,
            page_size: RETENTION_PAGE_SIZE,
            page_pause: PAGE_PAUSE,
        }
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_page_pause(mut self, pause: Duration) -> Self {
        self.page_pause = pause;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.retention_days > 0
    }

    /// Unix seconds before which rows expire, as of `now`.
    pub fn cutoff_at(&self, now: i64) -> i64 {
        now.saturating_sub(self.retention_days.saturating_mul(SECONDS_PER_DAY))
    }

    /// One sweep using the current time.
    pub async fn run_once(&self) -> Result<RetentionReport, StorageError> {
        if !self.is_enabled() {
            return Ok(RetentionReport::default());
        }
        self.sweep_before(self.cutoff_at(Utc::now().timestamp()))
            .await
    }

    /// Remove everything older than `cutoff`.
    ///
    /// A failing page aborts the sweep. Pages already committed stay committed.
    pub async fn sweep_before(&self, cutoff: i64) -> Result<RetentionReport, StorageError> {
        let mut report = RetentionReport::default();

        loop {
            let deleted = self
                .store
                .soft_delete_expired_logs(cutoff, self.page_size)
                .await?;
            if deleted == 0 {
                break;
            }
            report.logs_deleted += deleted;
            tokio::time::sleep(self.page_pause).await;
        }

        loop {
            let deleted = self
                .store
                .delete_expired_metrics(cutoff, self.page_size)
                .await?;
            if deleted == 0 {
                break;
            }
            report.metrics_deleted += deleted;
            tokio::time::sleep(self.page_pause).await;
        }

        Ok(report)
    }

    /// Sweep at start and then every [`RETENTION_INTERVAL`] until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        if !self.is_enabled() {
            tracing::info!("Retention disabled, keeping all data");
            return;
        }
        tracing::info!(retention_days = self.retention_days, "Retention sweeper started");

        let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = self.run_once() => match result {
                            Ok(report) => tracing::info!(
                                logs_deleted = report.logs_deleted,
                                metrics_deleted = report.metrics_deleted,
                                "Retention sweep finished"
                            ),
                            Err(e) => tracing::error!(error = %e, "Retention sweep failed"),
                        },
                    }
                }
            }
        }

        tracing::info!("Retention sweeper stopped");
    }
}
