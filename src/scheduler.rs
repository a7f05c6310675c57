use crate::db::{Database, PruneSummary};
use crate::errors::AppResult;
use crate::models::RefreshReport;
use crate::pipeline::RefreshPipeline;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Runs the catalog refresh on a fixed interval and on demand. Batches never
/// overlap. Triggers that land during a batch coalesce into one follow-up
/// batch that starts as soon as the running one ends. Missed ticks are not
/// replayed.
#[derive(Clone)]
pub struct RefreshScheduler {
    pipeline: RefreshPipeline,
    db: Arc<Database>,
    interval: Duration,
    retention_days: u32,
    batch: Arc<Mutex<()>>,
    last_report: Arc<RwLock<Option<RefreshReport>>>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RefreshScheduler {
    pub fn new(pipeline: RefreshPipeline, db: Arc<Database>, interval: Duration, retention_days: u32) -> Self {
        Self {
            pipeline,
            db,
            interval,
            retention_days,
            batch: Arc::new(Mutex::new(())),
            last_report: Arc::new(RwLock::new(None)),
            notify: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn start(&self) {
        let refresh = {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_loop().await })
        };
        let retention = {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.retention_loop().await })
        };
        self.tasks.lock().await.extend([refresh, retention]);
    }

    /// Requests an out-of-schedule refresh.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    pub fn last_report(&self) -> Option<RefreshReport> {
        self.last_report.read().ok().and_then(|report| report.clone())
    }

    pub fn is_running(&self) -> bool {
        self.batch.try_lock().is_err()
    }

    /// Refreshes the whole catalog once. Returns `None` when a batch is
    /// already running.
    pub async fn run_once(&self) -> AppResult<Option<RefreshReport>> {
        let Ok(_batch) = self.batch.try_lock() else {
            tracing::debug!("metric refresh already running; skipping");
            return Ok(None);
        };

        let report = self.pipeline.refresh_catalog(self.shutdown.child_token()).await?;
        if let Ok(mut slot) = self.last_report.write() {
            *slot = Some(report.clone());
        }
        Ok(Some(report))
    }

    pub fn run_retention(&self) -> AppResult<PruneSummary> {
        let summary = self.db.prune_snapshots(self.retention_days)?;
        if summary.snapshots > 0 || summary.reports > 0 {
            tracing::info!(
                snapshots = summary.snapshots,
                reports = summary.reports,
                retention_days = self.retention_days,
                "pruned metric history"
            );
        }
        Ok(summary)
    }

    /// Cancels metrics that have not started, stops both loops and waits for
    /// them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(error) = task.await {
                tracing::warn!(error = %error, "scheduler task ended abnormally");
            }
        }
    }

    async fn run_loop(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {}
            }
            if let Err(error) = self.run_once().await {
                tracing::warn!(error = %error, "metric refresh batch rejected");
            }
        }
    }

    async fn retention_loop(self) {
        let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(error) = self.run_retention() {
                tracing::warn!(error = %error, "retention maintenance failed");
            }
        }
    }
}
