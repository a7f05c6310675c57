use crate::connection::ConnectionRouter;
use crate::dialect::{transpile_with, TranspileOptions};
use crate::errors::{AppError, AppResult};
use crate::executor::{QueryExecutor, QueryOutcome};
use crate::models::{ErrorKind, MetricDefinition, MetricOutcome, RefreshReport, RefreshWrite, TargetServer};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Persistence the pipeline reads definitions from and writes outcomes to.
#[async_trait]
pub trait MetricCatalog: Send + Sync {
    async fn load_definitions(&self) -> AppResult<Vec<MetricDefinition>>;

    async fn save(&self, definition: &MetricDefinition) -> AppResult<()>;

    /// Writes value, error and timestamp for one metric as a single unit.
    async fn record_refresh(&self, metric_id: &str, write: &RefreshWrite) -> AppResult<()>;

    async fn record_report(&self, _report: &RefreshReport) -> AppResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub max_in_flight: usize,
    pub relational_concurrency: usize,
    pub query_timeout: Duration,
    pub transpile: TranspileOptions,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 6,
            relational_concurrency: 4,
            query_timeout: crate::executor::DEFAULT_QUERY_TIMEOUT,
            transpile: TranspileOptions::default(),
        }
    }
}

#[derive(Clone)]
pub struct RefreshPipeline {
    store: Arc<dyn MetricCatalog>,
    router: Arc<ConnectionRouter>,
    executor: QueryExecutor,
    options: PipelineOptions,
}

struct Limits {
    global: Arc<Semaphore>,
    relational: Arc<Semaphore>,
    file_database: Arc<Semaphore>,
}

impl Limits {
    fn new(options: &PipelineOptions) -> Self {
        Self {
            global: Arc::new(Semaphore::new(options.max_in_flight.max(1))),
            relational: Arc::new(Semaphore::new(options.relational_concurrency.max(1))),
            // one statement at a time against the file database
            file_database: Arc::new(Semaphore::new(1)),
        }
    }

    fn for_target(&self, target: TargetServer) -> Arc<Semaphore> {
        match target {
            TargetServer::RelationalServer => self.relational.clone(),
            TargetServer::FileDatabase => self.file_database.clone(),
        }
    }
}

impl RefreshPipeline {
    pub fn new(store: Arc<dyn MetricCatalog>, router: Arc<ConnectionRouter>, options: PipelineOptions) -> Self {
        let executor = QueryExecutor::new(router.clone(), options.query_timeout);
        Self {
            store,
            router,
            executor,
            options,
        }
    }

    /// Loads every definition from the store and refreshes them.
    pub async fn refresh_catalog(&self, cancel: CancellationToken) -> AppResult<RefreshReport> {
        let definitions = self.store.load_definitions().await?;
        self.refresh_all(definitions, cancel).await
    }

    /// Refreshes each definition independently. Per-metric failures are
    /// recorded and reported; only a malformed batch is an error.
    pub async fn refresh_all(
        &self,
        definitions: Vec<MetricDefinition>,
        cancel: CancellationToken,
    ) -> AppResult<RefreshReport> {
        validate_batch(&definitions)?;

        let started_at = Utc::now();
        let report_id = Uuid::new_v4().to_string();
        let limits = Limits::new(&self.options);
        let total = definitions.len();
        tracing::info!(report_id = %report_id, metrics = total, "metric refresh started");

        let mut slots: Vec<Option<MetricOutcome>> = vec![None; total];
        let mut pending: Vec<(String, TargetServer)> = Vec::with_capacity(total);
        let mut tasks = JoinSet::new();

        for (index, definition) in definitions.into_iter().enumerate() {
            pending.push((definition.id.clone(), definition.target_server));
            let pipeline = self.clone();
            let cancel = cancel.clone();
            let global = limits.global.clone();
            let per_target = limits.for_target(definition.target_server);
            tasks.spawn(async move {
                let permits = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permits = acquire_permits(global, per_target) => permits,
                };
                let outcome = match permits {
                    Some(_permits) if !cancel.is_cancelled() => pipeline.refresh_one(definition).await,
                    _ => cancelled_outcome(&definition),
                };
                (index, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(outcome);
                    }
                }
                Err(error) => {
                    tracing::error!(report_id = %report_id, error = %error, "metric refresh task aborted");
                }
            }
        }

        let outcomes = slots
            .into_iter()
            .zip(pending)
            .map(|(outcome, (id, target_server))| {
                outcome.unwrap_or_else(|| MetricOutcome {
                    id,
                    target_server,
                    success: false,
                    value: 0.0,
                    error_kind: Some(ErrorKind::Unknown),
                    message: Some("refresh task aborted".to_string()),
                    elapsed_ms: 0,
                    persisted: false,
                })
            })
            .collect();

        let report = RefreshReport {
            id: report_id,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        tracing::info!(
            report_id = %report.id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            cancelled = report.cancelled(),
            elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
            "metric refresh finished"
        );

        if let Err(error) = self.store.record_report(&report).await {
            tracing::warn!(report_id = %report.id, error = %error, "failed to persist refresh report");
        }
        Ok(report)
    }

    async fn refresh_one(&self, definition: MetricDefinition) -> MetricOutcome {
        let started = Instant::now();
        let result = self.compute(&definition).await;
        let now = Utc::now();

        let write = match &result {
            Ok(value) => RefreshWrite::success(*value, now),
            Err((kind, message)) => RefreshWrite::failure(*kind, message, now),
        };
        let persisted = match self.store.record_refresh(&definition.id, &write).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(metric_id = %definition.id, error = %error, "failed to record metric refresh");
                false
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => {
                tracing::debug!(metric_id = %definition.id, target = %definition.target_server, value = write.value, elapsed_ms, "metric refreshed");
                MetricOutcome {
                    id: definition.id,
                    target_server: definition.target_server,
                    success: true,
                    value: write.value,
                    error_kind: None,
                    message: None,
                    elapsed_ms,
                    persisted,
                }
            }
            Err((kind, message)) => {
                tracing::warn!(metric_id = %definition.id, target = %definition.target_server, error_kind = %kind, elapsed_ms, "metric refresh failed: {message}");
                MetricOutcome {
                    id: definition.id,
                    target_server: definition.target_server,
                    success: false,
                    value: 0.0,
                    error_kind: Some(kind),
                    message: Some(message),
                    elapsed_ms,
                    persisted,
                }
            }
        }
    }

    async fn compute(&self, definition: &MetricDefinition) -> Result<f64, (ErrorKind, String)> {
        let sql = transpile_with(
            &definition.canonical_expression,
            definition.target_server,
            &self.options.transpile,
        )
        .map_err(|error| (error.kind(), error.to_string()))?;

        let handle = self
            .router
            .acquire(definition.target_server)
            .await
            .map_err(|error| (error.kind(), error.to_string()))?;

        match self.executor.execute(&handle, &sql).await {
            QueryOutcome::Success { value } => Ok(value),
            QueryOutcome::Failure { kind, message } => Err((kind, message)),
        }
    }
}

async fn acquire_permits(
    global: Arc<Semaphore>,
    per_target: Arc<Semaphore>,
) -> Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
    // target first so a queue of file-database work cannot hog global slots
    let target = per_target.acquire_owned().await.ok()?;
    let global = global.acquire_owned().await.ok()?;
    Some((target, global))
}

fn cancelled_outcome(definition: &MetricDefinition) -> MetricOutcome {
    MetricOutcome {
        id: definition.id.clone(),
        target_server: definition.target_server,
        success: false,
        value: 0.0,
        error_kind: Some(ErrorKind::Cancelled),
        message: Some("refresh cancelled before the metric started".to_string()),
        elapsed_ms: 0,
        persisted: false,
    }
}

fn validate_batch(definitions: &[MetricDefinition]) -> AppResult<()> {
    if definitions.is_empty() {
        return Err(AppError::Catalog("no metric definitions to refresh".to_string()));
    }
    let mut seen = HashSet::new();
    for definition in definitions {
        if definition.id.trim().is_empty() {
            return Err(AppError::Catalog(format!(
                "metric definition '{}' has an empty id",
                definition.label
            )));
        }
        if !seen.insert(definition.id.as_str()) {
            return Err(AppError::Catalog(format!("duplicate metric id '{}'", definition.id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{MetricCatalog, PipelineOptions, RefreshPipeline};
    use crate::connection::testing::{FakeDriver, Reply, StaticConfig};
    use crate::connection::ConnectionRouter;
    use crate::errors::{AppError, AppResult};
    use crate::models::{ErrorKind, MetricDefinition, RefreshReport, RefreshWrite, TargetServer};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct MemoryCatalog {
        definitions: Mutex<HashMap<String, MetricDefinition>>,
        order: Mutex<Vec<String>>,
        reports: Mutex<Vec<RefreshReport>>,
        failing_writes: Mutex<Vec<String>>,
    }

    impl MemoryCatalog {
        fn with(definitions: &[MetricDefinition]) -> Arc<Self> {
            let catalog = Self::default();
            for definition in definitions {
                catalog.order.lock().expect("order").push(definition.id.clone());
                catalog
                    .definitions
                    .lock()
                    .expect("definitions")
                    .insert(definition.id.clone(), definition.clone());
            }
            Arc::new(catalog)
        }

        fn get(&self, id: &str) -> MetricDefinition {
            self.definitions.lock().expect("definitions")[id].clone()
        }
    }

    #[async_trait]
    impl MetricCatalog for MemoryCatalog {
        async fn load_definitions(&self) -> AppResult<Vec<MetricDefinition>> {
            let definitions = self.definitions.lock().expect("definitions");
            Ok(self
                .order
                .lock()
                .expect("order")
                .iter()
                .filter_map(|id| definitions.get(id).cloned())
                .collect())
        }

        async fn save(&self, definition: &MetricDefinition) -> AppResult<()> {
            self.definitions
                .lock()
                .expect("definitions")
                .insert(definition.id.clone(), definition.clone());
            Ok(())
        }

        async fn record_refresh(&self, metric_id: &str, write: &RefreshWrite) -> AppResult<()> {
            if self.failing_writes.lock().expect("failing").iter().any(|id| id == metric_id) {
                return Err(AppError::Internal("disk full".to_string()));
            }
            let mut definitions = self.definitions.lock().expect("definitions");
            let definition = definitions
                .get_mut(metric_id)
                .ok_or_else(|| AppError::NotFound(metric_id.to_string()))?;
            definition.apply(write);
            Ok(())
        }

        async fn record_report(&self, report: &RefreshReport) -> AppResult<()> {
            self.reports.lock().expect("reports").push(report.clone());
            Ok(())
        }
    }

    fn metric(id: &str, target: TargetServer, expression: &str) -> MetricDefinition {
        let mut definition = MetricDefinition::new(id, "Accounts", id, target, expression);
        definition.last_value = 999.0;
        definition
    }

    fn pipeline(driver: Arc<FakeDriver>, store: Arc<MemoryCatalog>, options: PipelineOptions) -> RefreshPipeline {
        let router = Arc::new(
            ConnectionRouter::new(Arc::new(StaticConfig::all_enabled()))
                .with_driver(TargetServer::RelationalServer, driver.clone())
                .with_driver(TargetServer::FileDatabase, driver),
        );
        RefreshPipeline::new(store, router, options)
    }

    #[tokio::test]
    async fn one_failing_metric_does_not_abort_the_batch() {
        let definitions = vec![
            metric("ok-1", TargetServer::RelationalServer, "SUM(amount) FROM ledger"),
            metric("hangs", TargetServer::RelationalServer, "SUM(amount) FROM stuck"),
            metric("bad-sql", TargetServer::FileDatabase, "SUM(a) FROM t JOIN u ON 1 = 1"),
            metric("ok-2", TargetServer::FileDatabase, "COUNT(*) FROM rentals"),
        ];
        let store = MemoryCatalog::with(&definitions);
        let driver = Arc::new(
            FakeDriver::new()
                .on("[ledger]", Reply::value(125.5))
                .on("[stuck]", Reply::Hang)
                .on("[rentals]", Reply::value(7.0)),
        );
        let options = PipelineOptions {
            query_timeout: Duration::from_millis(100),
            ..PipelineOptions::default()
        };
        let pipeline = pipeline(driver, store.clone(), options);

        let report = pipeline
            .refresh_all(definitions, CancellationToken::new())
            .await
            .expect("refresh");

        assert_eq!(report.outcomes.len(), 4);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 2);
        assert_eq!(report.outcome("hangs").and_then(|o| o.error_kind), Some(ErrorKind::Timeout));
        assert_eq!(
            report.outcome("bad-sql").and_then(|o| o.error_kind),
            Some(ErrorKind::UnsupportedExpression)
        );
        assert_eq!(store.get("ok-1").last_value, 125.5);
        assert_eq!(store.get("ok-2").last_value, 7.0);
        assert!(store.get("ok-1").last_error.is_none());
        assert!(report.outcomes.iter().all(|outcome| outcome.persisted));
        assert_eq!(store.reports.lock().expect("reports").len(), 1);
    }

    #[tokio::test]
    async fn failures_zero_the_value_and_annotate_the_error() {
        let definitions = vec![
            metric("syntax", TargetServer::RelationalServer, "SUM(x) FROM broken"),
            metric("unknown-table", TargetServer::RelationalServer, "SUM(x) FROM ghost"),
        ];
        let store = MemoryCatalog::with(&definitions);
        let driver = Arc::new(
            FakeDriver::new()
                .on("[broken]", Reply::fail(ErrorKind::SyntaxError, "Incorrect syntax near 'x'"))
                .on("[ghost]", Reply::fail(ErrorKind::ExecutionError, "Invalid object name 'ghost'")),
        );
        let pipeline = pipeline(driver, store.clone(), PipelineOptions::default());

        pipeline
            .refresh_all(definitions, CancellationToken::new())
            .await
            .expect("refresh");

        let syntax = store.get("syntax");
        assert_eq!(syntax.last_value, 0.0);
        assert_eq!(syntax.last_error.as_deref(), Some("SYNTAX_ERROR: Incorrect syntax near 'x'"));
        assert!(syntax.last_updated.is_some());
        let unknown = store.get("unknown-table");
        assert_eq!(unknown.last_value, 0.0);
        assert!(unknown
            .last_error
            .as_deref()
            .is_some_and(|error| error.starts_with("EXECUTION_ERROR: ")));
    }

    #[tokio::test]
    async fn file_database_metrics_never_overlap() {
        let definitions: Vec<_> = (0..6)
            .map(|index| metric(&format!("por-{index}"), TargetServer::FileDatabase, "COUNT(*) FROM contracts"))
            .collect();
        let store = MemoryCatalog::with(&definitions);
        let driver = Arc::new(FakeDriver::new().with_query_delay(Duration::from_millis(20)));
        let options = PipelineOptions {
            max_in_flight: 8,
            ..PipelineOptions::default()
        };
        let pipeline = pipeline(driver.clone(), store, options);

        let report = pipeline
            .refresh_all(definitions, CancellationToken::new())
            .await
            .expect("refresh");

        assert_eq!(report.succeeded(), 6);
        assert_eq!(driver.max_per_connection(), 1);
        assert_eq!(driver.connect_count(), 1);
    }

    #[tokio::test]
    async fn relational_metrics_run_in_parallel_within_limit() {
        let definitions: Vec<_> = (0..8)
            .map(|index| metric(&format!("p21-{index}"), TargetServer::RelationalServer, "SUM(x) FROM oe_hdr"))
            .collect();
        let store = MemoryCatalog::with(&definitions);
        let driver = Arc::new(FakeDriver::new().with_query_delay(Duration::from_millis(40)));
        let options = PipelineOptions {
            max_in_flight: 6,
            relational_concurrency: 3,
            ..PipelineOptions::default()
        };
        let router = Arc::new(
            ConnectionRouter::new(Arc::new(StaticConfig::all_enabled()))
                .with_driver(TargetServer::RelationalServer, driver.clone())
                .with_serialized(TargetServer::RelationalServer, false),
        );
        let pipeline = RefreshPipeline::new(store, router, options);

        pipeline
            .refresh_all(definitions, CancellationToken::new())
            .await
            .expect("refresh");

        assert!(driver.max_in_flight() > 1);
        assert!(driver.max_in_flight() <= 3);
    }

    #[tokio::test]
    async fn queued_relational_metrics_are_not_timed_out_by_the_queue() {
        let definitions: Vec<_> = (0..4)
            .map(|index| metric(&format!("p21-{index}"), TargetServer::RelationalServer, "SUM(x) FROM oe_hdr"))
            .collect();
        let store = MemoryCatalog::with(&definitions);
        let driver = Arc::new(FakeDriver::new().with_query_delay(Duration::from_millis(80)));
        let options = PipelineOptions {
            relational_concurrency: 4,
            query_timeout: Duration::from_millis(150),
            ..PipelineOptions::default()
        };
        let pipeline = pipeline(driver.clone(), store, options);

        let report = pipeline
            .refresh_all(definitions, CancellationToken::new())
            .await
            .expect("refresh");

        assert_eq!(report.succeeded(), 4);
        assert_eq!(driver.max_per_connection(), 1);
        assert_eq!(driver.connect_count(), 1);
        assert_eq!(driver.close_count(), 0);
    }

    #[tokio::test]
    async fn report_follows_input_order() {
        let ids = ["slow", "fast", "medium"];
        let definitions: Vec<_> = ids
            .iter()
            .map(|id| metric(id, TargetServer::RelationalServer, &format!("SUM(x) FROM {id}")))
            .collect();
        let store = MemoryCatalog::with(&definitions);
        let driver = Arc::new(
            FakeDriver::new()
                .on_delayed("[slow]", Duration::from_millis(60), Reply::value(1.0))
                .on_delayed("[medium]", Duration::from_millis(30), Reply::value(2.0)),
        );
        let pipeline = pipeline(driver, store, PipelineOptions::default());

        let report = pipeline
            .refresh_all(definitions, CancellationToken::new())
            .await
            .expect("refresh");
        let order: Vec<_> = report.outcomes.iter().map(|outcome| outcome.id.as_str()).collect();
        assert_eq!(order, ids);
    }

    #[tokio::test]
    async fn cancelled_metrics_are_reported_but_not_written() {
        let definitions: Vec<_> = (0..4)
            .map(|index| metric(&format!("por-{index}"), TargetServer::FileDatabase, "COUNT(*) FROM contracts"))
            .collect();
        let store = MemoryCatalog::with(&definitions);
        let driver = Arc::new(FakeDriver::new().with_query_delay(Duration::from_millis(100)));
        let pipeline = pipeline(driver, store.clone(), PipelineOptions::default());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let report = pipeline.refresh_all(definitions, cancel).await.expect("refresh");

        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.cancelled(), 3);
        for outcome in report.outcomes.iter().filter(|outcome| outcome.error_kind == Some(ErrorKind::Cancelled)) {
            assert!(!outcome.persisted);
            let stored = store.get(&outcome.id);
            assert_eq!(stored.last_value, 999.0);
            assert!(stored.last_updated.is_none());
        }
    }

    #[tokio::test]
    async fn write_failures_are_reported_without_aborting() {
        let definitions = vec![
            metric("a", TargetServer::RelationalServer, "SUM(x) FROM t"),
            metric("b", TargetServer::RelationalServer, "SUM(x) FROM t"),
        ];
        let store = MemoryCatalog::with(&definitions);
        store.failing_writes.lock().expect("failing").push("a".to_string());
        let pipeline = pipeline(Arc::new(FakeDriver::new()), store, PipelineOptions::default());

        let report = pipeline
            .refresh_all(definitions, CancellationToken::new())
            .await
            .expect("refresh");
        assert_eq!(report.outcome("a").map(|o| o.persisted), Some(false));
        assert_eq!(report.outcome("b").map(|o| o.persisted), Some(true));
    }

    #[tokio::test]
    async fn malformed_batches_are_catalog_errors() {
        let pipeline = pipeline(
            Arc::new(FakeDriver::new()),
            MemoryCatalog::with(&[]),
            PipelineOptions::default(),
        );

        let err = pipeline
            .refresh_all(Vec::new(), CancellationToken::new())
            .await
            .expect_err("empty");
        assert!(matches!(err, AppError::Catalog(_)));

        let duplicated = vec![
            metric("dup", TargetServer::RelationalServer, "SUM(x) FROM t"),
            metric("dup", TargetServer::FileDatabase, "SUM(x) FROM t"),
        ];
        let err = pipeline
            .refresh_all(duplicated, CancellationToken::new())
            .await
            .expect_err("duplicate");
        assert!(err.to_string().starts_with("CATALOG_INVALID"));
    }

    #[tokio::test]
    async fn refresh_catalog_reads_from_the_store() {
        let definitions = vec![metric("from-store", TargetServer::FileDatabase, "Sum(amt) FROM [Payables]")];
        let store = MemoryCatalog::with(&definitions);
        let driver = Arc::new(FakeDriver::new().on("[Payables]", Reply::value(88.0)));
        let pipeline = pipeline(driver.clone(), store.clone(), PipelineOptions::default());

        let report = pipeline.refresh_catalog(CancellationToken::new()).await.expect("refresh");
        assert_eq!(report.succeeded(), 1);
        assert_eq!(store.get("from-store").last_value, 88.0);
        assert_eq!(driver.queries(), vec!["SELECT Sum(amt) AS value FROM [Payables]".to_string()]);
    }
}
