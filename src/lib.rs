pub mod config;
pub mod connection;
pub mod db;
pub mod dialect;
pub mod errors;
pub mod executor;
pub mod models;
pub mod pipeline;
pub mod scheduler;

pub use crate::config::{load_catalog_file, EngineConfig};
pub use crate::connection::{
    BackendConnection, BackendDriver, CellValue, ConnectionParams, ConnectionRouter, DriverError, Row,
    ServerConfig, ServerConfigProvider, SlotState,
};
pub use crate::db::Database;
pub use crate::dialect::{transpile, transpile_with, TranspileError, TranspileOptions};
pub use crate::errors::{AppError, AppResult};
pub use crate::models::{ErrorKind, MetricDefinition, MetricOutcome, RefreshReport, TargetServer};
pub use crate::pipeline::{MetricCatalog, PipelineOptions, RefreshPipeline};
pub use crate::scheduler::RefreshScheduler;

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Reloads the catalog and refreshes on schedule until Ctrl-C.
pub async fn run(config: EngineConfig) -> AppResult<()> {
    let config = Arc::new(config);
    let db = Arc::new(Database::new(&config.database_path)?);

    let definitions = load_catalog_file(&config.catalog_path)?;
    let change = db.replace_catalog(&definitions)?;
    tracing::info!(
        store = %db.path().display(),
        catalog = %config.catalog_path.display(),
        inserted = change.inserted,
        updated = change.updated,
        removed = change.removed,
        "metric catalog loaded"
    );

    let router = Arc::new(build_router(config.clone()));
    for target in TargetServer::ALL {
        if !router.has_driver(target) {
            tracing::warn!(target = %target, "no driver compiled in; metrics for this server will fail");
        }
    }

    let pipeline = RefreshPipeline::new(db.clone(), router.clone(), config.pipeline_options());
    let scheduler = RefreshScheduler::new(pipeline, db, config.refresh_interval(), config.refresh.retention_days);
    scheduler.start().await;
    tracing::info!(interval_seconds = config.refresh.interval_seconds, "metric refresh scheduler started");

    let signal = tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c");
    tracing::info!("shutting down metric refresh");
    scheduler.shutdown().await;
    router.shutdown().await;
    signal?;
    Ok(())
}

#[allow(unused_mut)]
fn build_router(config: Arc<EngineConfig>) -> ConnectionRouter {
    let mut router = ConnectionRouter::new(config.clone());
    #[cfg(feature = "sqlserver")]
    {
        router = router.with_driver(
            TargetServer::RelationalServer,
            Arc::new(connection::sqlserver::SqlServerDriver),
        );
    }
    #[cfg(feature = "access")]
    {
        let driver = connection::access::AccessDriver::new(config.pipeline_options().query_timeout);
        router = router.with_driver(TargetServer::FileDatabase, Arc::new(driver));
    }
    router
}

const LOG_FILE_PREFIX: &str = "metric-refresh.log";

/// Used when `RUST_LOG` is unset. tiberius reports every login at info.
const DEFAULT_LOG_FILTER: &str = "info,tiberius=warn";

/// JSON logs into a daily-rolled file under `log_dir`.
pub fn init_tracing(log_dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER)
            .map_err(|error| AppError::Config(format!("invalid log filter: {error}")))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(format!("tracing already initialised: {error}")))
}

#[cfg(test)]
mod tests {
    use super::DEFAULT_LOG_FILTER;

    #[test]
    fn default_log_filter_parses() {
        let filter = tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).expect("filter");
        assert!(filter.to_string().contains("tiberius=warn"));
    }
}
