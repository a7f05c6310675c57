use metric_refresh_lib::config::DEFAULT_CONFIG_PATH;
use metric_refresh_lib::EngineConfig;
use std::path::PathBuf;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = match EngineConfig::load(&config_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("metric-refresh: {error}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(error) = metric_refresh_lib::init_tracing(&config.log_dir) {
        eprintln!("metric-refresh: failed to initialise logging: {error}");
    }

    match metric_refresh_lib::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "metric refresh stopped");
            eprintln!("metric-refresh: {error}");
            ExitCode::FAILURE
        }
    }
}
