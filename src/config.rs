use crate::connection::{
    ConnectionParams, FileDatabaseParams, RelationalParams, ServerConfig, ServerConfigProvider,
};
use crate::dialect::{transpile_with, TranspileOptions, DEFAULT_SCHEMA};
use crate::errors::{AppError, AppResult};
use crate::models::{MetricDefinition, TargetServer};
use crate::pipeline::PipelineOptions;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "metric-refresh.yaml";
pub const DEFAULT_ODBC_DRIVER: &str = "Microsoft Access Driver (*.mdb, *.accdb)";

static METRIC_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]{0,127}$").expect("valid metric id regex"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    pub catalog_path: PathBuf,
    pub log_dir: PathBuf,
    pub refresh: RefreshSettings,
    pub servers: ServersConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/metrics.db"),
            catalog_path: PathBuf::from("metrics.yaml"),
            log_dir: PathBuf::from("logs"),
            refresh: RefreshSettings::default(),
            servers: ServersConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    pub interval_seconds: u64,
    pub max_in_flight: usize,
    pub relational_concurrency: usize,
    pub query_timeout_seconds: u64,
    pub retention_days: u32,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            interval_seconds: 300,
            max_in_flight: 6,
            relational_concurrency: 4,
            query_timeout_seconds: 30,
            retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServersConfig {
    pub p21: Option<RelationalServerConfig>,
    pub por: Option<FileDatabaseConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationalServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: Option<String>,
    /// Environment variable holding the password; wins over `password`.
    pub password_env: Option<String>,
    pub trust_cert: bool,
    pub schema: String,
}

impl Default for RelationalServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: String::new(),
            port: 1433,
            database: String::new(),
            username: String::new(),
            password: None,
            password_env: None,
            trust_cert: false,
            schema: DEFAULT_SCHEMA.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileDatabaseConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub odbc_driver: String,
    pub password: Option<String>,
    pub password_env: Option<String>,
}

impl Default for FileDatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::new(),
            odbc_driver: DEFAULT_ODBC_DRIVER.to_string(),
            password: None,
            password_env: None,
        }
    }
}

impl EngineConfig {
    /// Reads and validates a YAML config. Relative paths resolve against the
    /// directory holding the file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|error| AppError::Config(format!("cannot read {}: {error}", path.display())))?;
        let mut config = Self::from_yaml_str(&raw)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> AppResult<Self> {
        let config: Self = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let refresh = &self.refresh;
        if refresh.interval_seconds == 0 {
            return Err(AppError::Config("refresh.interval_seconds must be greater than zero".to_string()));
        }
        if refresh.max_in_flight == 0 || refresh.relational_concurrency == 0 {
            return Err(AppError::Config(
                "refresh.max_in_flight and refresh.relational_concurrency must be greater than zero".to_string(),
            ));
        }
        if refresh.query_timeout_seconds == 0 {
            return Err(AppError::Config("refresh.query_timeout_seconds must be greater than zero".to_string()));
        }
        if let Some(p21) = self.servers.p21.as_ref().filter(|server| server.enabled) {
            if p21.host.trim().is_empty() {
                return Err(AppError::Config("servers.p21.host is required when enabled".to_string()));
            }
            if p21.schema.trim().is_empty() {
                return Err(AppError::Config("servers.p21.schema must not be empty".to_string()));
            }
        }
        if let Some(por) = self.servers.por.as_ref().filter(|server| server.enabled) {
            if por.path.as_os_str().is_empty() {
                return Err(AppError::Config("servers.por.path is required when enabled".to_string()));
            }
        }
        Ok(())
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        for path in [&mut self.database_path, &mut self.catalog_path, &mut self.log_dir] {
            resolve(path, base);
        }
        if let Some(por) = self.servers.por.as_mut() {
            resolve(&mut por.path, base);
        }
    }

    pub fn transpile_options(&self) -> TranspileOptions {
        TranspileOptions {
            default_schema: self
                .servers
                .p21
                .as_ref()
                .map(|server| server.schema.clone())
                .unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            max_in_flight: self.refresh.max_in_flight,
            relational_concurrency: self.refresh.relational_concurrency,
            query_timeout: Duration::from_secs(self.refresh.query_timeout_seconds),
            transpile: self.transpile_options(),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh.interval_seconds)
    }
}

impl ServerConfigProvider for EngineConfig {
    fn server_config(&self, target: TargetServer) -> Option<ServerConfig> {
        match target {
            TargetServer::RelationalServer => self.servers.p21.as_ref().map(|server| ServerConfig {
                enabled: server.enabled,
                params: ConnectionParams::Relational(RelationalParams {
                    host: server.host.clone(),
                    port: server.port,
                    database: server.database.clone(),
                    username: server.username.clone(),
                    password: resolve_secret(server.password.as_ref(), server.password_env.as_ref()),
                    trust_cert: server.trust_cert,
                }),
            }),
            TargetServer::FileDatabase => self.servers.por.as_ref().map(|server| ServerConfig {
                enabled: server.enabled,
                params: ConnectionParams::FileDatabase(FileDatabaseParams {
                    path: server.path.clone(),
                    odbc_driver: server.odbc_driver.clone(),
                    password: resolve_secret(server.password.as_ref(), server.password_env.as_ref()),
                }),
            }),
        }
    }
}

fn resolve(path: &mut PathBuf, base: &Path) {
    if !path.as_os_str().is_empty() && path.is_relative() {
        *path = base.join(&*path);
    }
}

fn resolve_secret(inline: Option<&String>, env_name: Option<&String>) -> Option<String> {
    env_name
        .and_then(|name| std::env::var(name).ok())
        .or_else(|| inline.cloned())
}

// ─── Static metric catalog ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogFile {
    #[serde(default)]
    metrics: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogEntry {
    id: String,
    #[serde(alias = "group")]
    group_name: String,
    label: String,
    #[serde(alias = "target")]
    target_server: TargetServer,
    #[serde(default, alias = "table")]
    table_hint: Option<String>,
    #[serde(alias = "expression")]
    canonical_expression: String,
}

/// Parses the static catalog YAML into definitions, in file order.
pub fn load_catalog_file(path: &Path) -> AppResult<Vec<MetricDefinition>> {
    let raw = fs::read_to_string(path)
        .map_err(|error| AppError::Catalog(format!("cannot read {}: {error}", path.display())))?;
    parse_catalog(&raw)
}

pub fn parse_catalog(raw: &str) -> AppResult<Vec<MetricDefinition>> {
    let file: CatalogFile =
        serde_yaml::from_str(raw).map_err(|error| AppError::Catalog(error.to_string()))?;

    let mut seen = HashSet::new();
    let mut definitions = Vec::with_capacity(file.metrics.len());
    for entry in file.metrics {
        if !METRIC_ID.is_match(&entry.id) {
            return Err(AppError::Catalog(format!("invalid metric id '{}'", entry.id)));
        }
        if !seen.insert(entry.id.clone()) {
            return Err(AppError::Catalog(format!("duplicate metric id '{}'", entry.id)));
        }
        if entry.canonical_expression.trim().is_empty() {
            return Err(AppError::Catalog(format!("metric '{}' has no expression", entry.id)));
        }

        // Still loaded: the refresh records the failure against the metric.
        if let Err(error) = transpile_with(
            &entry.canonical_expression,
            entry.target_server,
            &TranspileOptions::default(),
        ) {
            tracing::warn!(metric_id = %entry.id, error = %error, "catalog expression will not transpile");
        }

        let mut definition = MetricDefinition::new(
            entry.id,
            entry.group_name,
            entry.label,
            entry.target_server,
            entry.canonical_expression.trim(),
        );
        definition.table_hint = entry.table_hint;
        definitions.push(definition);
    }
    Ok(definitions)
}

#[cfg(test)]
mod tests {
    use super::{load_catalog_file, parse_catalog, EngineConfig, DEFAULT_ODBC_DRIVER};
    use crate::connection::{ConnectionParams, ServerConfigProvider};
    use crate::errors::AppError;
    use crate::models::TargetServer;
    use std::time::Duration;

    const CONFIG: &str = r#"
database_path: store/metrics.db
catalog_path: metrics.yaml
refresh:
  interval_seconds: 120
  query_timeout_seconds: 10
servers:
  p21:
    host: p21.internal
    database: P21Live
    username: dashboard
    password_env: METRIC_REFRESH_TEST_P21_PASSWORD
    password: fallback
    schema: sales
  por:
    enabled: false
    path: por/rentals.mdb
"#;

    #[test]
    fn defaults_fill_unspecified_fields() {
        let config = EngineConfig::from_yaml_str(CONFIG).expect("config");
        assert_eq!(config.refresh.max_in_flight, 6);
        assert_eq!(config.refresh.relational_concurrency, 4);
        assert_eq!(config.refresh.retention_days, 90);
        assert_eq!(config.refresh_interval(), Duration::from_secs(120));
        assert_eq!(config.pipeline_options().query_timeout, Duration::from_secs(10));
        assert_eq!(config.transpile_options().default_schema, "sales");

        let p21 = config.servers.p21.as_ref().expect("p21");
        assert_eq!(p21.port, 1433);
        let por = config.servers.por.as_ref().expect("por");
        assert_eq!(por.odbc_driver, DEFAULT_ODBC_DRIVER);
    }

    #[test]
    fn provider_reports_disabled_servers_and_resolves_env_password() {
        std::env::set_var("METRIC_REFRESH_TEST_P21_PASSWORD", "from-env");
        let config = EngineConfig::from_yaml_str(CONFIG).expect("config");

        let p21 = config.server_config(TargetServer::RelationalServer).expect("p21");
        assert!(p21.enabled);
        match p21.params {
            ConnectionParams::Relational(params) => {
                assert_eq!(params.password.as_deref(), Some("from-env"));
                assert!(!format!("{params:?}").contains("from-env"));
            }
            other => panic!("unexpected params {other:?}"),
        }

        let por = config.server_config(TargetServer::FileDatabase).expect("por block");
        assert!(!por.enabled);
    }

    #[test]
    fn rejects_zero_limits() {
        let err = EngineConfig::from_yaml_str("refresh:\n  max_in_flight: 0\n").expect_err("zero");
        assert!(matches!(err, AppError::Config(_)));
        let err = EngineConfig::from_yaml_str("refresh:\n  query_timeout_seconds: 0\n").expect_err("zero");
        assert!(err.to_string().starts_with("CONFIG_INVALID"));
        let err = EngineConfig::from_yaml_str("servers:\n  p21:\n    database: x\n").expect_err("host");
        assert!(err.to_string().contains("servers.p21.host"));
    }

    #[test]
    fn load_resolves_paths_against_config_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metric-refresh.yaml");
        std::fs::write(&path, CONFIG).expect("write config");

        let config = EngineConfig::load(&path).expect("load");
        assert_eq!(config.database_path, dir.path().join("store/metrics.db"));
        assert_eq!(
            config.servers.por.as_ref().map(|por| por.path.clone()),
            Some(dir.path().join("por/rentals.mdb"))
        );
    }

    #[test]
    fn parses_catalog_with_short_keys() {
        let definitions = parse_catalog(
            r#"
metrics:
  - id: ar-aging-31-60
    group: AR Aging
    label: "31-60 days"
    target: P21
    table: ar_open_items
    expression: SUM(open_amount) FROM ar_open_items WHERE DATEDIFF(day, invoice_date, GETDATE()) BETWEEN 31 AND 60
  - id: por-open-contracts
    groupName: Rentals
    label: Open contracts
    targetServer: POR
    canonicalExpression: COUNT(*) FROM Contracts
"#,
        )
        .expect("catalog");
        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions[0].table_hint.as_deref(), Some("ar_open_items"));
        assert_eq!(definitions[1].target_server, TargetServer::FileDatabase);
        assert_eq!(definitions[1].last_value, 0.0);
    }

    #[test]
    fn catalog_rejects_bad_and_duplicate_ids() {
        let bad = "metrics:\n  - {id: 'has space', group: g, label: l, target: P21, expression: 'COUNT(*) FROM t'}\n";
        assert!(matches!(parse_catalog(bad), Err(AppError::Catalog(_))));

        let duplicate = "metrics:\n  - {id: a, group: g, label: l, target: P21, expression: 'COUNT(*) FROM t'}\n  - {id: a, group: g, label: l, target: POR, expression: 'COUNT(*) FROM t'}\n";
        let err = parse_catalog(duplicate).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate metric id 'a'"));

        let missing = load_catalog_file(std::path::Path::new("/nonexistent/catalog.yaml")).expect_err("missing");
        assert!(matches!(missing, AppError::Catalog(_)));
    }
}
