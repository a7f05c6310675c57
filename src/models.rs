use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical backend a metric is computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TargetServer {
    /// T-SQL relational server.
    #[serde(rename = "P21", alias = "relational-server", alias = "p21")]
    RelationalServer,
    /// Desktop file database (Access).
    #[serde(rename = "POR", alias = "file-database", alias = "por")]
    FileDatabase,
}

impl TargetServer {
    pub const ALL: [TargetServer; 2] = [TargetServer::RelationalServer, TargetServer::FileDatabase];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RelationalServer => "P21",
            Self::FileDatabase => "POR",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "P21" | "RELATIONAL-SERVER" => Some(Self::RelationalServer),
            "POR" | "FILE-DATABASE" => Some(Self::FileDatabase),
            _ => None,
        }
    }
}

impl fmt::Display for TargetServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-metric failure taxonomy recorded in `last_error` and the refresh report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    UnsupportedExpression,
    ConfigurationMissing,
    ConnectionFailed,
    ConnectionError,
    Timeout,
    SyntaxError,
    ExecutionError,
    Unknown,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedExpression => "UNSUPPORTED_EXPRESSION",
            Self::ConfigurationMissing => "CONFIGURATION_MISSING",
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::Unknown => "UNKNOWN",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Short machine-readable annotation stored in `last_error`.
    pub fn annotate(self, message: &str) -> String {
        format!("{}: {}", self.as_str(), message)
    }

    /// Whether a handle that produced this failure may be poisoned.
    pub fn poisons_connection(self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Metric Catalog ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDefinition {
    pub id: String,
    pub group_name: String,
    pub label: String,
    pub target_server: TargetServer,
    #[serde(default)]
    pub table_hint: Option<String>,
    pub canonical_expression: String,
    #[serde(default)]
    pub last_value: f64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl MetricDefinition {
    pub fn new(
        id: impl Into<String>,
        group_name: impl Into<String>,
        label: impl Into<String>,
        target_server: TargetServer,
        canonical_expression: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            group_name: group_name.into(),
            label: label.into(),
            target_server,
            table_hint: None,
            canonical_expression: canonical_expression.into(),
            last_value: 0.0,
            last_error: None,
            last_updated: None,
        }
    }

    pub fn apply(&mut self, write: &RefreshWrite) {
        self.last_value = write.value;
        self.last_error = write.error.clone();
        self.last_updated = Some(write.updated_at);
    }
}

/// The three fields a refresh attempt writes, always together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshWrite {
    pub value: f64,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RefreshWrite {
    pub fn success(value: f64, updated_at: DateTime<Utc>) -> Self {
        Self {
            value: if value.is_finite() { value } else { 0.0 },
            error: None,
            updated_at,
        }
    }

    pub fn failure(kind: ErrorKind, message: &str, updated_at: DateTime<Utc>) -> Self {
        Self {
            value: 0.0,
            error: Some(kind.annotate(message)),
            updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    pub id: String,
    pub metric_id: String,
    pub value: f64,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

// ─── Refresh Report ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricOutcome {
    pub id: String,
    pub target_server: TargetServer,
    pub success: bool,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub elapsed_ms: u64,
    pub persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<MetricOutcome>,
}

impl RefreshReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.success).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.success && outcome.error_kind != Some(ErrorKind::Cancelled))
            .count()
    }

    pub fn cancelled(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.error_kind == Some(ErrorKind::Cancelled))
            .count()
    }

    pub fn outcome(&self, metric_id: &str) -> Option<&MetricOutcome> {
        self.outcomes.iter().find(|outcome| outcome.id == metric_id)
    }
}
