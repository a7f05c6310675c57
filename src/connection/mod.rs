//! Backend driver seam and the per-server connection router.

pub mod router;

#[cfg(feature = "access")]
pub mod access;
#[cfg(feature = "sqlserver")]
pub mod sqlserver;
#[cfg(test)]
pub(crate) mod testing;

use crate::models::{ErrorKind, TargetServer};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub use router::{ConnectionHandle, ConnectionRouter, RouterError, SlotState};

// ─── Rows ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Exact numerics travel as text so no precision is lost before coercion.
    Decimal(String),
    Text(String),
}

impl CellValue {
    /// Numeric reading of the cell. `None` for nulls and non-numeric text.
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            Self::Null => None,
            Self::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Decimal(raw) | Self::Text(raw) => raw.trim().parse::<f64>().ok(),
        };
        value.filter(|value| value.is_finite())
    }
}

/// One result row with its column names in positional order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<CellValue>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<CellValue>) -> Self {
        Self { columns, values }
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, CellValue)>,
        S: Into<String>,
    {
        let (columns, values) = pairs.into_iter().map(|(name, value)| (name.into(), value)).unzip();
        Self { columns, values }
    }

    pub fn values(&self) -> &[CellValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Case-insensitive lookup by column name.
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.columns
            .iter()
            .position(|name| name.eq_ignore_ascii_case(column))
            .and_then(|index| self.values.get(index))
    }
}

// ─── Connection parameters ──────────────────────────────────────────────────

#[derive(Clone, PartialEq)]
pub struct RelationalParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: Option<String>,
    pub trust_cert: bool,
}

impl fmt::Debug for RelationalParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationalParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("trust_cert", &self.trust_cert)
            .finish()
    }
}

#[derive(Clone, PartialEq)]
pub struct FileDatabaseParams {
    pub path: PathBuf,
    pub odbc_driver: String,
    pub password: Option<String>,
}

impl fmt::Debug for FileDatabaseParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDatabaseParams")
            .field("path", &self.path)
            .field("odbc_driver", &self.odbc_driver)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionParams {
    Relational(RelationalParams),
    FileDatabase(FileDatabaseParams),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub enabled: bool,
    pub params: ConnectionParams,
}

/// Read-only source of per-server connection settings.
pub trait ServerConfigProvider: Send + Sync {
    fn server_config(&self, target: TargetServer) -> Option<ServerConfig>;
}

// ─── Drivers ────────────────────────────────────────────────────────────────

/// Failure reported by a backend driver, already classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    pub kind: ErrorKind,
    /// Structured driver code (TDS error number, SQLSTATE) when one exists.
    pub code: Option<String>,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

#[async_trait]
pub trait BackendDriver: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn BackendConnection>, DriverError>;
}

#[async_trait]
pub trait BackendConnection: Send + Sync {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, DriverError>;

    async fn close(&self) -> Result<(), DriverError>;
}
