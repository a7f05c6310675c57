//! File database driver over the Access ODBC driver.
//!
//! ODBC calls block, so every statement runs on the blocking pool. Values are
//! fetched as text and coerced by the executor.

use super::{BackendConnection, BackendDriver, CellValue, ConnectionParams, DriverError, FileDatabaseParams, Row};
use crate::models::ErrorKind;
use async_trait::async_trait;
use odbc_api::buffers::TextRowSet;
use odbc_api::{Connection, ConnectionOptions, Cursor, Environment, ResultSetMetadata};
use once_cell::sync::OnceCell;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MAX_TEXT_LEN: usize = 4096;

static ENVIRONMENT: OnceCell<Environment> = OnceCell::new();

fn environment() -> Result<&'static Environment, DriverError> {
    ENVIRONMENT.get_or_try_init(Environment::new).map_err(classify)
}

/// Opens ODBC connections to the file database. Every statement carries an
/// ODBC query timeout so a runaway query is cancelled by the driver itself
/// and releases the connection.
#[derive(Debug, Clone, Copy)]
pub struct AccessDriver {
    query_timeout_secs: usize,
}

impl AccessDriver {
    pub fn new(query_timeout: Duration) -> Self {
        Self {
            query_timeout_secs: timeout_secs(query_timeout),
        }
    }
}

impl Default for AccessDriver {
    fn default() -> Self {
        Self::new(crate::executor::DEFAULT_QUERY_TIMEOUT)
    }
}

/// ODBC counts whole seconds and reads 0 as "no timeout".
fn timeout_secs(timeout: Duration) -> usize {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1) as usize
}

#[async_trait]
impl BackendDriver for AccessDriver {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn BackendConnection>, DriverError> {
        let ConnectionParams::FileDatabase(params) = params else {
            return Err(DriverError::new(
                ErrorKind::Unknown,
                "file database driver was given relational parameters",
            ));
        };
        if !params.path.is_file() {
            return Err(DriverError::new(
                ErrorKind::ConnectionError,
                format!("database file {} does not exist", params.path.display()),
            ));
        }

        let connection_string = connection_string(params);
        let connection = tokio::task::spawn_blocking(move || {
            environment()?
                .connect_with_connection_string(&connection_string, ConnectionOptions::default())
                .map_err(classify)
        })
        .await
        .map_err(|error| DriverError::new(ErrorKind::Unknown, error.to_string()))??;

        Ok(Box::new(AccessConnection {
            connection: Arc::new(Mutex::new(Some(connection))),
            query_timeout_secs: self.query_timeout_secs,
        }))
    }
}

fn connection_string(params: &FileDatabaseParams) -> String {
    let mut out = format!("Driver={{{}}};DBQ={};", params.odbc_driver, params.path.display());
    if let Some(password) = &params.password {
        out.push_str(&format!("PWD={{{}}};", password.replace('}', "}}")));
    }
    out
}

pub struct AccessConnection {
    connection: Arc<Mutex<Option<Connection<'static>>>>,
    query_timeout_secs: usize,
}

#[async_trait]
impl BackendConnection for AccessConnection {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, DriverError> {
        let connection = self.connection.clone();
        let sql = sql.to_string();
        let timeout_secs = self.query_timeout_secs;
        tokio::task::spawn_blocking(move || {
            let guard = connection
                .lock()
                .map_err(|_| DriverError::new(ErrorKind::Unknown, "odbc connection mutex poisoned"))?;
            let connection = guard
                .as_ref()
                .ok_or_else(|| DriverError::new(ErrorKind::ConnectionError, "connection already closed"))?;
            first_row(connection, &sql, timeout_secs)
        })
        .await
        .map_err(|error| DriverError::new(ErrorKind::Unknown, error.to_string()))?
    }

    async fn close(&self) -> Result<(), DriverError> {
        let connection = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let taken = connection
                .lock()
                .map_err(|_| DriverError::new(ErrorKind::Unknown, "odbc connection mutex poisoned"))?
                .take();
            drop(taken);
            Ok(())
        })
        .await
        .map_err(|error| DriverError::new(ErrorKind::Unknown, error.to_string()))?
    }
}

/// Aggregate queries return one row, so only the first is fetched.
fn first_row(connection: &Connection<'static>, sql: &str, timeout_secs: usize) -> Result<Vec<Row>, DriverError> {
    let Some(mut cursor) = connection.execute(sql, (), Some(timeout_secs)).map_err(classify)? else {
        return Ok(Vec::new());
    };
    let columns: Vec<String> = cursor
        .column_names()
        .map_err(classify)?
        .collect::<Result<_, _>>()
        .map_err(classify)?;

    let buffer = TextRowSet::for_cursor(1, &mut cursor, Some(MAX_TEXT_LEN)).map_err(classify)?;
    let mut rows = cursor.bind_buffer(buffer).map_err(classify)?;
    let Some(batch) = rows.fetch().map_err(classify)? else {
        return Ok(Vec::new());
    };
    if batch.num_rows() == 0 {
        return Ok(Vec::new());
    }

    let values = (0..batch.num_cols())
        .map(|column| match batch.at(column, 0) {
            Some(bytes) => CellValue::Text(String::from_utf8_lossy(bytes).into_owned()),
            None => CellValue::Null,
        })
        .collect();
    Ok(vec![Row::new(columns, values)])
}

/// Classifies by SQLSTATE class.
fn classify(error: odbc_api::Error) -> DriverError {
    let state = match &error {
        odbc_api::Error::Diagnostics { record, .. } => Some(record.state.as_str().to_string()),
        _ => None,
    };
    let kind = state.as_deref().map(kind_for_sqlstate).unwrap_or(ErrorKind::Unknown);
    let driver_error = DriverError::new(kind, error.to_string());
    match state {
        Some(state) => driver_error.with_code(state),
        None => driver_error,
    }
}

fn kind_for_sqlstate(state: &str) -> ErrorKind {
    match state {
        "HYT00" | "HYT01" => ErrorKind::Timeout,
        "42000" | "37000" => ErrorKind::SyntaxError,
        _ if state.starts_with("08") => ErrorKind::ConnectionError,
        _ if state.starts_with("42") || state.starts_with("22") || state.starts_with("23") => {
            ErrorKind::ExecutionError
        }
        _ => ErrorKind::Unknown,
    }
}
