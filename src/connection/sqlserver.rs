//! Relational server driver over tiberius (TDS 7.3+).

use super::{BackendConnection, BackendDriver, CellValue, ConnectionParams, DriverError, RelationalParams, Row};
use crate::models::ErrorKind;
use async_trait::async_trait;
use tiberius::{AuthMethod, Client, ColumnData, Config};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

type TdsClient = Client<Compat<TcpStream>>;

/// Server error numbers raised by the T-SQL parser.
const SYNTAX_ERROR_CODES: &[u32] = &[102, 103, 105, 156, 170, 319, 1038];

#[derive(Debug, Default, Clone, Copy)]
pub struct SqlServerDriver;

#[async_trait]
impl BackendDriver for SqlServerDriver {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn BackendConnection>, DriverError> {
        let ConnectionParams::Relational(params) = params else {
            return Err(DriverError::new(
                ErrorKind::Unknown,
                "relational driver was given file database parameters",
            ));
        };
        let client = open_client(params).await?;
        Ok(Box::new(SqlServerConnection {
            client: Mutex::new(Some(client)),
        }))
    }
}

async fn open_client(params: &RelationalParams) -> Result<TdsClient, DriverError> {
    let mut config = Config::new();
    config.host(&params.host);
    config.port(params.port);
    config.database(&params.database);
    config.application_name("metric-refresh");
    config.authentication(AuthMethod::sql_server(
        &params.username,
        params.password.as_deref().unwrap_or_default(),
    ));
    if params.trust_cert {
        config.trust_cert();
    }

    let tcp = TcpStream::connect(config.get_addr())
        .await
        .map_err(|error| io_error(error.kind(), error.to_string()))?;
    tcp.set_nodelay(true).ok();

    Client::connect(config, tcp.compat_write())
        .await
        .map_err(classify)
}

pub struct SqlServerConnection {
    client: Mutex<Option<TdsClient>>,
}

#[async_trait]
impl BackendConnection for SqlServerConnection {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, DriverError> {
        let mut guard = self.client.lock().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| DriverError::new(ErrorKind::ConnectionError, "connection already closed"))?;

        let rows = client
            .simple_query(sql)
            .await
            .map_err(classify)?
            .into_first_result()
            .await
            .map_err(classify)?;

        Ok(rows.iter().map(convert_row).collect())
    }

    async fn close(&self) -> Result<(), DriverError> {
        let client = self.client.lock().await.take();
        match client {
            Some(client) => client.close().await.map_err(classify),
            None => Ok(()),
        }
    }
}

fn convert_row(row: &tiberius::Row) -> Row {
    let (columns, values) = row
        .cells()
        .map(|(column, data)| (column.name().to_string(), convert_cell(data)))
        .unzip();
    Row::new(columns, values)
}

fn convert_cell(data: &ColumnData<'static>) -> CellValue {
    match data {
        ColumnData::Bit(Some(flag)) => CellValue::Bool(*flag),
        ColumnData::U8(Some(value)) => CellValue::Int(i64::from(*value)),
        ColumnData::I16(Some(value)) => CellValue::Int(i64::from(*value)),
        ColumnData::I32(Some(value)) => CellValue::Int(i64::from(*value)),
        ColumnData::I64(Some(value)) => CellValue::Int(*value),
        ColumnData::F32(Some(value)) => CellValue::Float(f64::from(*value)),
        ColumnData::F64(Some(value)) => CellValue::Float(*value),
        ColumnData::Numeric(Some(numeric)) => CellValue::Decimal(numeric.to_string()),
        ColumnData::String(Some(text)) => CellValue::Text(text.to_string()),
        _ => CellValue::Null,
    }
}

fn io_error(kind: std::io::ErrorKind, message: String) -> DriverError {
    let error_kind = if kind == std::io::ErrorKind::TimedOut {
        ErrorKind::Timeout
    } else {
        ErrorKind::ConnectionError
    };
    DriverError::new(error_kind, message)
}

/// Classifies by TDS error number and error variant, never by message text.
fn classify(error: tiberius::error::Error) -> DriverError {
    use tiberius::error::Error;

    match error {
        Error::Server(token) => {
            let code = token.code();
            let kind = if SYNTAX_ERROR_CODES.contains(&code) {
                ErrorKind::SyntaxError
            } else {
                ErrorKind::ExecutionError
            };
            DriverError::new(kind, token.message().to_string()).with_code(code.to_string())
        }
        Error::Io { kind, message } => io_error(kind, message),
        Error::Tls(message) => DriverError::new(ErrorKind::ConnectionError, message),
        Error::Routing { host, port } => DriverError::new(
            ErrorKind::ConnectionError,
            format!("server requested a redirect to {host}:{port}"),
        ),
        other => DriverError::new(ErrorKind::Unknown, other.to_string()),
    }
}
