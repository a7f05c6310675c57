use crate::connection::{ConnectionHandle, ConnectionRouter, Row};
use crate::dialect::RESULT_ALIAS;
use crate::models::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Success { value: f64 },
    Failure { kind: ErrorKind, message: String },
}

impl QueryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Runs one statement against a routed connection and reduces the result to
/// a single number. Never returns an error: every failure is a tagged
/// [`QueryOutcome::Failure`].
#[derive(Clone)]
pub struct QueryExecutor {
    router: Arc<ConnectionRouter>,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(router: Arc<ConnectionRouter>, timeout: Duration) -> Self {
        Self { router, timeout }
    }

    /// The timeout covers the statement itself, not the wait for a turn on a
    /// serialized connection. A timed-out connection is dropped from the
    /// router without waiting for its close.
    pub async fn execute(&self, handle: &ConnectionHandle, sql: &str) -> QueryOutcome {
        let mut handle = handle.clone();
        let mut result = handle.query(sql, self.timeout).await;
        // retired while queued behind a statement that cost the connection
        if matches!(&result, Ok(Err(error)) if error.kind == ErrorKind::ConnectionError) && handle.is_retired() {
            tracing::debug!(target = %handle.target(), "connection retired while queued; reconnecting");
            match self.router.acquire(handle.target()).await {
                Ok(fresh) => {
                    handle = fresh;
                    result = handle.query(sql, self.timeout).await;
                }
                Err(error) => {
                    return QueryOutcome::Failure {
                        kind: error.kind(),
                        message: error.to_string(),
                    }
                }
            }
        }

        match result {
            Ok(Ok(rows)) => QueryOutcome::Success {
                value: normalize_rows(&rows),
            },
            Ok(Err(error)) => {
                tracing::warn!(
                    target = %handle.target(),
                    error_kind = %error.kind,
                    code = error.code.as_deref().unwrap_or(""),
                    error = %error,
                    "query failed"
                );
                if error.kind == ErrorKind::Timeout {
                    self.router.discard(&handle).await;
                } else if error.kind.poisons_connection() {
                    self.router.invalidate(&handle).await;
                }
                QueryOutcome::Failure {
                    kind: error.kind,
                    message: error.message,
                }
            }
            Err(_) => {
                tracing::warn!(
                    target = %handle.target(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "query timed out; discarding connection"
                );
                self.router.discard(&handle).await;
                QueryOutcome::Failure {
                    kind: ErrorKind::Timeout,
                    message: format!("query did not finish within {} ms", self.timeout.as_millis()),
                }
            }
        }
    }
}

/// First row only. A column named `value` wins over position; anything that
/// is not a finite number reads as zero.
pub fn normalize_rows(rows: &[Row]) -> f64 {
    let Some(row) = rows.first() else {
        return 0.0;
    };
    row.get(RESULT_ALIAS)
        .or_else(|| row.values().first())
        .and_then(|cell| cell.as_f64())
        .unwrap_or(0.0)
}
