//! Scripted in-memory backend used by router, executor and pipeline tests.

use super::{
    BackendConnection, BackendDriver, CellValue, ConnectionParams, DriverError, FileDatabaseParams,
    RelationalParams, Row, ServerConfig, ServerConfigProvider,
};
use crate::models::{ErrorKind, TargetServer};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Reply {
    Rows(Vec<Row>),
    Fail(DriverError),
    /// Never answers within any sensible timeout.
    Hang,
}

impl Reply {
    pub fn value(value: f64) -> Self {
        Self::Rows(vec![Row::from_pairs([("value", CellValue::Float(value))])])
    }

    pub fn fail(kind: ErrorKind, message: &str) -> Self {
        Self::Fail(DriverError::new(kind, message))
    }
}

#[derive(Debug, Clone)]
struct Script {
    pattern: String,
    delay: Duration,
    reply: Reply,
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicUsize,
    closes: AtomicUsize,
    failing_connects: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    max_per_connection: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

pub struct FakeDriver {
    counters: Arc<Counters>,
    scripts: Arc<Mutex<Vec<Script>>>,
    connect_delay: Duration,
    query_delay: Duration,
    close_delay: Duration,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            scripts: Arc::new(Mutex::new(Vec::new())),
            connect_delay: Duration::ZERO,
            query_delay: Duration::ZERO,
            close_delay: Duration::ZERO,
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Delay applied to every query that has no delay of its own.
    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }

    /// Stalls every close, like a backend whose close waits on a statement
    /// that is still running.
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    /// The next `count` connects fail with a connection error.
    pub fn fail_connects(self, count: usize) -> Self {
        self.counters.failing_connects.store(count, Ordering::SeqCst);
        self
    }

    /// Answers any SQL containing `pattern` with `reply`. First match wins.
    pub fn on(self, pattern: &str, reply: Reply) -> Self {
        self.on_delayed(pattern, Duration::ZERO, reply)
    }

    pub fn on_delayed(self, pattern: &str, delay: Duration, reply: Reply) -> Self {
        self.scripts.lock().expect("scripts lock").push(Script {
            pattern: pattern.to_string(),
            delay,
            reply,
        });
        self
    }

    pub fn connect_count(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of statements ever running at once on a single connection.
    pub fn max_per_connection(&self) -> usize {
        self.counters.max_per_connection.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.counters.queries.lock().expect("queries lock").clone()
    }
}

#[async_trait]
impl BackendDriver for FakeDriver {
    async fn connect(&self, _params: &ConnectionParams) -> Result<Box<dyn BackendConnection>, DriverError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let failing = self
            .counters
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DriverError::new(ErrorKind::ConnectionError, "login refused").with_code("18456"));
        }
        Ok(Box::new(FakeConnection {
            counters: self.counters.clone(),
            scripts: self.scripts.clone(),
            query_delay: self.query_delay,
            close_delay: self.close_delay,
            in_flight: AtomicUsize::new(0),
        }))
    }
}

struct FakeConnection {
    counters: Arc<Counters>,
    scripts: Arc<Mutex<Vec<Script>>>,
    query_delay: Duration,
    close_delay: Duration,
    in_flight: AtomicUsize,
}

impl FakeConnection {
    fn script_for(&self, sql: &str) -> Option<Script> {
        self.scripts
            .lock()
            .expect("scripts lock")
            .iter()
            .find(|script| sql.contains(&script.pattern))
            .cloned()
    }
}

#[async_trait]
impl BackendConnection for FakeConnection {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, DriverError> {
        self.counters.queries.lock().expect("queries lock").push(sql.to_string());

        let _in_flight = InFlight::enter(&self.in_flight, &self.counters);

        let script = self.script_for(sql);
        let delay = match &script {
            Some(script) if !script.delay.is_zero() => script.delay,
            _ => self.query_delay,
        };
        let reply = script.map(|script| script.reply).unwrap_or_else(|| Reply::value(1.0));
        let delay = if matches!(reply, Reply::Hang) {
            Duration::from_secs(3600)
        } else {
            delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match reply {
            Reply::Rows(rows) => Ok(rows),
            Reply::Fail(error) => Err(error),
            Reply::Hang => Err(DriverError::new(ErrorKind::Timeout, "hung query woke up")),
        }
    }

    async fn close(&self) -> Result<(), DriverError> {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Counts a statement as running until dropped, including when the query
/// future is abandoned by a timeout.
struct InFlight<'a> {
    local: &'a AtomicUsize,
    counters: &'a Counters,
}

impl<'a> InFlight<'a> {
    fn enter(local: &'a AtomicUsize, counters: &'a Counters) -> Self {
        let on_connection = local.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_per_connection.fetch_max(on_connection, Ordering::SeqCst);
        let overall = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(overall, Ordering::SeqCst);
        Self { local, counters }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.local.fetch_sub(1, Ordering::SeqCst);
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Fixed server configuration for tests.
pub struct StaticConfig {
    servers: HashMap<TargetServer, ServerConfig>,
}

impl StaticConfig {
    pub fn all_enabled() -> Self {
        Self {
            servers: TargetServer::ALL.into_iter().map(|target| (target, sample(target))).collect(),
        }
    }

    pub fn only(target: TargetServer) -> Self {
        let mut servers = HashMap::new();
        servers.insert(target, sample(target));
        let other = TargetServer::ALL
            .into_iter()
            .find(|candidate| *candidate != target)
            .unwrap_or(target);
        if other != target {
            let mut disabled = sample(other);
            disabled.enabled = false;
            servers.insert(other, disabled);
        }
        Self { servers }
    }
}

impl ServerConfigProvider for StaticConfig {
    fn server_config(&self, target: TargetServer) -> Option<ServerConfig> {
        self.servers.get(&target).cloned()
    }
}

fn sample(target: TargetServer) -> ServerConfig {
    let params = match target {
        TargetServer::RelationalServer => ConnectionParams::Relational(RelationalParams {
            host: "p21.test".to_string(),
            port: 1433,
            database: "P21".to_string(),
            username: "reader".to_string(),
            password: Some("secret".to_string()),
            trust_cert: true,
        }),
        TargetServer::FileDatabase => ConnectionParams::FileDatabase(FileDatabaseParams {
            path: "por.mdb".into(),
            odbc_driver: "Microsoft Access Driver (*.mdb, *.accdb)".to_string(),
            password: None,
        }),
    };
    ServerConfig { enabled: true, params }
}
