use super::{BackendConnection, BackendDriver, DriverError, Row, ServerConfigProvider};
use crate::models::{ErrorKind, TargetServer};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no enabled server configuration or driver for {0}")]
    ConfigurationMissing(TargetServer),
    #[error("connecting to {target} failed: {source}")]
    ConnectionFailed {
        target: TargetServer,
        #[source]
        source: DriverError,
    },
}

impl RouterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigurationMissing(_) => ErrorKind::ConfigurationMissing,
            Self::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Absent,
    Connecting,
    Ready,
}

const PHASE_ABSENT: u8 = 0;
const PHASE_CONNECTING: u8 = 1;
const PHASE_READY: u8 = 2;

/// Shared reference to the live connection of one target server.
///
/// Clones share the underlying connection. Handles for serialized targets
/// funnel every query through one lock so at most one statement is in flight
/// on the connection at a time. Both targets are serialized by default: the
/// tiberius client and the ODBC connection each run one statement at a time.
#[derive(Clone)]
pub struct ConnectionHandle {
    target: TargetServer,
    generation: u64,
    connection: Arc<dyn BackendConnection>,
    serial: Option<Arc<Mutex<()>>>,
    retired: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn target(&self) -> TargetServer {
        self.target
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_serialized(&self) -> bool {
        self.serial.is_some()
    }

    /// Set once the router has dropped this connection from its slot.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Runs `sql` once this handle's turn on the connection comes up. `limit`
    /// starts after the turn is held, so waiting behind other statements never
    /// counts against it.
    pub async fn query(&self, sql: &str, limit: Duration) -> Result<Result<Vec<Row>, DriverError>, Elapsed> {
        let _turn = match &self.serial {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        if self.is_retired() {
            return Ok(Err(DriverError::new(
                ErrorKind::ConnectionError,
                "connection was discarded while the statement waited",
            )));
        }
        let result = tokio::time::timeout(limit, self.connection.query(sql)).await;
        if result.is_err() {
            // before the turn is released, so nothing queued runs on it
            self.retire();
        }
        result
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    fn same_connection(&self, other: &ConnectionHandle) -> bool {
        self.generation == other.generation && self.target == other.target
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("target", &self.target)
            .field("generation", &self.generation)
            .field("serialized", &self.serial.is_some())
            .finish()
    }
}

// ─── Connection cache ───────────────────────────────────────────────────────

struct Slot {
    handle: Mutex<Option<ConnectionHandle>>,
    phase: AtomicU8,
}

impl Slot {
    fn new() -> Self {
        Self {
            handle: Mutex::new(None),
            phase: AtomicU8::new(PHASE_ABSENT),
        }
    }

    fn set_phase(&self, phase: u8) {
        self.phase.store(phase, Ordering::SeqCst);
    }
}

/// One slot per target server. Owned by a single router and dropped with it.
pub struct ConnectionCache {
    slots: HashMap<TargetServer, Slot>,
    next_generation: AtomicU64,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self {
            slots: TargetServer::ALL.into_iter().map(|target| (target, Slot::new())).collect(),
            next_generation: AtomicU64::new(1),
        }
    }

    fn slot(&self, target: TargetServer) -> Option<&Slot> {
        self.slots.get(&target)
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for ConnectionCache {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Router ─────────────────────────────────────────────────────────────────

pub struct ConnectionRouter {
    config: Arc<dyn ServerConfigProvider>,
    drivers: HashMap<TargetServer, Arc<dyn BackendDriver>>,
    serialized: HashSet<TargetServer>,
    cache: ConnectionCache,
}

impl ConnectionRouter {
    /// Every target is serialized per connection unless overridden.
    pub fn new(config: Arc<dyn ServerConfigProvider>) -> Self {
        Self {
            config,
            drivers: HashMap::new(),
            serialized: TargetServer::ALL.into_iter().collect(),
            cache: ConnectionCache::new(),
        }
    }

    pub fn with_driver(mut self, target: TargetServer, driver: Arc<dyn BackendDriver>) -> Self {
        self.drivers.insert(target, driver);
        self
    }

    pub fn with_serialized(mut self, target: TargetServer, serialized: bool) -> Self {
        if serialized {
            self.serialized.insert(target);
        } else {
            self.serialized.remove(&target);
        }
        self
    }

    pub fn has_driver(&self, target: TargetServer) -> bool {
        self.drivers.contains_key(&target)
    }

    /// Returns the cached handle for `target`, connecting first when the slot
    /// is empty. Concurrent callers for the same target wait on the slot lock,
    /// so only one connect is ever in flight per target.
    pub async fn acquire(&self, target: TargetServer) -> Result<ConnectionHandle, RouterError> {
        let config = self
            .config
            .server_config(target)
            .filter(|config| config.enabled)
            .ok_or(RouterError::ConfigurationMissing(target))?;
        let driver = self
            .drivers
            .get(&target)
            .cloned()
            .ok_or(RouterError::ConfigurationMissing(target))?;
        let slot = self
            .cache
            .slot(target)
            .ok_or(RouterError::ConfigurationMissing(target))?;

        let mut cached = slot.handle.lock().await;
        if let Some(handle) = cached.as_ref() {
            if !handle.is_retired() {
                return Ok(handle.clone());
            }
        }
        if let Some(stale) = cached.take() {
            tracing::info!(target = %target, generation = stale.generation, "replacing retired backend connection");
            tokio::spawn(async move { close_quietly(&stale).await });
        }

        slot.set_phase(PHASE_CONNECTING);
        tracing::info!(target = %target, "opening backend connection");
        match driver.connect(&config.params).await {
            Ok(connection) => {
                let handle = ConnectionHandle {
                    target,
                    generation: self.cache.next_generation(),
                    connection: Arc::from(connection),
                    serial: self
                        .serialized
                        .contains(&target)
                        .then(|| Arc::new(Mutex::new(()))),
                    retired: Arc::new(AtomicBool::new(false)),
                };
                *cached = Some(handle.clone());
                slot.set_phase(PHASE_READY);
                tracing::debug!(target = %target, generation = handle.generation, "backend connection ready");
                Ok(handle)
            }
            Err(error) => {
                slot.set_phase(PHASE_ABSENT);
                tracing::warn!(target = %target, error_kind = %error.kind, error = %error, "backend connection failed");
                Err(RouterError::ConnectionFailed { target, source: error })
            }
        }
    }

    /// Discards the cached connection if it is still the one `handle` refers
    /// to. A handle from an older generation leaves a newer connection alone.
    pub async fn invalidate(&self, handle: &ConnectionHandle) -> bool {
        match self.evict(handle).await {
            Some(discarded) => {
                close_quietly(&discarded).await;
                true
            }
            None => false,
        }
    }

    /// Like [`invalidate`](Self::invalidate) but never waits for the close.
    /// A statement that outlived its timeout may still hold the connection,
    /// so the close runs on its own task and finishes whenever the backend
    /// lets go.
    pub async fn discard(&self, handle: &ConnectionHandle) -> bool {
        match self.evict(handle).await {
            Some(discarded) => {
                tokio::spawn(async move { close_quietly(&discarded).await });
                true
            }
            None => false,
        }
    }

    async fn evict(&self, handle: &ConnectionHandle) -> Option<ConnectionHandle> {
        let slot = self.cache.slot(handle.target)?;
        let mut cached = slot.handle.lock().await;
        let current = cached
            .as_ref()
            .is_some_and(|existing| existing.same_connection(handle));
        if !current {
            return None;
        }
        let discarded = cached.take();
        slot.set_phase(PHASE_ABSENT);
        tracing::info!(target = %handle.target, generation = handle.generation, "discarding backend connection");
        discarded.inspect(ConnectionHandle::retire)
    }

    /// Unconditionally drops the cached connection for `target`.
    pub async fn close(&self, target: TargetServer) {
        let Some(slot) = self.cache.slot(target) else {
            return;
        };
        let discarded = slot.handle.lock().await.take();
        slot.set_phase(PHASE_ABSENT);
        if let Some(discarded) = discarded {
            discarded.retire();
            tracing::info!(target = %target, generation = discarded.generation, "closing backend connection");
            close_quietly(&discarded).await;
        }
    }

    pub fn slot_state(&self, target: TargetServer) -> SlotState {
        let Some(slot) = self.cache.slot(target) else {
            return SlotState::Absent;
        };
        match slot.handle.try_lock() {
            Ok(cached) if cached.is_some() => SlotState::Ready,
            Ok(_) => SlotState::Absent,
            Err(_) => match slot.phase.load(Ordering::SeqCst) {
                PHASE_CONNECTING => SlotState::Connecting,
                PHASE_READY => SlotState::Ready,
                _ => SlotState::Absent,
            },
        }
    }

    pub async fn shutdown(&self) {
        for target in TargetServer::ALL {
            self.close(target).await;
        }
    }
}

async fn close_quietly(handle: &ConnectionHandle) {
    if let Err(error) = handle.connection.close().await {
        tracing::debug!(target = %handle.target, error = %error, "backend close reported an error");
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionRouter, RouterError, SlotState};
    use crate::connection::testing::{FakeDriver, StaticConfig};
    use crate::models::{ErrorKind, TargetServer};
    use std::sync::Arc;
    use std::time::Duration;

    fn router(driver: Arc<FakeDriver>, config: StaticConfig) -> Arc<ConnectionRouter> {
        Arc::new(
            ConnectionRouter::new(Arc::new(config))
                .with_driver(TargetServer::RelationalServer, driver.clone())
                .with_driver(TargetServer::FileDatabase, driver),
        )
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_connect() {
        let driver = Arc::new(FakeDriver::new().with_connect_delay(Duration::from_millis(50)));
        let router = router(driver.clone(), StaticConfig::all_enabled());

        let (first, second) = tokio::join!(
            router.acquire(TargetServer::FileDatabase),
            router.acquire(TargetServer::FileDatabase)
        );
        let first = first.expect("first acquire");
        let second = second.expect("second acquire");

        assert_eq!(driver.connect_count(), 1);
        assert_eq!(first.generation(), second.generation());
        assert!(first.is_serialized());
        assert_eq!(router.slot_state(TargetServer::FileDatabase), SlotState::Ready);
    }

    #[tokio::test]
    async fn slot_reports_connecting_while_connect_is_pending() {
        let driver = Arc::new(FakeDriver::new().with_connect_delay(Duration::from_millis(200)));
        let router = router(driver, StaticConfig::all_enabled());
        assert_eq!(router.slot_state(TargetServer::RelationalServer), SlotState::Absent);

        let pending = {
            let router = router.clone();
            tokio::spawn(async move { router.acquire(TargetServer::RelationalServer).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(router.slot_state(TargetServer::RelationalServer), SlotState::Connecting);

        pending.await.expect("join").expect("acquire");
        assert_eq!(router.slot_state(TargetServer::RelationalServer), SlotState::Ready);
    }

    #[tokio::test]
    async fn disabled_or_unregistered_target_is_configuration_missing() {
        let driver = Arc::new(FakeDriver::new());
        let router = router(driver.clone(), StaticConfig::only(TargetServer::RelationalServer));
        let err = router.acquire(TargetServer::FileDatabase).await.expect_err("disabled");
        assert_eq!(err.kind(), ErrorKind::ConfigurationMissing);

        let bare = ConnectionRouter::new(Arc::new(StaticConfig::all_enabled()));
        let err = bare.acquire(TargetServer::RelationalServer).await.expect_err("no driver");
        assert!(matches!(err, RouterError::ConfigurationMissing(TargetServer::RelationalServer)));
        assert_eq!(driver.connect_count(), 0);
    }

    #[tokio::test]
    async fn failed_connect_is_not_cached() {
        let driver = Arc::new(FakeDriver::new().fail_connects(1));
        let router = router(driver.clone(), StaticConfig::all_enabled());

        let err = router.acquire(TargetServer::RelationalServer).await.expect_err("first connect fails");
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert!(err.to_string().contains("login refused"));
        assert_eq!(router.slot_state(TargetServer::RelationalServer), SlotState::Absent);

        router.acquire(TargetServer::RelationalServer).await.expect("retry connects from scratch");
        assert_eq!(driver.connect_count(), 2);
    }

    #[tokio::test]
    async fn stale_handle_cannot_invalidate_newer_connection() {
        let driver = Arc::new(FakeDriver::new());
        let router = router(driver.clone(), StaticConfig::all_enabled());

        let old = router.acquire(TargetServer::RelationalServer).await.expect("acquire");
        assert!(router.invalidate(&old).await);
        let fresh = router.acquire(TargetServer::RelationalServer).await.expect("reacquire");
        assert_ne!(old.generation(), fresh.generation());

        assert!(!router.invalidate(&old).await);
        assert_eq!(router.slot_state(TargetServer::RelationalServer), SlotState::Ready);
        assert_eq!(driver.connect_count(), 2);
        assert_eq!(driver.close_count(), 1);
    }

    #[tokio::test]
    async fn discard_returns_before_a_stuck_close_finishes() {
        let driver = Arc::new(FakeDriver::new().with_close_delay(Duration::from_secs(3600)));
        let router = router(driver.clone(), StaticConfig::all_enabled());
        let handle = router.acquire(TargetServer::FileDatabase).await.expect("acquire");

        let discarded = tokio::time::timeout(Duration::from_secs(1), router.discard(&handle))
            .await
            .expect("discard does not wait for close");
        assert!(discarded);
        assert_eq!(router.slot_state(TargetServer::FileDatabase), SlotState::Absent);
        assert!(!router.discard(&handle).await);

        let fresh = router.acquire(TargetServer::FileDatabase).await.expect("reacquire");
        assert_ne!(fresh.generation(), handle.generation());
        assert!(handle.is_retired());
        assert!(!fresh.is_retired());
    }

    #[tokio::test]
    async fn queued_statements_do_not_spend_their_limit_waiting() {
        let driver = Arc::new(FakeDriver::new().with_query_delay(Duration::from_millis(150)));
        let router = router(driver.clone(), StaticConfig::all_enabled());
        let handle = router.acquire(TargetServer::RelationalServer).await.expect("acquire");
        assert!(handle.is_serialized());

        let limit = Duration::from_millis(250);
        let (first, second, third) = tokio::join!(
            handle.query("SELECT 1", limit),
            handle.query("SELECT 2", limit),
            handle.query("SELECT 3", limit)
        );
        for outcome in [first, second, third] {
            outcome.expect("within limit").expect("rows");
        }
        assert_eq!(driver.max_per_connection(), 1);
    }

    #[tokio::test]
    async fn unserialized_target_runs_statements_side_by_side() {
        let driver = Arc::new(FakeDriver::new().with_query_delay(Duration::from_millis(100)));
        let router = Arc::new(
            ConnectionRouter::new(Arc::new(StaticConfig::all_enabled()))
                .with_driver(TargetServer::RelationalServer, driver.clone())
                .with_serialized(TargetServer::RelationalServer, false),
        );
        let handle = router.acquire(TargetServer::RelationalServer).await.expect("acquire");
        assert!(!handle.is_serialized());

        let limit = Duration::from_secs(1);
        let (first, second) = tokio::join!(handle.query("SELECT 1", limit), handle.query("SELECT 2", limit));
        first.expect("within limit").expect("rows");
        second.expect("within limit").expect("rows");
        assert_eq!(driver.max_per_connection(), 2);
    }

    #[tokio::test]
    async fn shutdown_closes_every_cached_connection() {
        let driver = Arc::new(FakeDriver::new());
        let router = router(driver.clone(), StaticConfig::all_enabled());
        router.acquire(TargetServer::RelationalServer).await.expect("p21");
        router.acquire(TargetServer::FileDatabase).await.expect("por");

        router.shutdown().await;
        assert_eq!(driver.close_count(), 2);
        for target in TargetServer::ALL {
            assert_eq!(router.slot_state(target), SlotState::Absent);
        }
    }
}
