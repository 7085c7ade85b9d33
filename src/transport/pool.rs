//! Bounded pool of correlated connections to one endpoint.
//!
//! All bookkeeping lives in a single `PoolState` behind one mutex. Sockets are
//! opened and closed outside that lock; a `creating` counter reserves capacity
//! for connections still being opened so the pool never exceeds `max_size`.

use super::connection::Connection;
use super::connector::Connector;
use crate::error::{lock, HostlinkError, Result};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Pool sizing and timing policy
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    /// Connections older than this are closed once idle
    pub max_lifetime: Duration,
    /// Connections idle longer than this are closed
    pub max_idle: Duration,
    /// Attempts per connection, and consecutive failures before a
    /// connection is considered dead
    pub retry_limit: u32,
    pub retry_delay: Duration,
    pub maintenance_interval: Duration,
    /// Upper bound on waiting for a free connection
    pub acquire_timeout: Duration,
    /// Version stamped on outgoing requests
    pub api_version: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            max_lifetime: Duration::from_secs(3600),
            max_idle: Duration::from_secs(300),
            retry_limit: 3,
            retry_delay: Duration::from_millis(500),
            maintenance_interval: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(30),
            api_version: crate::protocol::API_VERSION.to_string(),
        }
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    /// Connections currently being opened
    pub creating: usize,
}

/// What one maintenance pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub evicted: usize,
    pub created: usize,
    pub failed: usize,
}

struct PoolEntry {
    conn: Arc<Connection>,
    busy: bool,
    last_used: Instant,
    /// Close on release instead of returning to the idle set
    retire: bool,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<u64, PoolEntry>,
    creating: usize,
    stopped: bool,
}

impl PoolState {
    fn reserved(&self) -> usize {
        self.entries.len() + self.creating
    }
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    released: Notify,
    next_id: AtomicU64,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

enum Checkout {
    Ready(Arc<Connection>),
    Create,
    Wait,
}

/// Shared handle to the pool. Clones refer to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, settings: PoolSettings) -> Result<Self> {
        if settings.max_size == 0 {
            return Err(HostlinkError::Connection(
                "pool maximum size must be at least 1".to_string(),
            ));
        }
        if settings.min_size > settings.max_size {
            return Err(HostlinkError::Connection(format!(
                "pool minimum size {} exceeds maximum size {}",
                settings.min_size, settings.max_size
            )));
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                settings,
                state: Mutex::new(PoolState::default()),
                released: Notify::new(),
                next_id: AtomicU64::new(1),
                maintenance: Mutex::new(None),
            }),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn endpoint(&self) -> String {
        self.inner.connector.endpoint()
    }

    /// Open connections up to the minimum size and start maintenance.
    ///
    /// Fails with a connection error if any of the minimum connections
    /// cannot be opened within the retry limit.
    pub async fn start(&self) -> Result<()> {
        let needed = {
            let mut state = lock(&self.inner.state);
            if state.stopped {
                return Err(HostlinkError::Closed("connection pool"));
            }
            let needed = self.inner.settings.min_size.saturating_sub(state.reserved());
            state.creating += needed;
            needed
        };

        let slots: Vec<CreatingSlot> = (0..needed)
            .map(|_| CreatingSlot::new(self.inner.clone()))
            .collect();
        let opened = futures::future::join_all((0..needed).map(|_| self.inner.open())).await;

        let mut first_error = None;
        for (slot, conn) in slots.into_iter().zip(opened) {
            match conn {
                Ok(conn) => {
                    slot.commit(conn, false)?;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.spawn_maintenance();

        tracing::info!(
            endpoint = %self.endpoint(),
            min = self.inner.settings.min_size,
            max = self.inner.settings.max_size,
            "connection pool started"
        );
        Ok(())
    }

    fn spawn_maintenance(&self) {
        let mut maintenance = lock(&self.inner.maintenance);
        if maintenance.is_some() {
            return;
        }

        let pool = Arc::downgrade(&self.inner);
        let period = self.inner.settings.maintenance_interval;
        *maintenance = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                let report = ConnectionPool { inner }.maintain().await;
                if report != MaintenanceReport::default() {
                    tracing::debug!(
                        evicted = report.evicted,
                        created = report.created,
                        failed = report.failed,
                        "pool maintenance pass"
                    );
                }
            }
        }));
    }

    /// Acquire a connection, waiting at most the configured acquire timeout
    pub async fn acquire(&self) -> Result<Lease> {
        self.acquire_timeout(self.inner.settings.acquire_timeout).await
    }

    /// Acquire a connection: an idle one if available, a new one if the pool
    /// has room, otherwise wait for a release until `timeout` elapses.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Lease> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before inspecting state so a release between
            // the check and the wait is not lost.
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.checkout()? {
                Checkout::Ready(conn) => {
                    tracing::debug!(connection = conn.id(), "connection checked out");
                    return Ok(Lease::new(conn, &self.inner));
                }
                Checkout::Create => {
                    let slot = CreatingSlot::new(self.inner.clone());
                    let conn = match tokio::time::timeout_at(deadline, self.inner.open()).await {
                        Ok(conn) => conn?,
                        Err(_) => return Err(acquire_timed_out(timeout)),
                    };
                    let conn = slot.commit(conn, true)?;
                    return Ok(Lease::new(conn, &self.inner));
                }
                Checkout::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        tracing::warn!(
                            timeout_ms = timeout.as_millis() as u64,
                            "timed out waiting for a pooled connection"
                        );
                        return Err(acquire_timed_out(timeout));
                    }
                }
            }
        }
    }

    /// Return a connection. Equivalent to dropping the lease.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    /// Evict expired idle connections, then replenish up to the minimum.
    /// Connections that are busy past their lifetime are closed on release.
    pub async fn maintain(&self) -> MaintenanceReport {
        let settings = &self.inner.settings;
        let mut report = MaintenanceReport::default();

        let (evicted, needed) = {
            let mut state = lock(&self.inner.state);
            if state.stopped {
                return report;
            }

            let mut evict = Vec::new();
            for (id, entry) in state.entries.iter_mut() {
                let expired = entry.conn.age() >= settings.max_lifetime;
                if entry.busy {
                    if expired {
                        entry.retire = true;
                    }
                } else if expired
                    || entry.last_used.elapsed() >= settings.max_idle
                    || entry.conn.is_terminal(settings.retry_limit)
                {
                    evict.push(*id);
                }
            }
            let evicted: Vec<Arc<Connection>> = evict
                .into_iter()
                .filter_map(|id| state.entries.remove(&id))
                .map(|entry| entry.conn)
                .collect();

            let needed = settings.min_size.saturating_sub(state.reserved());
            state.creating += needed;
            (evicted, needed)
        };

        for conn in evicted {
            tracing::debug!(connection = conn.id(), age_secs = conn.age().as_secs(), "evicting connection");
            conn.close();
            report.evicted += 1;
        }
        if report.evicted > 0 {
            self.inner.released.notify_one();
        }

        let slots: Vec<CreatingSlot> = (0..needed)
            .map(|_| CreatingSlot::new(self.inner.clone()))
            .collect();
        for slot in slots {
            match self.inner.open().await {
                Ok(conn) => match slot.commit(conn, false) {
                    Ok(_) => report.created += 1,
                    Err(_) => break,
                },
                Err(e) => {
                    tracing::warn!(error = %e, "failed to replenish pool");
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Stop maintenance and close every connection, idle or busy
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.inner.maintenance).take() {
            handle.abort();
        }

        let drained: Vec<Arc<Connection>> = {
            let mut state = lock(&self.inner.state);
            state.stopped = true;
            state.entries.drain().map(|(_, entry)| entry.conn).collect()
        };

        let count = drained.len();
        for conn in drained {
            conn.close();
        }
        self.inner.released.notify_waiters();

        tracing::info!(endpoint = %self.endpoint(), closed = count, "connection pool stopped");
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.inner.state).stopped
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.inner.state);
        let busy = state.entries.values().filter(|e| e.busy).count();
        PoolStats {
            total: state.entries.len(),
            idle: state.entries.len() - busy,
            busy,
            creating: state.creating,
        }
    }
}

fn acquire_timed_out(after: Duration) -> HostlinkError {
    HostlinkError::Timeout {
        id: "pool.acquire".to_string(),
        after,
    }
}

impl PoolInner {
    /// Open one connection, retrying with a fixed delay
    async fn open(&self) -> Result<Arc<Connection>> {
        let attempts = self.settings.retry_limit.max(1);
        let endpoint = self.connector.endpoint();
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.connector.connect().await {
                Ok(stream) => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    let conn = Connection::new(id, stream, self.settings.api_version.clone());
                    tracing::debug!(connection = id, peer = %conn.peer(), "connection opened");
                    return Ok(Arc::new(conn));
                }
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, attempt, attempts, error = %e, "connect failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.retry_delay).await;
                    }
                }
            }
        }

        Err(HostlinkError::Connection(format!(
            "could not connect to {} after {} attempts: {}",
            endpoint,
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn checkout(&self) -> Result<Checkout> {
        let limit = self.settings.retry_limit;
        let (checkout, dead) = {
            let mut state = lock(&self.state);
            if state.stopped {
                return Err(HostlinkError::Closed("connection pool"));
            }

            let mut dead = Vec::new();
            let mut ready = None;
            for (id, entry) in state.entries.iter_mut() {
                if entry.busy {
                    continue;
                }
                if entry.conn.is_terminal(limit) || entry.conn.age() >= self.settings.max_lifetime {
                    dead.push(*id);
                    continue;
                }
                entry.busy = true;
                entry.last_used = Instant::now();
                ready = Some(entry.conn.clone());
                break;
            }
            let dead: Vec<Arc<Connection>> = dead
                .into_iter()
                .filter_map(|id| state.entries.remove(&id))
                .map(|entry| entry.conn)
                .collect();

            let checkout = match ready {
                Some(conn) => Checkout::Ready(conn),
                None if state.reserved() < self.settings.max_size => {
                    state.creating += 1;
                    Checkout::Create
                }
                None => Checkout::Wait,
            };
            (checkout, dead)
        };

        for conn in dead {
            tracing::debug!(connection = conn.id(), "discarding dead idle connection");
            conn.close();
        }
        Ok(checkout)
    }

    fn check_in(&self, id: u64) {
        let retired = {
            let mut state = lock(&self.state);
            let stopped = state.stopped;
            let Some(entry) = state.entries.get_mut(&id) else {
                // Evicted while leased
                return;
            };
            if stopped || entry.retire || entry.conn.is_terminal(self.settings.retry_limit) {
                state.entries.remove(&id).map(|entry| entry.conn)
            } else {
                entry.busy = false;
                entry.last_used = Instant::now();
                None
            }
        };

        if let Some(conn) = retired {
            tracing::debug!(
                connection = conn.id(),
                closed = conn.is_closed(),
                errors = conn.consecutive_errors(),
                "closing connection on release"
            );
            conn.close();
        }
        self.released.notify_one();
    }
}

/// Capacity reserved for a connection being opened. Dropping it without
/// committing gives the capacity back.
struct CreatingSlot {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl CreatingSlot {
    fn new(pool: Arc<PoolInner>) -> Self {
        Self { pool, armed: true }
    }

    /// Move the new connection into the pool, busy or idle
    fn commit(mut self, conn: Arc<Connection>, busy: bool) -> Result<Arc<Connection>> {
        self.armed = false;
        let accepted = {
            let mut state = lock(&self.pool.state);
            state.creating -= 1;
            if state.stopped {
                false
            } else {
                state.entries.insert(
                    conn.id(),
                    PoolEntry {
                        conn: conn.clone(),
                        busy,
                        last_used: Instant::now(),
                        retire: false,
                    },
                );
                true
            }
        };

        if !accepted {
            conn.close();
            return Err(HostlinkError::Closed("connection pool"));
        }
        if !busy {
            self.pool.released.notify_one();
        }
        Ok(conn)
    }
}

impl Drop for CreatingSlot {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.pool.state).creating -= 1;
            self.pool.released.notify_one();
        }
    }
}

/// Exclusive use of one pooled connection. Returned to the pool on drop.
pub struct Lease {
    conn: Arc<Connection>,
    pool: Weak<PoolInner>,
}

impl Lease {
    fn new(conn: Arc<Connection>, pool: &Arc<PoolInner>) -> Self {
        Self {
            conn,
            pool: Arc::downgrade(pool),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }
}

impl Deref for Lease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        match self.pool.upgrade() {
            Some(pool) => pool.check_in(self.conn.id()),
            None => self.conn.close(),
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Lease").field(&self.conn.id()).finish()
    }
}
