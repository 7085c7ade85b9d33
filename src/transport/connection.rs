use super::connector::TransportStream;
use super::correlator::Correlator;
use crate::error::{HostlinkError, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// A pooled connection: one correlated stream plus the bookkeeping the pool
/// needs to decide whether it is still worth keeping.
pub struct Connection {
    id: u64,
    created_at: Instant,
    correlator: Correlator,
    consecutive_errors: AtomicU32,
}

impl Connection {
    pub fn new(id: u64, stream: TransportStream, version: impl Into<String>) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            correlator: Correlator::new(stream, version),
            consecutive_errors: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        self.correlator.peer()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.correlator.is_closed()
    }

    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    /// Correlated request. Transport-level failures count against the
    /// connection; a remote error is a healthy round trip.
    pub async fn send(&self, command: &str, params: Value, timeout: Duration) -> Result<Value> {
        let result = self.correlator.send(command, params, timeout).await;
        match &result {
            Ok(_) | Err(HostlinkError::Remote { .. }) => {
                self.consecutive_errors.store(0, Ordering::SeqCst);
            }
            Err(HostlinkError::Connection(_))
            | Err(HostlinkError::Timeout { .. })
            | Err(HostlinkError::Protocol(_)) => {
                self.consecutive_errors.fetch_add(1, Ordering::SeqCst);
            }
            Err(_) => {}
        }
        result
    }

    /// Closed, or failed `limit` times in a row
    pub(crate) fn is_terminal(&self, limit: u32) -> bool {
        self.is_closed() || self.consecutive_errors() >= limit.max(1)
    }

    pub fn close(&self) {
        self.correlator.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer())
            .field("closed", &self.is_closed())
            .finish()
    }
}
