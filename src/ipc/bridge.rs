//! Server-side half of the cross-process bridge.
//!
//! Callers block on a per-request condition variable while a single listener
//! thread drains the response queue and signals the matching waiter.

use super::queue::{EnvelopeReceiver, EnvelopeSender, QueueError, ServerEnd};
use crate::error::{lock, HostlinkError, Result};
use crate::protocol::{IpcRequest, IpcResponse};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How long the listener waits on the queue before re-checking shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct WaitEntry {
    response: Option<IpcResponse>,
    signal: Arc<Condvar>,
}

type WaitingTable = Arc<Mutex<HashMap<String, WaitEntry>>>;

struct BridgeInner {
    requests: Box<dyn EnvelopeSender<IpcRequest>>,
    waiting: WaitingTable,
    running: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    default_timeout: Duration,
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Relays tool calls to the host executor and waits for their responses
#[derive(Clone)]
pub struct IpcBridge {
    inner: Arc<BridgeInner>,
}

impl IpcBridge {
    /// Take the server's queue ends and start the listener thread
    pub fn start(end: ServerEnd, default_timeout: Duration) -> std::io::Result<Self> {
        let ServerEnd {
            requests,
            responses,
        } = end;

        let waiting: WaitingTable = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        let listener = {
            let waiting = waiting.clone();
            let running = running.clone();
            std::thread::Builder::new()
                .name("hostlink-ipc-listener".to_string())
                .spawn(move || listen(responses, waiting, running))?
        };

        tracing::debug!("ipc bridge started");

        Ok(Self {
            inner: Arc::new(BridgeInner {
                requests,
                waiting,
                running,
                listener: Mutex::new(Some(listener)),
                default_timeout,
            }),
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Requests waiting for a response
    pub fn pending(&self) -> usize {
        lock(&self.inner.waiting).len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Send a request to the executor and block until its response arrives
    /// or `timeout` passes. Call only from a blocking context.
    pub fn send_to_executor(&self, tool: &str, params: Value, timeout: Duration) -> Result<Value> {
        if !self.is_running() {
            return Err(HostlinkError::Closed("ipc bridge"));
        }

        let signal = Arc::new(Condvar::new());
        let id = {
            let mut waiting = lock(&self.inner.waiting);
            let mut id = Uuid::new_v4().to_string();
            while waiting.contains_key(&id) {
                id = Uuid::new_v4().to_string();
            }
            waiting.insert(
                id.clone(),
                WaitEntry {
                    response: None,
                    signal: signal.clone(),
                },
            );
            id
        };

        let request = IpcRequest {
            id: id.clone(),
            tool: tool.to_string(),
            params,
        };
        if let Err(e) = self.inner.requests.push(request) {
            lock(&self.inner.waiting).remove(&id);
            return Err(HostlinkError::Connection(format!(
                "executor queue unavailable: {}",
                e
            )));
        }

        tracing::debug!(id = %id, tool = %tool, "ipc request queued");

        let deadline = Instant::now() + timeout;
        let mut waiting = lock(&self.inner.waiting);
        loop {
            match waiting.get_mut(&id) {
                Some(entry) => {
                    if let Some(response) = entry.response.take() {
                        waiting.remove(&id);
                        drop(waiting);
                        return response.into_result().map_err(HostlinkError::from);
                    }
                }
                None => return Err(HostlinkError::Closed("ipc bridge")),
            }

            let now = Instant::now();
            if now >= deadline {
                waiting.remove(&id);
                tracing::warn!(
                    id = %id,
                    tool = %tool,
                    timeout_ms = timeout.as_millis() as u64,
                    "ipc request timed out"
                );
                return Err(HostlinkError::Timeout { id, after: timeout });
            }

            let (guard, _) = signal
                .wait_timeout(waiting, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            waiting = guard;
        }
    }

    /// Async entry point. The blocking wait runs on the blocking pool.
    pub async fn call(&self, tool: &str, params: Value) -> Result<Value> {
        self.call_timeout(tool, params, self.inner.default_timeout)
            .await
    }

    pub async fn call_timeout(&self, tool: &str, params: Value, timeout: Duration) -> Result<Value> {
        let bridge = self.clone();
        let tool = tool.to_string();
        tokio::task::spawn_blocking(move || bridge.send_to_executor(&tool, params, timeout))
            .await
            .map_err(|e| HostlinkError::Connection(format!("ipc wait task failed: {}", e)))?
    }

    /// Stop the listener thread and reject new requests. Waits already in
    /// progress run to their own deadlines.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let handle = lock(&self.inner.listener).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("ipc listener thread panicked");
            }
            tracing::debug!("ipc bridge stopped");
        }
    }
}

fn listen(
    responses: Box<dyn EnvelopeReceiver<IpcResponse>>,
    waiting: WaitingTable,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match responses.pop(POLL_INTERVAL) {
            Ok(Some(response)) => deliver(&waiting, response),
            Ok(None) => {}
            Err(QueueError::Disconnected) => {
                tracing::warn!("executor disconnected; ipc listener exiting");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "ipc response queue error");
            }
        }
    }
}

fn deliver(waiting: &WaitingTable, response: IpcResponse) {
    let mut table = lock(waiting);
    match table.get_mut(&response.id) {
        Some(entry) => {
            let signal = entry.signal.clone();
            entry.response = Some(response);
            signal.notify_one();
        }
        None => {
            tracing::warn!(id = %response.id, "dropping ipc response with no waiter");
        }
    }
}
