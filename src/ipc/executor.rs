//! Host-side half of the cross-process bridge.

use super::queue::{HostEnd, QueueError};
use crate::protocol::{IpcRequest, IpcResponse};
use crate::tool::ToolRegistry;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs tool handlers for requests arriving on the host end of the bridge.
///
/// Every request gets exactly one response envelope. Handler errors and
/// panics become `{status: "error"}` envelopes.
pub struct HostExecutor {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HostExecutor {
    pub fn spawn(end: HostEnd, registry: Arc<ToolRegistry>) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = std::thread::Builder::new()
            .name("hostlink-executor".to_string())
            .spawn(move || run(end, registry, flag))?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop processing and wait for the thread to exit
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("executor thread panicked");
            }
        }
    }
}

impl Drop for HostExecutor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn run(end: HostEnd, registry: Arc<ToolRegistry>, running: Arc<AtomicBool>) {
    tracing::debug!("host executor started");

    while running.load(Ordering::SeqCst) {
        let request = match end.requests.pop(POLL_INTERVAL) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(QueueError::Disconnected) => {
                tracing::info!("request queue closed; executor exiting");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "request queue error");
                continue;
            }
        };

        let response = execute_request(&registry, request);
        match end.responses.push(response) {
            Ok(()) => {}
            Err(QueueError::Disconnected) => {
                tracing::info!("response queue closed; executor exiting");
                break;
            }
            Err(e) => tracing::warn!(error = %e, "failed to push response"),
        }
    }

    tracing::debug!("host executor stopped");
}

/// Dispatch one request through the registry and wrap the outcome
pub fn execute_request(registry: &ToolRegistry, request: IpcRequest) -> IpcResponse {
    let IpcRequest { id, tool, params } = request;

    if registry.get(&tool).is_none() {
        tracing::warn!(id = %id, tool = %tool, "request for unknown tool");
        return IpcResponse::failure(id, format!("Unknown tool: {}", tool));
    }

    let started = std::time::Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| registry.invoke(&tool, params)));
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(result)) => {
            tracing::debug!(id = %id, tool = %tool, elapsed_ms, "tool executed");
            IpcResponse::success(id, result)
        }
        Ok(Err(e)) => {
            tracing::warn!(id = %id, tool = %tool, error = %e, "tool failed");
            IpcResponse::failure(id, e.message)
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(id = %id, tool = %tool, panic = %message, "tool handler panicked");
            IpcResponse::failure(id, format!("handler panicked: {}", message))
        }
    }
}
