use super::ordering::{closes_cycle, order_operations, Operation};
use crate::error::{lock, ValidationError};
use crate::protocol::{BatchItem, BatchPayload};
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    /// Buffer length that triggers an immediate flush
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    /// Serialized size above which a batch is marked compressed
    pub compression_threshold: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            flush_interval: Duration::from_secs(1),
            compression_threshold: 1024,
        }
    }
}

/// The ordered output of one flush
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub operations: Vec<BatchItem>,
    pub compressed: bool,
    /// Serialized payload size in bytes
    pub encoded_len: usize,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.operations.iter().map(|op| op.id.as_str()).collect()
    }

    pub fn into_payload(self) -> BatchPayload {
        BatchPayload::new(self.operations, self.compressed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub pending_operations: usize,
    /// Ids handed out so far
    pub operation_counter: u64,
}

#[derive(Default)]
struct SchedulerState {
    buffer: Vec<Operation>,
    counter: u64,
}

struct SchedulerInner {
    settings: SchedulerSettings,
    state: Mutex<SchedulerState>,
    outlet: mpsc::UnboundedSender<Batch>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

/// Buffers operations and emits them as dependency-ordered batches.
///
/// Batches produced by a full buffer or by the auto-flush timer go to the
/// outlet returned from [`BatchScheduler::new`]. `flush` and `stop` hand
/// their batch straight back to the caller.
#[derive(Clone)]
pub struct BatchScheduler {
    inner: Arc<SchedulerInner>,
}

impl BatchScheduler {
    pub fn new(settings: SchedulerSettings) -> (Self, mpsc::UnboundedReceiver<Batch>) {
        let (outlet, batches) = mpsc::unbounded_channel();
        let scheduler = Self {
            inner: Arc::new(SchedulerInner {
                settings,
                state: Mutex::new(SchedulerState::default()),
                outlet,
                flusher: Mutex::new(None),
            }),
        };
        (scheduler, batches)
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// Buffer one operation and return its id.
    ///
    /// An operation whose dependencies would close a cycle with what is
    /// already buffered is rejected and the buffer is left as it was. When the
    /// buffer reaches the maximum batch size it is flushed before this
    /// returns and the batch goes to the outlet.
    pub fn add(
        &self,
        command: impl Into<String>,
        params: Value,
        priority: i32,
        depends_on: Vec<String>,
    ) -> Result<String, ValidationError> {
        let (id, full_batch) = {
            let mut state = lock(&self.inner.state);
            let sequence = state.counter;
            state.counter += 1;

            let id = format!("op_{}", sequence);
            if closes_cycle(&state.buffer, &id, &depends_on) {
                tracing::warn!(id = %id, depends_on = ?depends_on, "rejecting operation that closes a dependency cycle");
                return Err(ValidationError::new(
                    id.clone(),
                    format!("dependency cycle detected at operation {}", id),
                ));
            }
            state.buffer.push(Operation {
                id: id.clone(),
                command: command.into(),
                params,
                priority,
                depends_on,
                created_at: chrono::Utc::now(),
                sequence,
            });

            let full_batch = if state.buffer.len() >= self.inner.settings.max_batch_size {
                Some(self.inner.take_batch(&mut state)?)
            } else {
                None
            };
            (id, full_batch)
        };

        if let Some(batch) = full_batch {
            tracing::debug!(operations = batch.len(), "batch size limit reached");
            self.inner.emit(batch);
        }
        Ok(id)
    }

    /// Order and drain the buffer. An empty buffer gives an empty batch.
    pub fn flush(&self) -> Result<Batch, ValidationError> {
        let mut state = lock(&self.inner.state);
        self.inner.take_batch(&mut state)
    }

    /// Start the auto-flush timer
    pub fn start(&self) {
        let mut flusher = lock(&self.inner.flusher);
        if flusher.is_some() {
            return;
        }

        let scheduler = Arc::downgrade(&self.inner);
        let period = self.inner.settings.flush_interval;
        *flusher = Some(tokio::spawn(auto_flush(scheduler, period)));

        tracing::info!(
            max_batch_size = self.inner.settings.max_batch_size,
            flush_interval_ms = period.as_millis() as u64,
            "batch scheduler started"
        );
    }

    /// Stop the timer and return whatever was still buffered
    pub fn stop(&self) -> Result<Batch, ValidationError> {
        if let Some(handle) = lock(&self.inner.flusher).take() {
            handle.abort();
        }
        let batch = self.flush();
        tracing::info!("batch scheduler stopped");
        batch
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = lock(&self.inner.state);
        SchedulerStats {
            pending_operations: state.buffer.len(),
            operation_counter: state.counter,
        }
    }
}

impl SchedulerInner {
    fn take_batch(&self, state: &mut SchedulerState) -> Result<Batch, ValidationError> {
        if state.buffer.is_empty() {
            return Ok(Batch::default());
        }

        let buffered = std::mem::take(&mut state.buffer);
        let ids: Vec<String> = buffered.iter().map(|op| op.id.clone()).collect();
        let ordered = order_operations(buffered).map_err(|e| {
            tracing::error!(dropped = ?ids, error = %e, "rejecting batch");
            e
        })?;

        let operations: Vec<BatchItem> = ordered
            .into_iter()
            .map(|op| BatchItem {
                id: op.id,
                command: op.command,
                params: op.params,
            })
            .collect();

        let encoded_len = serde_json::to_vec(&BatchPayload::new(operations.clone(), false))
            .map(|bytes| bytes.len())
            .unwrap_or_default();

        Ok(Batch {
            operations,
            compressed: encoded_len > self.settings.compression_threshold,
            encoded_len,
        })
    }

    fn emit(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        if self.outlet.send(batch).is_err() {
            tracing::warn!(operations = count, "batch outlet closed; dropping batch");
        }
    }
}

async fn auto_flush(scheduler: Weak<SchedulerInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = scheduler.upgrade() else {
            break;
        };

        let flushed = {
            let mut state = lock(&inner.state);
            inner.take_batch(&mut state)
        };
        match flushed {
            Ok(batch) if !batch.is_empty() => {
                tracing::debug!(operations = batch.len(), compressed = batch.compressed, "auto flush");
                inner.emit(batch);
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "auto flush failed"),
        }
    }
}
