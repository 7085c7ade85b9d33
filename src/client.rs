//! Client-side router: validates tool calls against the registry and sends
//! them to the relay server over pooled, correlated connections.

use crate::batch::{Batch, BatchScheduler};
use crate::config::Config;
use crate::error::{lock, HostlinkError, Result};
use crate::protocol::{BatchOutcome, ToolSchemaRecord, BATCH_COMMAND, LIST_TOOLS_COMMAND};
use crate::tool::ToolRegistry;
use crate::transport::{ConnectionPool, Connector};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Sends one correlated request on a pooled connection
#[derive(Clone)]
struct Dispatcher {
    pool: ConnectionPool,
    timeout: Duration,
}

impl Dispatcher {
    async fn send(&self, command: &str, params: Value) -> Result<Value> {
        let lease = self.pool.acquire().await?;
        let result = lease.send(command, params, self.timeout).await;
        self.pool.release(lease);
        result
    }

    async fn dispatch(&self, batch: Batch) -> Result<Vec<BatchOutcome>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let count = batch.len();
        let compressed = batch.compressed;
        let payload = serde_json::to_value(batch.into_payload())?;
        let reply = self.send(BATCH_COMMAND, payload).await?;
        let outcomes: Vec<BatchOutcome> = serde_json::from_value(reply)?;

        let failed = outcomes.iter().filter(|o| !o.success).count();
        tracing::info!(operations = count, failed, compressed, "batch dispatched");
        Ok(outcomes)
    }
}

struct Forwarder {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Entry point for callers: direct calls, queued calls and discovery
pub struct HostClient {
    registry: Arc<ToolRegistry>,
    pool: ConnectionPool,
    scheduler: BatchScheduler,
    dispatcher: Dispatcher,
    forwarder: Mutex<Option<Forwarder>>,
}

impl HostClient {
    /// Start the pool and the batch scheduler
    pub async fn connect(
        config: &Config,
        registry: Arc<ToolRegistry>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let pool = ConnectionPool::new(connector, config.pool_settings())?;
        pool.start().await?;

        let (scheduler, batches) = BatchScheduler::new(config.scheduler_settings());
        scheduler.start();

        let dispatcher = Dispatcher {
            pool: pool.clone(),
            timeout: config.request_timeout(),
        };

        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(forward_batches(dispatcher.clone(), batches, stopped));

        tracing::info!(endpoint = %pool.endpoint(), tools = registry.len(), "host client connected");

        Ok(Self {
            registry,
            pool,
            scheduler,
            dispatcher,
            forwarder: Mutex::new(Some(Forwarder { stop, task })),
        })
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    /// Validate and send one tool call, waiting for its result
    pub async fn execute(&self, tool: &str, params: Value) -> Result<Value> {
        let params = self.registry.apply_defaults(tool, params);
        self.registry.check(tool, &params)?;

        tracing::debug!(tool = %tool, "executing");
        self.dispatcher.send(tool, params).await
    }

    /// Validate a tool call and queue it for the next batch
    pub fn enqueue(
        &self,
        tool: &str,
        params: Value,
        priority: i32,
        depends_on: Vec<String>,
    ) -> Result<String> {
        let params = self.registry.apply_defaults(tool, params);
        self.registry.check(tool, &params)?;
        Ok(self.scheduler.add(tool, params, priority, depends_on)?)
    }

    /// Send a batch as one compound request
    pub async fn dispatch_batch(&self, batch: Batch) -> Result<Vec<BatchOutcome>> {
        self.dispatcher.dispatch(batch).await
    }

    /// Flush the scheduler now and dispatch the result
    pub async fn flush(&self) -> Result<Vec<BatchOutcome>> {
        let batch = self.scheduler.flush()?;
        self.dispatch_batch(batch).await
    }

    /// Tool records as the server sees them
    pub async fn list_remote_tools(&self) -> Result<Vec<ToolSchemaRecord>> {
        let reply = self
            .dispatcher
            .send(LIST_TOOLS_COMMAND, Value::Object(Default::default()))
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Stop the scheduler, dispatch everything still queued, then close the
    /// pool. Returns the outcomes of the final flush.
    pub async fn shutdown(&self) -> Result<Vec<BatchOutcome>> {
        let remaining = self.scheduler.stop();

        let forwarder = lock(&self.forwarder).take();
        if let Some(Forwarder { stop, task }) = forwarder {
            let _ = stop.send(());
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "batch forwarder ended abnormally");
            }
        }

        let outcomes = match remaining {
            Ok(batch) => self.dispatch_batch(batch).await,
            Err(e) => Err(HostlinkError::from(e)),
        };

        self.pool.stop();
        tracing::info!("host client shut down");
        outcomes
    }
}

async fn forward_batches(
    dispatcher: Dispatcher,
    mut batches: mpsc::UnboundedReceiver<Batch>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            batch = batches.recv() => match batch {
                Some(batch) => forward(&dispatcher, batch).await,
                None => return,
            },
            _ = &mut stop => break,
        }
    }

    // Drain what was emitted before the stop signal
    while let Ok(batch) = batches.try_recv() {
        forward(&dispatcher, batch).await;
    }
}

async fn forward(dispatcher: &Dispatcher, batch: Batch) {
    let count = batch.len();
    if let Err(e) = dispatcher.dispatch(batch).await {
        tracing::error!(operations = count, error = %e, "batch dispatch failed");
    }
}
