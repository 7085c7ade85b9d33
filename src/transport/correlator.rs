//! Request/response correlation over one transport stream.
//!
//! Requests are written as newline-delimited [`WireRequest`] frames. A single
//! reader task per stream decodes [`WireResponse`] frames and resolves the
//! waiter registered under the frame's id, so responses may arrive in any
//! order.

use super::connector::{FrameReader, FrameWriter, TransportStream};
use crate::error::{lock, HostlinkError, Result};
use crate::protocol::{decode_frame, encode_frame, WireRequest, WireResponse};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// One outstanding call
struct PendingRequest {
    command: String,
    created_at: Instant,
    reply: oneshot::Sender<Result<Value>>,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingRequest>>>;

pub struct Correlator {
    peer: String,
    version: String,
    writer: tokio::sync::Mutex<FrameWriter>,
    pending: PendingTable,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Correlator {
    /// Take ownership of a stream and start its reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(stream: TransportStream, version: impl Into<String>) -> Self {
        let TransportStream {
            reader,
            writer,
            peer,
        } = stream;

        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            reader,
            pending.clone(),
            closed.clone(),
            peer.clone(),
        ));

        Self {
            peer,
            version: version.into(),
            writer: tokio::sync::Mutex::new(writer),
            pending,
            closed,
            reader,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// The reader loop has ended or `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Send one request and wait for the response carrying the same id.
    ///
    /// Exactly one outcome reaches the caller: the response, a timeout, or a
    /// transport failure. `timeout` bounds the whole call, including waiting
    /// for the writer and the write itself. When the call ends without a
    /// response, or its future is dropped, the pending entry is gone, so a
    /// late response is dropped by the reader.
    pub async fn send(&self, command: &str, params: Value, timeout: Duration) -> Result<Value> {
        if self.is_closed() {
            return Err(HostlinkError::Connection(format!(
                "connection to {} is closed",
                self.peer
            )));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let (tx, mut rx) = oneshot::channel();
        let id = {
            let mut pending = lock(&self.pending);
            let mut id = Uuid::new_v4().to_string();
            while pending.contains_key(&id) {
                id = Uuid::new_v4().to_string();
            }
            pending.insert(
                id.clone(),
                PendingRequest {
                    command: command.to_string(),
                    created_at: Instant::now(),
                    reply: tx,
                },
            );
            id
        };
        let mut guard = PendingGuard {
            correlator: self,
            id: id.clone(),
            writing: false,
        };

        let request = WireRequest {
            id: id.clone(),
            command: command.to_string(),
            params,
            version: self.version.clone(),
        };
        let frame = encode_frame(&request)?;

        let mut writer = match tokio::time::timeout_at(deadline, self.writer.lock()).await {
            Ok(writer) => writer,
            Err(_) => {
                tracing::warn!(id = %id, command = %command, "timed out waiting for the writer");
                return Err(HostlinkError::Timeout { id, after: timeout });
            }
        };

        guard.writing = true;
        let written = tokio::time::timeout_at(deadline, async {
            writer.write_all(&frame).await?;
            writer.flush().await
        })
        .await;
        guard.writing = false;
        drop(writer);

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(peer = %self.peer, error = %e, "write failed");
                return Err(HostlinkError::Connection(format!(
                    "write to {} failed: {}",
                    self.peer, e
                )));
            }
            Err(_) => {
                // A partial frame may be on the wire; the stream is unusable.
                tracing::warn!(id = %id, command = %command, peer = %self.peer, "write timed out");
                drop(guard);
                self.close();
                return Err(HostlinkError::Timeout { id, after: timeout });
            }
        }

        tracing::debug!(id = %id, command = %command, peer = %self.peer, "request sent");

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HostlinkError::Connection(format!(
                "connection to {} dropped before a response arrived",
                self.peer
            ))),
            Err(_) => {
                // The reader removes and replies under the same lock, so either
                // the entry is still here or the reply is already in `rx`.
                if guard.remove() {
                    tracing::warn!(
                        id = %id,
                        command = %command,
                        timeout_ms = timeout.as_millis() as u64,
                        "request timed out"
                    );
                    return Err(HostlinkError::Timeout { id, after: timeout });
                }
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(HostlinkError::Timeout { id, after: timeout }),
                }
            }
        }
    }

    /// Stop the reader and fail every outstanding request
    pub fn close(&self) {
        self.reader.abort();
        self.closed.store(true, Ordering::SeqCst);
        fail_pending(&self.pending, &self.peer);
    }
}

/// Removes the pending entry when `send` ends early or is cancelled. A send
/// dropped in the middle of a write leaves a partial frame behind, so the
/// correlator is closed as well.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: String,
    writing: bool,
}

impl PendingGuard<'_> {
    /// True when the entry was still waiting
    fn remove(&self) -> bool {
        lock(&self.correlator.pending).remove(&self.id).is_some()
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.remove() {
            tracing::debug!(id = %self.id, "pending request abandoned");
        }
        if self.writing {
            tracing::warn!(peer = %self.correlator.peer, "send cancelled mid-write");
            self.correlator.close();
        }
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(reader: FrameReader, pending: PendingTable, closed: Arc<AtomicBool>, peer: String) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_frame::<WireResponse>(&line) {
                    Ok(response) => resolve(&pending, response),
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "dropping undecodable frame");
                    }
                }
            }
            Ok(None) => {
                tracing::debug!(peer = %peer, "peer closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "read failed");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    fail_pending(&pending, &peer);
}

fn resolve(pending: &PendingTable, response: WireResponse) {
    let mut table = lock(pending);
    match table.remove(&response.id) {
        Some(request) => {
            tracing::debug!(
                id = %response.id,
                command = %request.command,
                elapsed_ms = request.created_at.elapsed().as_millis() as u64,
                "response matched"
            );
            // The caller may have given up between removal and here; nothing to do then.
            let _ = request.reply.send(response.into_result());
        }
        None => {
            tracing::warn!(id = %response.id, "dropping response with no pending request");
        }
    }
}

fn fail_pending(pending: &PendingTable, peer: &str) {
    let drained: Vec<(String, PendingRequest)> = lock(pending).drain().collect();
    for (id, request) in drained {
        tracing::debug!(id = %id, command = %request.command, "failing request on closed connection");
        let _ = request.reply.send(Err(HostlinkError::Connection(format!(
            "connection to {} closed",
            peer
        ))));
    }
}
