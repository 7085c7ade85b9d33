//! Blocking FIFO queues that carry IPC envelopes between the relay server and
//! the host executor.
//!
//! Two backings: in-process channels, and newline-delimited JSON over any
//! blocking byte stream (a `UnixStream` pair, a child's stdio).

use crate::protocol::{IpcRequest, IpcResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::marker::PhantomData;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue peer disconnected")]
    Disconnected,

    #[error("queue I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("envelope could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("queue peer stopped reading")]
    Stalled,
}

/// Write timeout applied to the sockets made by [`stream_pair`]
pub const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Producer end of a queue.
///
/// In-process queues are unbounded and `push` returns at once. Stream-backed
/// senders block while the peer is not reading, for at most the stream's own
/// write timeout when it has one.
pub trait EnvelopeSender<T>: Send + Sync {
    fn push(&self, envelope: T) -> Result<(), QueueError>;
}

/// Consumer end of a queue
pub trait EnvelopeReceiver<T>: Send {
    /// Wait up to `timeout` for the next envelope. `Ok(None)` means the
    /// deadline passed with nothing queued.
    fn pop(&self, timeout: Duration) -> Result<Option<T>, QueueError>;
}

pub struct MemorySender<T> {
    tx: Sender<T>,
}

impl<T: Send> EnvelopeSender<T> for MemorySender<T> {
    fn push(&self, envelope: T) -> Result<(), QueueError> {
        self.tx.send(envelope).map_err(|_| QueueError::Disconnected)
    }
}

pub struct MemoryReceiver<T> {
    rx: Receiver<T>,
}

impl<T: Send> EnvelopeReceiver<T> for MemoryReceiver<T> {
    fn pop(&self, timeout: Duration) -> Result<Option<T>, QueueError> {
        match self.rx.recv_timeout(timeout) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(QueueError::Disconnected),
        }
    }
}

/// Unbounded in-process queue
pub fn memory_queue<T>() -> (MemorySender<T>, MemoryReceiver<T>) {
    let (tx, rx) = mpsc::channel();
    (MemorySender { tx }, MemoryReceiver { rx })
}

struct StreamWriter {
    inner: Box<dyn Write + Send>,
    /// Set after a failed write; a partial line may be on the stream
    broken: bool,
}

/// Writes one JSON object per line to a byte stream
pub struct StreamSender<T> {
    writer: Mutex<StreamWriter>,
    _envelope: PhantomData<fn(T)>,
}

impl<T> StreamSender<T> {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(StreamWriter {
                inner: Box::new(writer),
                broken: false,
            }),
            _envelope: PhantomData,
        }
    }
}

impl<T: Serialize> EnvelopeSender<T> for StreamSender<T> {
    fn push(&self, envelope: T) -> Result<(), QueueError> {
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');

        let mut writer = crate::error::lock(&self.writer);
        if writer.broken {
            return Err(QueueError::Disconnected);
        }

        let written = writer
            .inner
            .write_all(&line)
            .and_then(|()| writer.inner.flush());
        written.map_err(|e| {
            writer.broken = true;
            tracing::warn!(error = %e, "ipc stream write failed");
            classify_write_error(e)
        })
    }
}

fn classify_write_error(err: io::Error) -> QueueError {
    match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => QueueError::Disconnected,
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => QueueError::Stalled,
        _ => QueueError::Io(err),
    }
}

/// Reads envelopes from a byte stream.
///
/// A pump thread decodes lines into an in-process queue so `pop` can honour
/// its deadline. Undecodable lines are logged and skipped. End of stream
/// surfaces as [`QueueError::Disconnected`] once the queue drains.
pub struct StreamReceiver<T> {
    queue: MemoryReceiver<T>,
}

impl<T: DeserializeOwned + Send + 'static> StreamReceiver<T> {
    pub fn spawn(reader: impl Read + Send + 'static, name: &str) -> io::Result<Self> {
        let (tx, queue) = memory_queue();
        let label = name.to_string();

        std::thread::Builder::new()
            .name(format!("hostlink-{}", name))
            .spawn(move || {
                for line in BufReader::new(reader).lines() {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            tracing::debug!(queue = %label, error = %e, "ipc stream read failed");
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<T>(&line) {
                        Ok(envelope) => {
                            if tx.push(envelope).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(queue = %label, error = %e, "dropping undecodable envelope");
                        }
                    }
                }
                tracing::debug!(queue = %label, "ipc stream closed");
            })?;

        Ok(Self { queue })
    }
}

impl<T: Send> EnvelopeReceiver<T> for StreamReceiver<T> {
    fn pop(&self, timeout: Duration) -> Result<Option<T>, QueueError> {
        self.queue.pop(timeout)
    }
}

/// Queue ends held by the relay server
pub struct ServerEnd {
    pub requests: Box<dyn EnvelopeSender<IpcRequest>>,
    pub responses: Box<dyn EnvelopeReceiver<IpcResponse>>,
}

/// Queue ends held by the host executor
pub struct HostEnd {
    pub requests: Box<dyn EnvelopeReceiver<IpcRequest>>,
    pub responses: Box<dyn EnvelopeSender<IpcResponse>>,
}

/// Both directions as in-process channels
pub fn memory_pair() -> (ServerEnd, HostEnd) {
    let (request_tx, request_rx) = memory_queue();
    let (response_tx, response_rx) = memory_queue();
    (
        ServerEnd {
            requests: Box::new(request_tx),
            responses: Box::new(response_rx),
        },
        HostEnd {
            requests: Box::new(request_rx),
            responses: Box::new(response_tx),
        },
    )
}

/// Server side over a byte stream: writes requests, reads responses
pub fn server_end_over(
    reader: impl Read + Send + 'static,
    writer: impl Write + Send + 'static,
) -> io::Result<ServerEnd> {
    Ok(ServerEnd {
        requests: Box::new(StreamSender::new(writer)),
        responses: Box::new(StreamReceiver::spawn(reader, "ipc-responses")?),
    })
}

/// Host side over a byte stream: reads requests, writes responses
pub fn host_end_over(
    reader: impl Read + Send + 'static,
    writer: impl Write + Send + 'static,
) -> io::Result<HostEnd> {
    Ok(HostEnd {
        requests: Box::new(StreamReceiver::spawn(reader, "ipc-requests")?),
        responses: Box::new(StreamSender::new(writer)),
    })
}

/// Both directions over a connected Unix socket pair, with
/// [`STREAM_WRITE_TIMEOUT`] on both sockets
#[cfg(unix)]
pub fn stream_pair() -> io::Result<(ServerEnd, HostEnd)> {
    stream_pair_with_write_timeout(STREAM_WRITE_TIMEOUT)
}

#[cfg(unix)]
pub fn stream_pair_with_write_timeout(timeout: Duration) -> io::Result<(ServerEnd, HostEnd)> {
    use std::os::unix::net::UnixStream;

    let (server, host) = UnixStream::pair()?;
    server.set_write_timeout(Some(timeout))?;
    host.set_write_timeout(Some(timeout))?;
    let server_end = server_end_over(server.try_clone()?, server)?;
    let host_end = host_end_over(host.try_clone()?, host)?;
    Ok((server_end, host_end))
}
