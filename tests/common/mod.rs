//! Common test utilities: an in-memory connector with a scripted endpoint

#![allow(dead_code)]

use hostlink::protocol::{WireRequest, WireResponse};
use hostlink::transport::{Connector, TransportStream};
use serde_json::json;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::task::JoinHandle;

type SharedWriter = Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>;

/// How the fake endpoint answers each request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// `{"command": ..., "params": ...}` as the result
    Echo,
    /// An error object with the command name in the message
    Error,
    /// Record the request and never answer
    Silent,
}

#[derive(Default)]
struct EndpointState {
    requests: Mutex<Vec<WireRequest>>,
    writers: Mutex<Vec<SharedWriter>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Connector whose streams lead to an in-process fake endpoint
pub struct ScriptedConnector {
    reply: Reply,
    fail_first: usize,
    attempts: AtomicUsize,
    opened: AtomicUsize,
    state: Arc<EndpointState>,
}

impl ScriptedConnector {
    pub fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self::build(reply, 0))
    }

    /// Refuse the first `n` connection attempts
    pub fn failing_first(reply: Reply, n: usize) -> Arc<Self> {
        Arc::new(Self::build(reply, n))
    }

    fn build(reply: Reply, fail_first: usize) -> Self {
        Self {
            reply,
            fail_first,
            attempts: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            state: Arc::new(EndpointState::default()),
        }
    }

    /// Connection attempts, failed ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Connections opened successfully
    pub fn connections(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<WireRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Wait until at least `count` requests have arrived
    pub async fn wait_for_requests(&self, count: usize) -> Vec<WireRequest> {
        for _ in 0..400 {
            let requests = self.requests();
            if requests.len() >= count {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} requests, saw {}", count, self.requests().len());
    }

    /// Write a response frame on connection `index`
    pub async fn inject(&self, index: usize, response: WireResponse) {
        let writer = self.state.writers.lock().unwrap()[index].clone();
        write_response(&writer, &response).await;
    }

    /// Drop the endpoint side of every connection
    pub fn disconnect_all(&self) {
        for task in self.state.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.state.writers.lock().unwrap().clear();
    }
}

#[async_trait::async_trait]
impl Connector for ScriptedConnector {
    fn endpoint(&self) -> String {
        "scripted".to_string()
    }

    async fn connect(&self) -> io::Result<TransportStream> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("scripted refusal #{}", attempt),
            ));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        let (client, endpoint) = tokio::io::duplex(64 * 1024);
        let (endpoint_reader, endpoint_writer) = tokio::io::split(endpoint);
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(endpoint_writer));

        let index = {
            let mut writers = self.state.writers.lock().unwrap();
            writers.push(writer.clone());
            writers.len() - 1
        };

        let state = self.state.clone();
        let reply = self.reply;
        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(endpoint_reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: WireRequest = match serde_json::from_str(&line) {
                    Ok(request) => request,
                    Err(_) => continue,
                };
                state.requests.lock().unwrap().push(request.clone());

                let response = match reply {
                    Reply::Echo => WireResponse::success(
                        request.id,
                        json!({"command": request.command, "params": request.params}),
                    ),
                    Reply::Error => WireResponse {
                        id: request.id,
                        result: None,
                        error: Some(hostlink::protocol::WireError {
                            message: format!("{} failed", request.command),
                            details: Default::default(),
                        }),
                    },
                    Reply::Silent => continue,
                };
                write_response(&writer, &response).await;
            }
        });
        self.state.tasks.lock().unwrap().push(task);

        let (reader, writer) = tokio::io::split(client);
        Ok(TransportStream::new(reader, writer, format!("scripted-{}", index)))
    }
}

async fn write_response(writer: &SharedWriter, response: &WireResponse) {
    let frame = hostlink::protocol::encode_frame(response).expect("encode response");
    let mut writer = writer.lock().await;
    let _ = writer.write_all(&frame).await;
    let _ = writer.flush().await;
}
