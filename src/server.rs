//! Relay server: accepts wire requests over TCP, validates them against the
//! registry and forwards them to the host executor through the IPC bridge.

use crate::error::{HostlinkError, Result};
use crate::ipc::IpcBridge;
use crate::protocol::{
    decode_frame, encode_frame, is_compatible_version, BatchOutcome, BatchPayload, WireRequest,
    WireResponse, BATCH_COMMAND, LIST_TOOLS_COMMAND,
};
use crate::tool::ToolRegistry;
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Request handling shared by every client connection
pub struct RelayContext {
    registry: Arc<ToolRegistry>,
    bridge: IpcBridge,
    api_version: String,
}

impl RelayContext {
    pub fn new(registry: Arc<ToolRegistry>, bridge: IpcBridge, api_version: impl Into<String>) -> Self {
        Self {
            registry,
            bridge,
            api_version: api_version.into(),
        }
    }

    /// Handle one request; the response always carries the request id
    pub async fn respond(&self, request: WireRequest) -> WireResponse {
        let WireRequest {
            id,
            command,
            params,
            version,
        } = request;

        match self.handle(&command, params, &version).await {
            Ok(result) => WireResponse::success(id, result),
            Err(e) => {
                tracing::debug!(id = %id, command = %command, error = %e, "request failed");
                WireResponse::failure(id, &e)
            }
        }
    }

    async fn handle(&self, command: &str, params: Value, version: &str) -> Result<Value> {
        if !is_compatible_version(version, &self.api_version) {
            return Err(HostlinkError::Protocol(format!(
                "unsupported protocol version {} (server speaks {})",
                version, self.api_version
            )));
        }

        match command {
            LIST_TOOLS_COMMAND => Ok(serde_json::to_value(self.registry.schema_records())?),
            BATCH_COMMAND => self.run_batch(params).await,
            tool => self.run_tool(tool, params).await,
        }
    }

    async fn run_tool(&self, tool: &str, params: Value) -> Result<Value> {
        let params = self.registry.apply_defaults(tool, params);
        self.registry.check(tool, &params)?;
        self.bridge.call(tool, params).await
    }

    /// Operations run in payload order; a failure does not stop the rest
    async fn run_batch(&self, params: Value) -> Result<Value> {
        let payload: BatchPayload = serde_json::from_value(params)
            .map_err(|e| HostlinkError::Protocol(format!("invalid batch payload: {}", e)))?;

        let mut outcomes = Vec::with_capacity(payload.operations.len());
        for operation in payload.operations {
            let result = self.run_tool(&operation.command, operation.params).await;
            outcomes.push(BatchOutcome::from_result(operation.id, result));
        }

        let failed = outcomes.iter().filter(|o| !o.success).count();
        tracing::info!(
            operations = outcomes.len(),
            failed,
            compressed = payload.compressed,
            "batch executed"
        );
        Ok(serde_json::to_value(outcomes)?)
    }
}

pub struct RelayServer {
    listener: TcpListener,
    context: Arc<RelayContext>,
}

impl RelayServer {
    pub async fn bind(addr: &str, context: RelayContext) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HostlinkError::Connection(format!("failed to bind {}: {}", addr, e)))?;
        Ok(Self {
            listener,
            context: Arc::new(context),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until `shutdown` completes
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "relay server listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_client(stream, peer, self.context.clone()));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                _ = &mut shutdown => break,
            }
        }

        tracing::info!("relay server stopped");
        Ok(())
    }
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, context: Arc<RelayContext>) {
    tracing::info!(peer = %peer, "client connected");
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer = %peer, error = %e, "set_nodelay failed");
    }

    let (reader, mut writer) = stream.into_split();
    let (responses, mut outbound) = mpsc::unbounded_channel::<WireResponse>();

    let writer_task = tokio::spawn(async move {
        while let Some(response) = outbound.recv().await {
            let frame = match encode_frame(&response) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(id = %response.id, error = %e, "failed to encode response");
                    continue;
                }
            };
            if let Err(e) = writer.write_all(&frame).await {
                tracing::debug!(peer = %peer, error = %e, "write failed");
                break;
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = match decode_frame::<WireRequest>(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "undecodable request");
                let id = frame_id(&line).unwrap_or_default();
                let err = HostlinkError::Protocol(format!("invalid request: {}", e));
                let _ = responses.send(WireResponse::failure(id, &err));
                continue;
            }
        };

        // Requests on one connection run concurrently; responses are
        // written in completion order and matched by id.
        let context = context.clone();
        let responses = responses.clone();
        tokio::spawn(async move {
            let response = context.respond(request).await;
            let _ = responses.send(response);
        });
    }

    drop(responses);
    let _ = writer_task.await;
    tracing::info!(peer = %peer, "client disconnected");
}

/// Best-effort id extraction from a frame that failed to decode
fn frame_id(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    value.get("id")?.as_str().map(str::to_owned)
}
