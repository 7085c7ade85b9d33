//! End-to-end: client router -> TCP -> relay server -> IPC -> host executor

use hostlink::client::HostClient;
use hostlink::config::{Config, ToolSettings};
use hostlink::error::ExecutionError;
use hostlink::ipc::{self, HostExecutor, IpcBridge};
use hostlink::protocol::{WireRequest, WireResponse};
use hostlink::server::{RelayContext, RelayServer};
use hostlink::tool::base::ToolDefinition;
use hostlink::tool::{catalog, ToolRegistry};
use hostlink::transport::TcpConnector;
use hostlink::HostlinkError;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

struct Relay {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    bridge: IpcBridge,
    executor: HostExecutor,
}

impl Relay {
    async fn start(overlay: BTreeMap<String, ToolSettings>) -> Self {
        let registry = ToolRegistry::with_overlay(overlay);
        catalog::register_simulated_host(&registry).unwrap();
        registry
            .register(
                ToolDefinition::new("slow", "Sleeps", "diagnostic", json!({"type": "object"}))
                    .with_handler(Arc::new(|params: Value| -> Result<Value, ExecutionError> {
                        std::thread::sleep(Duration::from_millis(200));
                        Ok(params)
                    })),
            )
            .unwrap();
        let registry = Arc::new(registry);

        let (server_end, host_end) = ipc::memory_pair();
        let executor = HostExecutor::spawn(host_end, registry.clone()).unwrap();
        let bridge = IpcBridge::start(server_end, Duration::from_secs(5)).unwrap();

        let context = RelayContext::new(registry, bridge.clone(), "1.0.0");
        let server = RelayServer::bind("127.0.0.1:0", context).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(server.serve(async {
            let _ = stopped.await;
        }));

        Self {
            addr,
            stop: Some(stop),
            bridge,
            executor,
        }
    }

    fn config(&self) -> Config {
        Config {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            min_connections: 1,
            max_connections: 4,
            request_timeout_seconds: 5.0,
            flush_interval_seconds: 60.0,
            ..Config::default()
        }
    }

    async fn client(&self, config: &Config) -> HostClient {
        let registry = ToolRegistry::with_overlay(config.tools.clone());
        catalog::register_builtin_tools(&registry).unwrap();
        let connector = Arc::new(TcpConnector::new(config.host.clone(), config.port));
        HostClient::connect(config, Arc::new(registry), connector)
            .await
            .unwrap()
    }

    fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.bridge.shutdown();
        self.executor.stop();
    }
}

/// Raw line-oriented client for checking server behaviour directly
struct RawClient {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl RawClient {
    async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, id: &str, command: &str, params: Value, version: &str) {
        let request = WireRequest {
            id: id.to_string(),
            command: command.to_string(),
            params,
            version: version.to_string(),
        };
        let frame = hostlink::protocol::encode_frame(&request).unwrap();
        self.writer.write_all(&frame).await.unwrap();
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> WireResponse {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("response within deadline")
            .unwrap()
            .expect("connection open");
        serde_json::from_str(&line).unwrap()
    }
}

#[tokio::test]
async fn test_execute_round_trip() {
    let relay = Relay::start(BTreeMap::new()).await;
    let client = relay.client(&relay.config()).await;

    let result = client
        .execute("create_object", json!({"object_type": "MESH", "location": [0, 0, 1]}))
        .await
        .unwrap();
    assert_eq!(result["tool"], "create_object");
    assert_eq!(result["accepted"], true);
    assert_eq!(result["params"]["location"], json!([0, 0, 1]));

    let echoed = client.execute("echo", json!({"hello": "host"})).await.unwrap();
    assert_eq!(echoed, json!({"hello": "host"}));

    client.shutdown().await.unwrap();
    relay.shutdown();
}

#[tokio::test]
async fn test_invalid_params_rejected_before_dispatch() {
    let relay = Relay::start(BTreeMap::new()).await;
    let client = relay.client(&relay.config()).await;

    let err = client
        .execute("create_object", json!({"object_type": "MESH", "scale": [1, 1]}))
        .await
        .unwrap_err();
    assert!(matches!(err, HostlinkError::Validation(_)), "got {:?}", err);
    assert!(!err.is_retriable());

    let err = client.execute("teleport", json!({})).await.unwrap_err();
    assert!(matches!(err, HostlinkError::Validation(_)));

    client.shutdown().await.unwrap();
    relay.shutdown();
}

#[tokio::test]
async fn test_server_side_overlay_disables_tool() {
    let mut overlay = BTreeMap::new();
    overlay.insert(
        "render_image".to_string(),
        ToolSettings {
            enabled: false,
            ..ToolSettings::default()
        },
    );
    let relay = Relay::start(overlay).await;
    let client = relay.client(&relay.config()).await;

    let err = client
        .execute("render_image", json!({"output_path": "/tmp/frame.png"}))
        .await
        .unwrap_err();
    match err {
        HostlinkError::Remote { message, details } => {
            assert!(message.contains("tool is disabled"), "{}", message);
            assert_eq!(details.get("category"), Some(&json!("validation")));
        }
        other => panic!("expected remote error, got {:?}", other),
    }

    client.shutdown().await.unwrap();
    relay.shutdown();
}

#[tokio::test]
async fn test_batch_runs_in_dependency_order() {
    let relay = Relay::start(BTreeMap::new()).await;
    let client = relay.client(&relay.config()).await;

    let a = client
        .enqueue("create_object", json!({"object_type": "MESH", "object_name": "Cube"}), 0, vec![])
        .unwrap();
    let b = client
        .enqueue("set_material", json!({"object_name": "Cube"}), 5, vec![a.clone()])
        .unwrap();
    let c = client
        .enqueue("create_light", json!({"light_type": "SUN"}), 10, vec![])
        .unwrap();

    let outcomes = client.flush().await.unwrap();
    let order: Vec<&str> = outcomes.iter().map(|o| o.operation_id.as_str()).collect();
    assert_eq!(order, vec![c.as_str(), a.as_str(), b.as_str()]);
    assert!(outcomes.iter().all(|o| o.success));
    assert_eq!(outcomes[0].result.as_ref().unwrap()["tool"], "create_light");

    client.shutdown().await.unwrap();
    relay.shutdown();
}

#[tokio::test]
async fn test_enqueue_validates() {
    let relay = Relay::start(BTreeMap::new()).await;
    let client = relay.client(&relay.config()).await;

    let err = client
        .enqueue("create_light", json!({"light_type": "POINT", "energy": -1}), 0, vec![])
        .unwrap_err();
    assert!(matches!(err, HostlinkError::Validation(_)));
    assert_eq!(client.scheduler().stats().pending_operations, 0);

    client.shutdown().await.unwrap();
    relay.shutdown();
}

#[tokio::test]
async fn test_shutdown_dispatches_final_batch() {
    let relay = Relay::start(BTreeMap::new()).await;
    let client = relay.client(&relay.config()).await;

    client.enqueue("echo", json!({"last": true}), 0, vec![]).unwrap();
    let outcomes = client.shutdown().await.unwrap();

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success);
    assert_eq!(outcomes[0].result, Some(json!({"last": true})));
    assert!(client.pool().is_stopped());
    relay.shutdown();
}

#[tokio::test]
async fn test_list_remote_tools() {
    let relay = Relay::start(BTreeMap::new()).await;
    let client = relay.client(&relay.config()).await;

    let records = client.list_remote_tools().await.unwrap();
    let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
    assert!(names.contains(&"create_object"));
    assert!(names.contains(&"slow"));

    client.shutdown().await.unwrap();
    relay.shutdown();
}

#[tokio::test]
async fn test_responses_follow_completion_order() {
    let relay = Relay::start(BTreeMap::new()).await;
    let mut raw = RawClient::connect(relay.addr).await;

    raw.send("slow-1", "slow", json!({"n": 1}), "1.0").await;
    raw.send("fast-2", "echo", json!({"n": 2}), "1.0").await;

    let first = raw.recv().await;
    let second = raw.recv().await;
    assert_eq!(first.id, "fast-2");
    assert_eq!(first.result, Some(json!({"n": 2})));
    assert_eq!(second.id, "slow-1");

    relay.shutdown();
}

#[tokio::test]
async fn test_newer_protocol_version_rejected() {
    let relay = Relay::start(BTreeMap::new()).await;
    let mut raw = RawClient::connect(relay.addr).await;

    raw.send("v9", "echo", json!({}), "9.0").await;
    let response = raw.recv().await;
    assert_eq!(response.id, "v9");
    let error = response.error.expect("error object");
    assert_eq!(error.details.get("category"), Some(&json!("protocol")));
    assert!(error.message.contains("9.0"));

    relay.shutdown();
}

#[tokio::test]
async fn test_malformed_frame_gets_protocol_error() {
    let relay = Relay::start(BTreeMap::new()).await;
    let mut raw = RawClient::connect(relay.addr).await;

    raw.send_raw(r#"{"id": "bad-1", "params": {}}"#).await;
    let response = raw.recv().await;
    assert_eq!(response.id, "bad-1");
    assert!(response.error.is_some());

    // The connection keeps working
    raw.send("ok-2", "echo", json!({"fine": true}), "1.0").await;
    let response = raw.recv().await;
    assert_eq!(response.id, "ok-2");
    assert_eq!(response.result, Some(json!({"fine": true})));

    relay.shutdown();
}

#[tokio::test]
async fn test_batch_failure_does_not_stop_later_operations() {
    let relay = Relay::start(BTreeMap::new()).await;
    let mut raw = RawClient::connect(relay.addr).await;

    let payload = json!({
        "type": "batch",
        "operations": [
            {"id": "op_0", "command": "delete_object", "params": {}},
            {"id": "op_1", "command": "echo", "params": {"n": 1}}
        ],
        "compressed": false
    });
    raw.send("batch-1", "batch", payload, "1.0").await;

    let response = raw.recv().await;
    let outcomes = response.result.expect("batch result");
    assert_eq!(outcomes[0]["operation_id"], "op_0");
    assert_eq!(outcomes[0]["success"], false);
    assert!(outcomes[0]["error"].as_str().unwrap().contains("object_name"));
    assert_eq!(outcomes[1]["success"], true);
    assert_eq!(outcomes[1]["result"], json!({"n": 1}));

    relay.shutdown();
}
