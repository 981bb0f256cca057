//! Broker and worker client over a real Unix socket

#![cfg(unix)]

use capgate_core::{
    tool_fn, Authority, CapabilityCatalog, CapabilityError, CatalogBuilder, PermissionId,
    PermissionSet, ToolError,
};
use capgate_sandbox::{
    remote_capabilities, Broker, BrokerConfig, BrokerError, BrokerLimits, ClientError, ErrorCode,
    WorkerClient,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

const LIMITS: BrokerLimits = BrokerLimits {
    max_frame_bytes: 1024 * 1024,
    max_connections: 8,
};

fn catalog() -> Arc<CapabilityCatalog> {
    let mut builder = CatalogBuilder::new();
    builder
        .register(
            "fs.read",
            tool_fn(|args| async move { Ok(json!({ "read": args })) }),
        )
        .unwrap()
        .register(
            "fs.write",
            tool_fn(|args| async move { Ok(json!({ "written": args })) }),
        )
        .unwrap()
        .register(
            "math.slow",
            tool_fn(|args: Value| async move {
                let ms = args["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(args["n"].clone())
            }),
        )
        .unwrap()
        .register(
            "fs.fail",
            tool_fn(|_| async { Err(ToolError::failed("boom")) }),
        )
        .unwrap();
    Arc::new(builder.build())
}

struct Fixture {
    dir: TempDir,
    broker: Broker,
}

impl Fixture {
    fn socket_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("sockets")
    }

    async fn client(&self, timeout: Duration) -> WorkerClient {
        WorkerClient::connect(self.broker.socket_path(), timeout)
            .await
            .unwrap()
    }
}

fn start(grant: &[&str]) -> Fixture {
    start_with_limits(grant, LIMITS)
}

fn start_with_limits(grant: &[&str], limits: BrokerLimits) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let authority = Authority::new(catalog()).unwrap();
    let capabilities = authority.grant(grant.iter()).unwrap();
    let broker = Broker::bind(
        &BrokerConfig {
            socket_dir: dir.path().join("sockets"),
            limits,
        },
        &authority,
        capabilities,
    )
    .unwrap();
    Fixture { dir, broker }
}

#[tokio::test]
async fn test_granted_call_round_trip() {
    let fixture = start(&["fs.read"]);
    let client = fixture.client(Duration::from_secs(5)).await;

    let result = client
        .call_tool("fs", "read", json!({ "path": "/tmp/x" }))
        .await
        .unwrap();
    assert_eq!(result, json!({ "read": { "path": "/tmp/x" } }));
    assert_eq!(fixture.broker.requests_handled(), 1);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_broker_denies_ungranted_frame() {
    let fixture = start(&["fs.read"]);
    let client = fixture.client(Duration::from_secs(5)).await;

    // Straight to the wire, skipping any worker-side check
    match client.call_tool("fs", "write", json!({ "path": "/etc/passwd" })).await {
        Err(ClientError::Rpc { code, data, .. }) => {
            assert_eq!(code, ErrorCode::PermissionDenied);
            let data = data.unwrap();
            assert_eq!(data["missing"], json!(["fs.write"]));
            assert_eq!(data["granted"], json!(["fs.read"]));
        }
        other => panic!("expected PermissionDenied, got {:?}", other),
    }
    assert_eq!(fixture.broker.requests_handled(), 1);
}

#[tokio::test]
async fn test_worker_side_denial_emits_no_frame() {
    let fixture = start(&["fs.read"]);
    let client = fixture.client(Duration::from_secs(5)).await;
    let catalog = catalog().ids();
    let grant = PermissionSet::parse_list("fs.read").unwrap();
    let caps = remote_capabilities(client, &catalog, &grant).unwrap();

    assert!(matches!(
        caps.call("fs", "write", json!({})).await,
        Err(CapabilityError::PermissionDenied { .. })
    ));
    assert_eq!(fixture.broker.requests_handled(), 0);

    let result = caps.call("fs", "read", json!({ "path": "a" })).await.unwrap();
    assert_eq!(result["read"]["path"], "a");
    assert_eq!(fixture.broker.requests_handled(), 1);
}

#[tokio::test]
async fn test_fifty_concurrent_requests_are_correlated() {
    let fixture = start(&["math.slow"]);
    let client = fixture.client(Duration::from_secs(10)).await;

    // Later requests finish first
    let calls = (0..50u64).map(|n| {
        let client = client.clone();
        async move {
            let result = client
                .call_tool("math", "slow", json!({ "n": n, "ms": (50 - n) * 4 }))
                .await
                .unwrap();
            (n, result)
        }
    });
    let results = futures_util::future::join_all(calls).await;

    assert_eq!(results.len(), 50);
    for (n, result) in results {
        assert_eq!(result, json!(n));
    }
    assert_eq!(fixture.broker.requests_handled(), 50);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_alive() {
    let fixture = start(&["fs.read"]);
    let stream = UnixStream::connect(fixture.broker.socket_path()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half.write_all(b"this is not json\n").await.unwrap();
    let first: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(first["id"], Value::Null);
    assert_eq!(first["error"]["code"], "ParseError");

    write_half
        .write_all(b"{\"id\":\"abc\",\"method\":\"callTool\",\"params\":{\"server\":\"fs\",\"tool\":\"read\",\"arguments\":1}}\n")
        .await
        .unwrap();
    let second: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(second, json!({ "id": "abc", "result": { "read": 1 } }));
}

#[tokio::test]
async fn test_invalid_requests() {
    let fixture = start(&["fs.read"]);
    let stream = UnixStream::connect(fixture.broker.socket_path()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half
        .write_all(b"{\"id\":4,\"method\":\"callTool\",\"params\":{\"server\":\"f.s\",\"tool\":\"read\"}}\n")
        .await
        .unwrap();
    let response: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(response["id"], 4);
    assert_eq!(response["error"]["code"], "InvalidRequest");

    write_half.write_all(b"{\"id\":5}\n").await.unwrap();
    let response: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(response["id"], 5);
    assert_eq!(response["error"]["code"], "InvalidRequest");
}

#[tokio::test]
async fn test_fractional_id_is_echoed() {
    let fixture = start(&["fs.read"]);
    let stream = UnixStream::connect(fixture.broker.socket_path()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half
        .write_all(b"{\"id\":1.5,\"method\":\"callTool\",\"params\":{\"server\":\"fs\",\"tool\":\"read\",\"arguments\":2}}\n")
        .await
        .unwrap();
    let response: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(response, json!({ "id": 1.5, "result": { "read": 2 } }));
}

#[tokio::test]
async fn test_connections_beyond_limit_wait_their_turn() {
    let fixture = start_with_limits(
        &["fs.read"],
        BrokerLimits {
            max_connections: 1,
            ..LIMITS
        },
    );
    let request = b"{\"id\":1,\"method\":\"callTool\",\"params\":{\"server\":\"fs\",\"tool\":\"read\",\"arguments\":1}}\n";

    let first = UnixStream::connect(fixture.broker.socket_path()).await.unwrap();
    let (first_read, mut first_write) = first.into_split();
    let mut first_lines = BufReader::new(first_read).lines();
    first_write.write_all(request).await.unwrap();
    assert!(first_lines.next_line().await.unwrap().is_some());

    // Queued in the backlog while the first worker holds the only slot
    let second = UnixStream::connect(fixture.broker.socket_path()).await.unwrap();
    let (second_read, mut second_write) = second.into_split();
    let mut second_lines = BufReader::new(second_read).lines();
    second_write.write_all(request).await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(300), second_lines.next_line())
            .await
            .is_err()
    );

    drop(first_write);
    drop(first_lines);

    let line = tokio::time::timeout(Duration::from_secs(5), second_lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let response: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response, json!({ "id": 1, "result": { "read": 1 } }));
    assert_eq!(fixture.broker.requests_handled(), 2);
}

#[tokio::test]
async fn test_tool_failure_is_reported() {
    let fixture = start(&["fs.fail"]);
    let client = fixture.client(Duration::from_secs(5)).await;
    match client.call_tool("fs", "fail", Value::Null).await {
        Err(ClientError::Rpc { code, message, .. }) => {
            assert_eq!(code, ErrorCode::ToolExecutionFailed);
            assert!(message.contains("boom"));
        }
        other => panic!("expected ToolExecutionFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_client_timeout_clears_pending_entry() {
    let fixture = start(&["math.slow"]);
    let client = fixture.client(Duration::from_millis(50)).await;

    let err = client
        .call_tool("math", "slow", json!({ "n": 1, "ms": 1000 }))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_close_is_idempotent_and_removes_socket() {
    let fixture = start(&["fs.read"]);
    let path = fixture.broker.socket_path().to_path_buf();
    assert!(path.exists());

    fixture.broker.close().await;
    assert!(fixture.broker.is_closed());
    assert!(!path.exists());
    fixture.broker.close().await;
    assert!(!path.exists());

    assert!(WorkerClient::connect(&path, Duration::from_secs(1)).await.is_err());
}

#[tokio::test]
async fn test_close_disconnects_clients() {
    let fixture = start(&["math.slow"]);
    let client = fixture.client(Duration::from_secs(30)).await;

    let pending = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .call_tool("math", "slow", json!({ "n": 1, "ms": 60_000 }))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    fixture.broker.close().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ClientError::Disconnected)));
}

#[tokio::test]
async fn test_drop_removes_socket() {
    let fixture = start(&["fs.read"]);
    let path = fixture.broker.socket_path().to_path_buf();
    let Fixture { dir, broker } = fixture;
    drop(broker);
    assert!(!path.exists());
    drop(dir);
}

#[tokio::test]
async fn test_socket_and_directory_modes() {
    use std::os::unix::fs::PermissionsExt;

    let fixture = start(&["fs.read"]);
    let dir_mode = std::fs::metadata(fixture.socket_dir()).unwrap().permissions().mode();
    assert_eq!(dir_mode & 0o777, 0o700);
    let socket_mode = std::fs::metadata(fixture.broker.socket_path())
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(socket_mode & 0o777, 0o600);

    let name = fixture
        .broker
        .socket_path()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .to_string();
    assert!(name.starts_with("capgate-") && name.ends_with(".sock"));
}

#[tokio::test]
async fn test_stale_socket_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stale.sock");
    drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
    assert!(path.exists());

    let authority = Authority::new(catalog()).unwrap();
    let capabilities = authority.grant(["fs.read"]).unwrap();
    let broker = Broker::bind_at(path.clone(), &authority, capabilities, LIMITS).unwrap();
    let client = WorkerClient::connect(&path, Duration::from_secs(5)).await.unwrap();
    assert!(client.call_tool("fs", "read", Value::Null).await.is_ok());
    broker.close().await;
}

#[tokio::test]
async fn test_regular_file_at_socket_path_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not-a-socket");
    std::fs::write(&path, b"keep me").unwrap();

    let authority = Authority::new(catalog()).unwrap();
    let capabilities = authority.grant(["fs.read"]).unwrap();
    assert!(matches!(
        Broker::bind_at(path.clone(), &authority, capabilities, LIMITS),
        Err(BrokerError::Bind { .. })
    ));
    assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
}

#[tokio::test]
async fn test_foreign_capability_object_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let shared = catalog();
    let a = Authority::new(Arc::clone(&shared)).unwrap();
    let b = Authority::new(shared).unwrap();
    let capabilities = b.grant(["fs.read"]).unwrap();

    assert!(matches!(
        Broker::bind_at(dir.path().join("x.sock"), &a, capabilities, LIMITS),
        Err(BrokerError::ForeignCapabilityObject)
    ));
}

#[tokio::test]
async fn test_remote_object_exposes_full_shape() {
    let fixture = start(&["fs.read"]);
    let client = fixture.client(Duration::from_secs(5)).await;
    let caps = remote_capabilities(
        client,
        &catalog().ids(),
        &PermissionSet::parse_list("fs.read").unwrap(),
    )
    .unwrap();

    let fs = caps.namespace("fs").unwrap();
    assert_eq!(fs.actions().collect::<Vec<_>>(), vec!["fail", "read", "write"]);
    assert!(caps.namespace("math").is_some());
    assert_eq!(caps.list_granted(), vec![PermissionId::new("fs.read")]);
}
