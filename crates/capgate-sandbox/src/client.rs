//! Worker side of the broker connection
//!
//! A worker process finds its broker through the environment, builds a
//! capability object whose every action is a remote call, and uses it the same
//! way parent-side code would. Calls outside the grant are refused locally
//! without writing a frame; the broker checks again anyway.

use crate::protocol::{
    decode_response, encode, ErrorCode, Frame, FrameReader, ProtocolError, Request, RequestId,
    ResponseBody,
};
use async_trait::async_trait;
use capgate_core::{
    Authority, CapabilityCatalog, CapabilityError, CapabilityObject, CatalogBuilder, CatalogError,
    PermissionError, PermissionId, PermissionSet, ToolError, ToolHandler,
};
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const ENV_BROKER_SOCKET: &str = "CAPGATE_BROKER_SOCKET";
pub const ENV_CATALOG: &str = "CAPGATE_CATALOG";
pub const ENV_GRANTED: &str = "CAPGATE_GRANTED";
pub const ENV_CALL_TIMEOUT_MS: &str = "CAPGATE_CALL_TIMEOUT_MS";

/// Used when the environment names no call timeout
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Tool results may exceed the broker's request limit
const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to broker at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Broker connection closed")]
    Disconnected,

    #[error("{code}: {message}")]
    Rpc {
        code: ErrorCode,
        message: String,
        data: Option<Value>,
    },

    #[error("Environment variable {name}: {message}")]
    Environment { name: &'static str, message: String },

    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

impl ClientError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "ConnectFailed",
            Self::Protocol(_) => "ProtocolError",
            Self::Timeout(_) => "Timeout",
            Self::Disconnected => "Disconnected",
            Self::Rpc { code, .. } => code.as_str(),
            Self::Environment { .. } => "Environment",
            Self::Capability(e) => e.code(),
        }
    }
}

impl From<CatalogError> for ClientError {
    fn from(e: CatalogError) -> Self {
        Self::Environment {
            name: ENV_CATALOG,
            message: e.to_string(),
        }
    }
}

type Pending = HashMap<RequestId, oneshot::Sender<ResponseBody>>;
type PendingMap = Arc<Mutex<Pending>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, Pending> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Removes the pending entry however the call ends
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

struct ClientInner {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: PendingMap,
    next_id: AtomicI64,
    call_timeout: Duration,
    reader: JoinHandle<()>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Multiplexed connection to a broker. Cheap to clone.
#[derive(Clone)]
pub struct WorkerClient {
    inner: Arc<ClientInner>,
}

impl WorkerClient {
    pub async fn connect(path: &Path, call_timeout: Duration) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| ClientError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_responses(
            FrameReader::new(BufReader::new(read_half), MAX_RESPONSE_BYTES),
            Arc::clone(&pending),
        ));
        debug!(socket = %path.display(), "Connected to broker");

        Ok(Self {
            inner: Arc::new(ClientInner {
                writer: tokio::sync::Mutex::new(write_half),
                pending,
                next_id: AtomicI64::new(1),
                call_timeout,
                reader,
            }),
        })
    }

    /// Send one `callTool` and wait for its response
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, ClientError> {
        let id = RequestId::from(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let frame = encode(&Request::call_tool(id.clone(), server, tool, arguments))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id,
        };

        let exchange = async {
            {
                let mut writer = self.inner.writer.lock().await;
                writer
                    .write_all(&frame)
                    .await
                    .map_err(|e| ClientError::Protocol(e.into()))?;
            }
            rx.await.map_err(|_| ClientError::Disconnected)
        };

        let body = tokio::time::timeout(self.inner.call_timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(self.inner.call_timeout))??;

        match body {
            ResponseBody::Result(value) => Ok(value),
            ResponseBody::Error(error) => Err(ClientError::Rpc {
                code: error.code,
                message: error.message,
                data: error.data,
            }),
        }
    }

    /// Calls still waiting for a response
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.pending).len()
    }
}

async fn read_responses<R>(mut frames: FrameReader<R>, pending: PendingMap)
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        let line = match frames.next_frame().await {
            Ok(Some(Frame::Line(line))) => line,
            Ok(Some(Frame::Oversized(len))) => {
                warn!(bytes = len, "Dropped oversized response");
                continue;
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Broker read failed");
                break;
            }
        };
        let response = match decode_response(&line) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Undecodable response from broker");
                continue;
            }
        };
        let Some(id) = response.id else {
            warn!(error = ?response.error_code(), "Broker rejected a frame");
            continue;
        };
        // Nobody waiting means the call already timed out
        if let Some(waiter) = lock(&pending).remove(&id) {
            let _ = waiter.send(response.body);
        }
    }
    // Fail everything still in flight
    lock(&pending).clear();
}

/// A catalog entry that forwards to the broker
pub struct RemoteTool {
    client: WorkerClient,
    server: String,
    tool: String,
}

impl RemoteTool {
    pub fn new(client: WorkerClient, id: &PermissionId) -> Result<Self, PermissionError> {
        let (server, tool) = id
            .parts()
            .ok_or_else(|| PermissionError::Malformed(id.to_string()))?;
        Ok(Self {
            client,
            server: server.to_string(),
            tool: tool.to_string(),
        })
    }
}

#[async_trait]
impl ToolHandler for RemoteTool {
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        self.client
            .call_tool(&self.server, &self.tool, arguments)
            .await
            .map_err(|e| ToolError::Remote {
                code: e.code().to_string(),
                message: match e {
                    ClientError::Rpc { message, .. } => message,
                    other => other.to_string(),
                },
            })
    }
}

/// What the supervisor tells a worker through its environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    pub socket: PathBuf,
    /// Every catalog id, granted or not
    pub catalog: Vec<PermissionId>,
    pub granted: PermissionSet,
    pub call_timeout: Duration,
}

impl WorkerEnv {
    pub fn vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_BROKER_SOCKET, self.socket.to_string_lossy().into_owned()),
            (
                ENV_CATALOG,
                self.catalog
                    .iter()
                    .map(PermissionId::as_str)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            (ENV_GRANTED, self.granted.to_list_string()),
            (ENV_CALL_TIMEOUT_MS, self.call_timeout.as_millis().to_string()),
        ]
    }

    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ClientError> {
        let socket = lookup(ENV_BROKER_SOCKET)
            .filter(|s| !s.is_empty())
            .ok_or(ClientError::Environment {
                name: ENV_BROKER_SOCKET,
                message: "not set".to_string(),
            })?;

        let catalog = PermissionSet::parse_list(&lookup(ENV_CATALOG).unwrap_or_default())
            .map_err(|e| ClientError::Environment {
                name: ENV_CATALOG,
                message: e.to_string(),
            })?
            .to_vec();

        let granted = PermissionSet::parse_list(&lookup(ENV_GRANTED).unwrap_or_default())
            .map_err(|e| ClientError::Environment {
                name: ENV_GRANTED,
                message: e.to_string(),
            })?;

        let call_timeout = match lookup(ENV_CALL_TIMEOUT_MS) {
            Some(ms) => Duration::from_millis(ms.trim().parse().map_err(|_| {
                ClientError::Environment {
                    name: ENV_CALL_TIMEOUT_MS,
                    message: format!("'{}' is not a number of milliseconds", ms),
                }
            })?),
            None => DEFAULT_CALL_TIMEOUT,
        };

        Ok(Self {
            socket: PathBuf::from(socket),
            catalog,
            granted,
            call_timeout,
        })
    }

    /// Connect and build the worker-local capability object
    pub async fn connect(&self) -> Result<CapabilityObject, ClientError> {
        let client = WorkerClient::connect(&self.socket, self.call_timeout).await?;
        remote_capabilities(client, &self.catalog, &self.granted)
    }
}

/// A capability object of the full catalog shape whose actions call the broker
pub fn remote_capabilities(
    client: WorkerClient,
    catalog: &[PermissionId],
    granted: &PermissionSet,
) -> Result<CapabilityObject, ClientError> {
    let mut builder = CatalogBuilder::new();
    for id in catalog {
        let tool = RemoteTool::new(client.clone(), id).map_err(CatalogError::from)?;
        builder.register(id.as_str(), Arc::new(tool))?;
    }
    let catalog: CapabilityCatalog = builder.build();
    let authority = Authority::new(Arc::new(catalog))?;
    Ok(authority.grant(granted)?)
}

/// Entry point for worker processes
pub async fn capabilities_from_env() -> Result<CapabilityObject, ClientError> {
    WorkerEnv::from_env()?.connect().await
}
