//! IPC broker
//!
//! The parent-side end of the boundary. One broker serves one execution: it
//! binds a fresh Unix socket, accepts any number of connections, and answers
//! every `callTool` request after re-checking it against the grant fixed at
//! bind time. That re-check does not trust anything the worker did before
//! sending the frame.
//!
//! # Lifecycle
//!
//! - The socket directory is created with mode 0700 if missing
//! - A stale socket at the bind path is removed; any other file is an error
//! - The socket file gets mode 0600
//! - At most `max_connections` workers are served at once; the rest wait in
//!   the listen backlog. A failed `accept` backs off before retrying.
//! - [`Broker::close`] stops accepting, drops every connection and removes
//!   the socket file. Calling it again does nothing.

use crate::error::BrokerError;
use crate::protocol::{
    decode_request, encode, CallToolParams, ErrorCode, Frame, FrameReader, Request, RequestId,
    Response,
};
use async_trait::async_trait;
use capgate_core::config::{DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_FRAME_BYTES};
use capgate_core::{
    Authority, CapabilityError, CapabilityObject, ExecutionConfig, PermissionId, PermissionSet,
};
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

const SOCKET_MODE: u32 = 0o600;
const DIRECTORY_MODE: u32 = 0o700;

/// Responses queued per connection before request tasks wait on the writer
const WRITE_QUEUE_DEPTH: usize = 64;

/// Pause after a failed `accept` (EMFILE, ENFILE, ...) before the next try
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerLimits {
    pub max_frame_bytes: usize,
    pub max_connections: usize,
}

impl Default for BrokerLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub socket_dir: PathBuf,
    pub limits: BrokerLimits,
}

impl From<&ExecutionConfig> for BrokerConfig {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            socket_dir: config.socket_dir(),
            limits: BrokerLimits {
                max_frame_bytes: config.max_frame_bytes,
                max_connections: config.max_connections,
            },
        }
    }
}

/// State shared by every connection of one broker
struct Session {
    capabilities: CapabilityObject,
    grant: PermissionSet,
    max_frame_bytes: usize,
    requests: AtomicU64,
}

pub struct Broker {
    socket_path: PathBuf,
    session: Arc<Session>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Broker {
    /// Bind `capgate-<uuid>.sock` in the configured directory
    pub fn bind(
        config: &BrokerConfig,
        authority: &Authority,
        capabilities: CapabilityObject,
    ) -> Result<Self, BrokerError> {
        ensure_directory(&config.socket_dir)?;
        let path = config
            .socket_dir
            .join(format!("capgate-{}.sock", uuid::Uuid::new_v4()));
        Self::bind_at(path, authority, capabilities, config.limits)
    }

    /// Bind at an explicit path. Must run inside a tokio runtime.
    pub fn bind_at(
        path: PathBuf,
        authority: &Authority,
        capabilities: CapabilityObject,
        limits: BrokerLimits,
    ) -> Result<Self, BrokerError> {
        if !authority.verify(&capabilities) {
            return Err(BrokerError::ForeignCapabilityObject);
        }

        cleanup_socket(&path)?;
        let listener = UnixListener::bind(&path).map_err(|source| BrokerError::Bind {
            path: path.clone(),
            source,
        })?;
        set_permissions(&path, SOCKET_MODE)?;

        let session = Arc::new(Session {
            grant: capabilities.granted().clone(),
            capabilities,
            max_frame_bytes: limits.max_frame_bytes,
            requests: AtomicU64::new(0),
        });

        info!(
            socket = %path.display(),
            authority = %authority.fingerprint(),
            grant = %session.grant,
            "Broker bound"
        );

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&session),
            limits.max_connections,
        ));

        Ok(Self {
            socket_path: path,
            session,
            accept_task: Mutex::new(Some(accept_task)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn grant(&self) -> &PermissionSet {
        &self.session.grant
    }

    /// Decoded requests seen so far, denied ones included
    pub fn requests_handled(&self) -> u64 {
        self.session.requests.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting, drop all connections, remove the socket file
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.take_accept_task() {
            task.abort();
            // Connections live in the accept task's JoinSet and go with it
            let _ = task.await;
        }
        remove_socket_file(&self.socket_path);
        info!(socket = %self.socket_path.display(), "Broker closed");
    }

    fn take_accept_task(&self) -> Option<JoinHandle<()>> {
        match self.accept_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.take_accept_task() {
            task.abort();
        }
        remove_socket_file(&self.socket_path);
        debug!(socket = %self.socket_path.display(), "Broker dropped without close");
    }
}

/// Source of incoming worker connections
#[async_trait]
trait Acceptor: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<UnixStream>;
}

#[async_trait]
impl Acceptor for UnixListener {
    async fn accept(&self) -> io::Result<UnixStream> {
        UnixListener::accept(self).await.map(|(stream, _addr)| stream)
    }
}

async fn accept_loop<A: Acceptor>(listener: A, session: Arc<Session>, max_connections: usize) {
    let slots = Arc::new(Semaphore::new(max_connections.max(1)));
    let mut connections = JoinSet::new();
    loop {
        // Take a slot before pulling the next connection off the backlog
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            return;
        };
        match listener.accept().await {
            Ok(stream) => {
                debug!("Worker connected");
                let session = Arc::clone(&session);
                connections.spawn(async move {
                    serve_connection(stream, session).await;
                    drop(permit);
                });
                while connections.try_join_next().is_some() {}
            }
            Err(e) => {
                drop(permit);
                warn!(error = %e, backoff = ?ACCEPT_BACKOFF, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn serve_connection(stream: UnixStream, session: Arc<Session>) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
    let mut tasks = JoinSet::new();

    // Single writer: one frame per write, never interleaved
    tasks.spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_half.write_all(&frame).await {
                debug!(error = %e, "Worker went away");
                break;
            }
        }
    });

    let mut frames = FrameReader::new(BufReader::new(read_half), session.max_frame_bytes);
    loop {
        let line = match frames.next_frame().await {
            Ok(Some(Frame::Line(line))) => line,
            Ok(Some(Frame::Oversized(len))) => {
                let response = Response::error(
                    None,
                    ErrorCode::ParseError,
                    format!(
                        "Frame of {} bytes exceeds the {} byte limit",
                        len, session.max_frame_bytes
                    ),
                );
                send(&tx, &response).await;
                continue;
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Connection read failed");
                break;
            }
        };

        let request = match decode_request(&line) {
            Ok(request) => request,
            Err(response) => {
                debug!(error = ?response.error_code(), "Rejected frame");
                send(&tx, &response).await;
                continue;
            }
        };

        session.requests.fetch_add(1, Ordering::SeqCst);
        let session = Arc::clone(&session);
        let tx = tx.clone();
        tasks.spawn(async move {
            let response = handle_request(&session, request).await;
            send(&tx, &response).await;
        });
        while tasks.try_join_next().is_some() {}
    }

    // Finish in-flight requests; the writer exits once every sender is gone
    drop(tx);
    while tasks.join_next().await.is_some() {}
    debug!("Worker disconnected");
}

async fn send(tx: &mpsc::Sender<Vec<u8>>, response: &Response) {
    match encode(response) {
        Ok(frame) => {
            let _ = tx.send(frame).await;
        }
        Err(e) => warn!(error = %e, "Failed to encode response"),
    }
}

async fn handle_request(session: &Session, request: Request) -> Response {
    let Request { id, params, .. } = request;
    let CallToolParams {
        server,
        tool,
        arguments,
    } = params;

    if server.is_empty() || tool.is_empty() || server.contains('.') {
        return Response::error(
            Some(id),
            ErrorCode::InvalidRequest,
            format!("Invalid tool address '{}' / '{}'", server, tool),
        );
    }

    let permission = PermissionId::from_parts(&server, &tool);
    if !session.grant.contains(&permission) {
        warn!(request = %id, permission = %permission, "Broker denied request");
        return denied(id, &permission, &session.grant);
    }

    debug!(request = %id, permission = %permission, "Dispatching");
    match session.capabilities.call(&server, &tool, arguments).await {
        Ok(result) => Response::success(id, result),
        Err(CapabilityError::PermissionDenied { .. }) => {
            denied(id, &permission, &session.grant)
        }
        Err(e) => {
            debug!(request = %id, error = %e, "Tool failed");
            Response::error(Some(id), ErrorCode::ToolExecutionFailed, e.to_string())
                .with_data(json!({ "code": e.code() }))
        }
    }
}

fn denied(
    id: RequestId,
    permission: &PermissionId,
    grant: &PermissionSet,
) -> Response {
    Response::error(
        Some(id),
        ErrorCode::PermissionDenied,
        format!("Permission '{}' not granted", permission),
    )
    .with_data(json!({
        "missing": [permission],
        "granted": grant,
    }))
}

fn ensure_directory(path: &Path) -> Result<(), BrokerError> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(BrokerError::SocketDir {
                    path: path.to_path_buf(),
                    message: "is a symlink".to_string(),
                });
            }
            if !metadata.is_dir() {
                return Err(BrokerError::SocketDir {
                    path: path.to_path_buf(),
                    message: "exists but is not a directory".to_string(),
                });
            }
            // Existing directories keep their permissions
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path)?;
            set_permissions(path, DIRECTORY_MODE)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<(), BrokerError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<(), BrokerError> {
    Ok(())
}

fn cleanup_socket(path: &Path) -> Result<(), BrokerError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_socket() {
            return Err(BrokerError::Bind {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::AlreadyExists, "path exists but is not a socket"),
            });
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    std::fs::remove_file(path)?;
    debug!(path = %path.display(), "Removed stale socket file");
    Ok(())
}

fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove socket file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capgate_core::CatalogBuilder;
    use std::sync::atomic::AtomicUsize;

    fn session() -> Arc<Session> {
        let authority = Authority::new(Arc::new(CatalogBuilder::new().build())).unwrap();
        let capabilities = authority.grant(std::iter::empty::<&str>()).unwrap();
        Arc::new(Session {
            grant: capabilities.granted().clone(),
            capabilities,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            requests: AtomicU64::new(0),
        })
    }

    /// Fails every accept the way a process out of descriptors does
    struct ExhaustedListener {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Acceptor for ExhaustedListener {
        async fn accept(&self) -> io::Result<UnixStream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::from_raw_os_error(24))
        }
    }

    #[tokio::test]
    async fn test_accept_errors_back_off() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(accept_loop(
            ExhaustedListener {
                attempts: Arc::clone(&attempts),
            },
            session(),
            4,
        ));

        // Other work on the runtime keeps making progress
        let ticker = tokio::spawn(async {
            let mut ticks = 0;
            for _ in 0..10 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ticks += 1;
            }
            ticks
        });
        assert_eq!(ticker.await.unwrap(), 10);

        tokio::time::sleep(Duration::from_millis(250)).await;
        task.abort();
        let _ = task.await;

        let attempts = attempts.load(Ordering::SeqCst);
        assert!(
            (1..=6).contains(&attempts),
            "expected a handful of retries, got {}",
            attempts
        );
    }

    #[test]
    fn test_limits_follow_execution_config() {
        let config = ExecutionConfig {
            max_connections: 3,
            max_frame_bytes: 512,
            ..ExecutionConfig::default()
        };
        let broker = BrokerConfig::from(&config);
        assert_eq!(
            broker.limits,
            BrokerLimits {
                max_frame_bytes: 512,
                max_connections: 3,
            }
        );
        assert_eq!(BrokerLimits::default().max_connections, DEFAULT_MAX_CONNECTIONS);
    }
}
