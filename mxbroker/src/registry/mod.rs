//! Loopback-only directory of remote-control sessions.
//!
//! Two roles share one server type:
//!
//! - The broker runs a registry on the configured port. It serves no
//!   sessions itself; helpers `bind` their session names to the address of
//!   their own registry.
//! - Each helper runs a registry on an ephemeral port and exports its
//!   `RemoteControlSession` there.
//!
//! Clients `lookup` a name at the broker, connect to the returned address,
//! log in with the OS identity behind their socket, then drive the session
//! through `ProxyControl`.

mod client;
mod protocol;
mod socket;

pub use client::RemoteControlClient;
pub use protocol::{Request, Response, WireError};
pub use socket::LoopbackSocketFactory;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use crate::auth::{PeerCredentials, PeerCredentialsSource};
use crate::control::{AuthenticatedControl, ProxyControl, RemoteControlSession, SessionDirectory};
use crate::errors::{BrokerError, BrokerResult};

/// Longest request line a connection may send.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// A name served by another registry.
#[derive(Debug, Clone, Copy)]
struct Binding {
    addr: SocketAddr,
    owner_uid: Option<u32>,
}

#[derive(Debug, Default)]
struct Names {
    sessions: HashMap<String, Arc<RemoteControlSession>>,
    bindings: HashMap<String, Binding>,
}

impl Names {
    fn contains(&self, name: &str) -> bool {
        self.sessions.contains_key(name) || self.bindings.contains_key(name)
    }
}

/// Sessions exported in this process and names bound by other registries.
///
/// Both share one namespace.
#[derive(Debug, Default)]
pub struct ExportTable {
    names: RwLock<Names>,
}

impl ExportTable {
    fn lookup(&self, name: &str) -> Option<Arc<RemoteControlSession>> {
        self.names.read().sessions.get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        let guard = self.names.read();
        let mut names: Vec<String> = guard
            .sessions
            .keys()
            .chain(guard.bindings.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn export(&self, session: Arc<RemoteControlSession>) -> BrokerResult<()> {
        let mut names = self.names.write();
        if names.contains(session.name()) {
            return Err(BrokerError::Registry(format!(
                "session {} already exported",
                session.name()
            )));
        }
        tracing::debug!(session = %session.name(), "Session exported");
        names.sessions.insert(session.name().to_string(), session);
        Ok(())
    }

    fn bind(&self, name: &str, addr: SocketAddr, owner_uid: Option<u32>) -> BrokerResult<()> {
        if name.is_empty() {
            return Err(BrokerError::Registry("empty session name".into()));
        }
        if !addr.ip().is_loopback() {
            return Err(BrokerError::Registry(format!(
                "refusing to bind {} to non-local address {}",
                name, addr
            )));
        }
        let mut names = self.names.write();
        if names.contains(name) {
            return Err(BrokerError::Registry(format!("session {} already bound", name)));
        }
        tracing::debug!(session = %name, addr = %addr, uid = ?owner_uid, "Session bound");
        names
            .bindings
            .insert(name.to_string(), Binding { addr, owner_uid });
        Ok(())
    }

    fn unbind(&self, name: &str, caller_uid: Option<u32>) -> BrokerResult<()> {
        let mut names = self.names.write();
        let binding = names
            .bindings
            .get(name)
            .ok_or_else(|| BrokerError::Registry(format!("no session named {}", name)))?;
        if binding.owner_uid.is_none() || binding.owner_uid != caller_uid {
            return Err(BrokerError::AuthenticationFailed(format!(
                "session {} was bound by another user",
                name
            )));
        }
        names.bindings.remove(name);
        tracing::debug!(session = %name, "Session unbound");
        Ok(())
    }

    /// Where to log in to `name`; `local` serves the sessions exported here.
    fn resolve(&self, name: &str, local: SocketAddr) -> Option<SocketAddr> {
        let names = self.names.read();
        if names.sessions.contains_key(name) {
            return Some(local);
        }
        names.bindings.get(name).map(|b| b.addr)
    }
}

impl SessionDirectory for ExportTable {
    fn unexport(&self, name: &str) -> bool {
        let removed = self.names.write().sessions.remove(name).is_some();
        if removed {
            tracing::debug!(session = %name, "Session unexported");
        }
        removed
    }
}

/// Peer lookup for platforms without a socket table to consult.
#[cfg(not(target_os = "linux"))]
struct NoPeerCredentials;

#[cfg(not(target_os = "linux"))]
impl PeerCredentialsSource for NoPeerCredentials {
    fn peer_credentials(&self, _local: SocketAddr, _peer: SocketAddr) -> PeerCredentials {
        PeerCredentials::default()
    }
}

fn default_peer_source() -> Arc<dyn PeerCredentialsSource> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(crate::auth::ProcNetTcpPeerCredentials::default())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(NoPeerCredentials)
    }
}

struct Running {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

/// Registry server bound to loopback.
pub struct LocalCallRegistry {
    factory: LoopbackSocketFactory,
    table: Arc<ExportTable>,
    peers: Arc<dyn PeerCredentialsSource>,
    running: Mutex<Option<Running>>,
}

impl LocalCallRegistry {
    /// Registry on `port` (0 picks an ephemeral port).
    pub fn new(port: u16) -> Self {
        Self::with_factory(LoopbackSocketFactory::new(port, 0))
    }

    pub fn with_factory(factory: LoopbackSocketFactory) -> Self {
        Self {
            factory,
            table: Arc::new(ExportTable::default()),
            peers: default_peer_source(),
            running: Mutex::new(None),
        }
    }

    /// Replace how caller identities are determined.
    pub fn with_peer_credentials(mut self, peers: Arc<dyn PeerCredentialsSource>) -> Self {
        self.peers = peers;
        self
    }

    /// Handle sessions use to unexport themselves.
    pub fn directory(&self) -> Arc<dyn SessionDirectory> {
        self.table.clone()
    }

    /// Start accepting connections. Starting twice is an error.
    pub async fn start(&self) -> BrokerResult<SocketAddr> {
        let mut running = self.running.lock();
        if let Some(running) = running.as_ref() {
            return Err(BrokerError::Registry(format!(
                "registry already started on {}",
                running.local_addr
            )));
        }

        let listener = self.factory.bind()?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BrokerError::Registry(format!("no local address: {}", e)))?;
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.table),
            Arc::clone(&self.peers),
        ));
        *running = Some(Running {
            local_addr,
            accept_task,
        });
        tracing::info!(addr = %local_addr, "Local call registry started");
        Ok(local_addr)
    }

    /// Stop accepting and drop open connections. No-op if never started.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.accept_task.abort();
            tracing::info!(addr = %running.local_addr, "Local call registry stopped");
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Publish a session under its name.
    pub fn export(&self, session: Arc<RemoteControlSession>) -> BrokerResult<()> {
        self.table.export(session)
    }

    /// Publish `name` as served by the registry at `addr`.
    pub fn bind(&self, name: &str, addr: SocketAddr, owner_uid: Option<u32>) -> BrokerResult<()> {
        self.table.bind(name, addr, owner_uid)
    }

    /// Address of the registry serving `name`, if known here.
    pub fn resolve(&self, name: &str) -> Option<SocketAddr> {
        let local = self.local_addr()?;
        self.table.resolve(name, local)
    }

    pub fn unexport(&self, name: &str) -> bool {
        self.table.unexport(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.table.names()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<RemoteControlSession>> {
        self.table.lookup(name)
    }
}

impl Drop for LocalCallRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    table: Arc<ExportTable>,
    peers: Arc<dyn PeerCredentialsSource>,
) {
    // Dropping the set on abort closes every open connection.
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if !peer.ip().is_loopback() {
                        tracing::warn!(peer = %peer, "Rejected non-local registry connection");
                        continue;
                    }
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&table),
                        Arc::clone(&peers),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Registry accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// Per-connection state: the control handle once the caller logged in.
struct Connection {
    local: SocketAddr,
    peer: SocketAddr,
    table: Arc<ExportTable>,
    peers: Arc<dyn PeerCredentialsSource>,
    control: Option<AuthenticatedControl>,
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    table: Arc<ExportTable>,
    peers: Arc<dyn PeerCredentialsSource>,
) {
    let local = match stream.local_addr() {
        Ok(local) => local,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Registry connection has no local address");
            return;
        }
    };
    tracing::debug!(peer = %peer, "Registry connection accepted");

    let mut conn = Connection {
        local,
        peer,
        table,
        peers,
        control: None,
    };
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let line = match read_request_line(&mut reader).await {
            Ok(RequestLine::Line(line)) => line,
            Ok(RequestLine::Eof) | Err(_) => break,
            Ok(RequestLine::TooLong) => {
                tracing::warn!(peer = %peer, "Registry request exceeds {} bytes", MAX_REQUEST_BYTES);
                let response = Response::error(&BrokerError::Registry(format!(
                    "request exceeds {} bytes",
                    MAX_REQUEST_BYTES
                )));
                if let Ok(mut out) = serde_json::to_vec(&response) {
                    out.push(b'\n');
                    let _ = writer.write_all(&out).await;
                }
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => match conn.dispatch(request).await {
                Ok(value) => Response::ok(value),
                Err(e) => Response::error(&e),
            },
            Err(e) => Response::error(&BrokerError::Registry(format!("bad request: {}", e))),
        };

        let mut out = match serde_json::to_vec(&response) {
            Ok(out) => out,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode registry response");
                return;
            }
        };
        out.push(b'\n');
        if writer.write_all(&out).await.is_err() {
            return;
        }
    }
    tracing::debug!(peer = %peer, "Registry connection closed");
}

enum RequestLine {
    Line(String),
    TooLong,
    Eof,
}

/// Read one newline-terminated request, never buffering more than
/// `MAX_REQUEST_BYTES` plus the terminator.
async fn read_request_line<R>(reader: &mut R) -> std::io::Result<RequestLine>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(MAX_REQUEST_BYTES as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if read == 0 {
        return Ok(RequestLine::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > MAX_REQUEST_BYTES {
        return Ok(RequestLine::TooLong);
    }
    Ok(RequestLine::Line(String::from_utf8_lossy(&buf).into_owned()))
}

impl Connection {
    async fn peer_uid(&self) -> BrokerResult<Option<u32>> {
        let peers = Arc::clone(&self.peers);
        let (local, peer) = (self.local, self.peer);
        blocking(move || Ok(peers.peer_credentials(local, peer).uid)).await
    }

    async fn dispatch(&mut self, request: Request) -> BrokerResult<Value> {
        match request {
            Request::List => Ok(Value::from(self.table.names())),
            Request::Lookup { name } => self
                .table
                .resolve(&name, self.local)
                .map(|addr| Value::from(addr.to_string()))
                .ok_or_else(|| BrokerError::Registry(format!("no session named {}", name))),
            Request::Bind { name, addr } => {
                let uid = self.peer_uid().await?;
                self.table.bind(&name, addr, uid).map(|()| Value::Null)
            }
            Request::Unbind { name } => {
                let uid = self.peer_uid().await?;
                self.table.unbind(&name, uid).map(|()| Value::Null)
            }
            Request::Login { session } => {
                let target = self
                    .table
                    .lookup(&session)
                    .ok_or_else(|| BrokerError::Registry(format!("no session named {}", session)))?;
                let peers = Arc::clone(&self.peers);
                let (local, peer) = (self.local, self.peer);
                let control = blocking(move || {
                    let identity: PeerCredentials = peers.peer_credentials(local, peer);
                    target.login(identity)
                })
                .await?;
                let name = control.principal().name().to_string();
                self.control = Some(control);
                Ok(Value::from(name))
            }
            op => {
                let control = self.control.clone().ok_or_else(|| {
                    BrokerError::AuthenticationFailed("connection is not logged in".into())
                })?;
                blocking(move || match op {
                    Request::Attach => control.attach().map(|()| Value::Null),
                    Request::Detach => control.detach().map(|()| Value::Null),
                    Request::IsAttached => control.is_attached().map(Value::from),
                    Request::ConnectorAddress => control.get_connector_address().map(Value::from),
                    Request::List
                    | Request::Login { .. }
                    | Request::Bind { .. }
                    | Request::Unbind { .. }
                    | Request::Lookup { .. } => {
                        Err(BrokerError::Internal("unreachable registry op".into()))
                    }
                })
                .await
            }
        }
    }
}

/// Run a session operation off the async workers; attach may block.
async fn blocking<T, F>(f: F) -> BrokerResult<T>
where
    F: FnOnce() -> BrokerResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BrokerError::Internal(format!("registry worker failed: {}", e)))?
}
