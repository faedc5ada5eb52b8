//! Connection pool: one helper launch and one management connection per
//! target pid, shared by reference count.
//!
//! ## Acquire flow
//!
//! ```text
//! acquire(pid) ──► Live?    refcount += 1, return handle
//!              ├─► Pending? wait for the owner to settle, retry
//!              └─► absent:  insert PoolEntry ──► open IPC endpoint
//!                                             ──► spawn launcher task
//!                                             ──► wait on gate (bounded)
//!                                             ──► connect ──► Live{refcount: 1}
//!
//! helper ──IPC──► HandshakeSink ──► on_handshake_data ──► PoolEntry gate
//! helper ──bind──► pool registry (clients look sessions up here)
//! ```
//!
//! All map mutation happens under one lock. Waiting always happens outside it.

mod entry;
mod handshake;

pub use entry::{PoolEntry, Settlement};
pub use handshake::{HandshakeError, HandshakeMessage};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use nix::unistd::{Uid, User};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::connector::{JmxConnector, ManagementConnector, MxConnection};
use crate::credentials::{Pid, ProcessOwnerResolver};
use crate::errors::{BrokerError, BrokerResult};
use crate::ipc::{HandshakeSink, IpcService, UnixIpcService};
use crate::launcher::{LaunchRequest, ProcessLauncher, ProxyLauncher};
use crate::logging;
use crate::options::BrokerOptions;
use crate::registry::LocalCallRegistry;
use crate::util::is_process_alive;

/// What the pool did with one handshake payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeDisposition {
    /// Released the waiting entry with a URL.
    Resolved,
    /// Released the waiting entry with a failure.
    Failed,
    /// Could not be correlated with a pending entry.
    Dropped,
}

struct PooledConnection {
    connection: MxConnection,
    refcount: usize,
}

enum Slot {
    Pending(Arc<PoolEntry>),
    Live(PooledConnection),
}

/// State reachable from the IPC side channel.
struct PoolShared {
    slots: Mutex<HashMap<Pid, Slot>>,
    ipc: Arc<dyn IpcService>,
}

impl PoolShared {
    fn pending_entry(&self, pid: Pid) -> Option<Arc<PoolEntry>> {
        match self.slots.lock().get(&pid) {
            Some(Slot::Pending(entry)) => Some(Arc::clone(entry)),
            _ => None,
        }
    }

    /// Route a payload to its entry. With `session` set, the payload must
    /// come from that entry's own endpoint.
    fn deliver(&self, session: Option<&str>, raw: &[u8]) -> HandshakeDisposition {
        let (pid, outcome) = match HandshakeMessage::parse(raw) {
            Ok(message) => (message.pid, Ok(message.jmx_url)),
            Err(HandshakeError {
                pid: Some(pid),
                reason,
            }) => (pid, Err(BrokerError::HandshakeMalformed(reason))),
            Err(e) => {
                tracing::debug!(session = ?session, error = %e, "Dropped uncorrelated handshake");
                return HandshakeDisposition::Dropped;
            }
        };

        let entry = match self.pending_entry(pid) {
            Some(entry) if session.is_none_or(|s| s == entry.session()) => entry,
            _ => {
                tracing::debug!(pid = pid, session = ?session, "Dropped handshake with no pending entry");
                return HandshakeDisposition::Dropped;
            }
        };

        match outcome {
            Ok(url) => {
                if entry.set_result(url) {
                    tracing::debug!(pid = pid, session = %entry.session(), "Handshake resolved entry");
                    HandshakeDisposition::Resolved
                } else {
                    HandshakeDisposition::Dropped
                }
            }
            Err(e) => {
                tracing::warn!(pid = pid, error = %e, "Handshake rejected");
                if entry.set_failure(e) {
                    HandshakeDisposition::Failed
                } else {
                    HandshakeDisposition::Dropped
                }
            }
        }
    }
}

/// Sink handed to the IPC service for one session.
struct PoolIngress {
    shared: Weak<PoolShared>,
    session: String,
}

impl HandshakeSink for PoolIngress {
    fn on_handshake_data(&self, raw: &[u8]) {
        if let Some(shared) = self.shared.upgrade() {
            shared.deliver(Some(&self.session), raw);
        }
    }
}

/// Cleans up a pending entry unless it was promoted to a live connection.
///
/// Dropping an unfinished acquire lands here too, so cancellation tears the
/// helper down and releases any followers.
struct PendingLaunch {
    shared: Arc<PoolShared>,
    entry: Arc<PoolEntry>,
    endpoint_open: bool,
    launch: Option<JoinHandle<()>>,
    done: bool,
}

impl PendingLaunch {
    fn new(shared: Arc<PoolShared>, entry: Arc<PoolEntry>) -> Self {
        Self {
            shared,
            entry,
            endpoint_open: false,
            launch: None,
            done: false,
        }
    }

    fn close_endpoint(&mut self) {
        if std::mem::take(&mut self.endpoint_open) {
            self.shared.ipc.destroy_server(self.entry.session());
        }
    }

    /// Remove the entry if the map still holds this exact entry.
    fn remove_if_current(&self, slots: &mut HashMap<Pid, Slot>) -> bool {
        let current = matches!(
            slots.get(&self.entry.pid()),
            Some(Slot::Pending(entry)) if Arc::ptr_eq(entry, &self.entry)
        );
        if current {
            slots.remove(&self.entry.pid());
        }
        current
    }

    fn promote(mut self, connection: MxConnection) -> BrokerResult<MxConnection> {
        self.close_endpoint();
        let pid = self.entry.pid();
        {
            let mut slots = self.shared.slots.lock();
            if self.remove_if_current(&mut slots) {
                slots.insert(
                    pid,
                    Slot::Live(PooledConnection {
                        connection: connection.clone(),
                        refcount: 1,
                    }),
                );
            } else {
                drop(slots);
                let _ = connection.close();
                let e = BrokerError::Interrupted(format!("pool entry for pid {} was discarded", pid));
                self.fail(e.clone());
                return Err(e);
            }
        }
        // The helper keeps running until it exits on its own.
        self.launch.take();
        self.done = true;
        self.entry.settle(Settlement::Connected);
        tracing::info!(pid = pid, url = %connection.service_url(), "Management connection pooled");
        Ok(connection)
    }

    fn fail(&mut self, error: BrokerError) {
        if std::mem::replace(&mut self.done, true) {
            return;
        }
        self.remove_if_current(&mut self.shared.slots.lock());
        self.close_endpoint();
        if let Some(launch) = self.launch.take() {
            launch.abort();
        }
        self.entry.set_failure(error.clone());
        tracing::debug!(pid = self.entry.pid(), error = %error, "Pool entry discarded");
        self.entry.settle(Settlement::Failed(error));
    }
}

impl Drop for PendingLaunch {
    fn drop(&mut self) {
        self.fail(BrokerError::Interrupted(format!(
            "acquire for pid {} cancelled",
            self.entry.pid()
        )));
    }
}

enum Claim {
    Hit(MxConnection),
    Follow(Arc<PoolEntry>),
    Own(Arc<PoolEntry>),
}

/// Pools management connections to local VMs, one per target pid.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    launcher: Arc<dyn ProcessLauncher>,
    connector: Arc<dyn ManagementConnector>,
    resolver: ProcessOwnerResolver,
    registry: LocalCallRegistry,
    registry_addr: OnceCell<SocketAddr>,
    options: BrokerOptions,
}

impl ConnectionPool {
    /// Pool with the helper launcher, JMX connector and Unix socket IPC.
    pub fn new(options: BrokerOptions) -> BrokerResult<Self> {
        let ipc = Arc::new(UnixIpcService::new(&options.ipc));
        Self::with_components(
            options,
            Arc::new(ProxyLauncher::new()),
            Arc::new(JmxConnector::default()),
            ipc,
        )
    }

    /// Pool with caller-supplied collaborators.
    ///
    /// Installs file logging when `options.log_dir` is set. The registry and
    /// the IPC configuration file are set up by the first launch.
    pub fn with_components(
        options: BrokerOptions,
        launcher: Arc<dyn ProcessLauncher>,
        connector: Arc<dyn ManagementConnector>,
        ipc: Arc<dyn IpcService>,
    ) -> BrokerResult<Self> {
        options.validate()?;
        if let Some(log_dir) = &options.log_dir {
            logging::init_logging_for(log_dir)?;
        }
        Ok(Self {
            shared: Arc::new(PoolShared {
                slots: Mutex::new(HashMap::new()),
                ipc,
            }),
            launcher,
            connector,
            resolver: ProcessOwnerResolver::new(),
            registry: LocalCallRegistry::new(options.ipc.registry_port),
            registry_addr: OnceCell::new(),
            options,
        })
    }

    /// Serve helper bindings from `registry` instead of the default one.
    pub fn with_registry(mut self, registry: LocalCallRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Registry helpers bind their control sessions into.
    pub fn registry(&self) -> &LocalCallRegistry {
        &self.registry
    }

    /// Start the registry and publish its port in the IPC configuration.
    ///
    /// Idempotent; the first launch calls this.
    pub async fn start_registry(&self) -> BrokerResult<SocketAddr> {
        self.registry_addr
            .get_or_try_init(|| async {
                let addr = self.registry.start().await?;
                let mut ipc = self.options.ipc.clone();
                ipc.registry_port = addr.port();
                if let Err(e) = ipc.write(&self.options.ipc_config_path) {
                    self.registry.stop();
                    return Err(e);
                }
                tracing::info!(addr = %addr, config = %self.options.ipc_config_path.display(), "Broker registry ready");
                Ok::<_, BrokerError>(addr)
            })
            .await
            .copied()
    }

    /// Resolve process owners from a different procfs root.
    pub fn with_owner_resolver(mut self, resolver: ProcessOwnerResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    /// Get a management connection to `pid`, launching a helper if needed.
    ///
    /// Waits at most `acquire_timeout` for the helper's handshake. Every
    /// successful call must be paired with one `release`.
    pub async fn acquire(&self, pid: Pid) -> BrokerResult<MxConnection> {
        if !is_process_alive(pid) {
            return Err(BrokerError::NoSuchProcess(pid));
        }
        let deadline = Instant::now() + self.options.acquire_timeout;

        loop {
            match self.claim(pid) {
                Claim::Hit(connection) => return Ok(connection),
                Claim::Own(entry) => return self.acquire_owned(entry, deadline).await,
                Claim::Follow(entry) => {
                    tracing::debug!(pid = pid, "Joining in-flight launch");
                    match tokio::time::timeout_at(deadline, entry.settled()).await {
                        Ok(Settlement::Connected) => continue,
                        Ok(Settlement::Failed(e)) => return Err(e),
                        Err(_) => return Err(self.timeout_error(pid)),
                    }
                }
            }
        }
    }

    fn claim(&self, pid: Pid) -> Claim {
        let mut slots = self.shared.slots.lock();
        match slots.get_mut(&pid) {
            Some(Slot::Live(pooled)) => {
                pooled.refcount += 1;
                tracing::debug!(pid = pid, refcount = pooled.refcount, "Reusing pooled connection");
                Claim::Hit(pooled.connection.clone())
            }
            Some(Slot::Pending(entry)) => Claim::Follow(Arc::clone(entry)),
            None => {
                let session = format!(
                    "{}-{}-{}",
                    self.options.session_prefix,
                    pid,
                    ulid::Ulid::new()
                );
                let entry = Arc::new(PoolEntry::new(pid, session));
                slots.insert(pid, Slot::Pending(Arc::clone(&entry)));
                Claim::Own(entry)
            }
        }
    }

    async fn acquire_owned(
        &self,
        entry: Arc<PoolEntry>,
        deadline: Instant,
    ) -> BrokerResult<MxConnection> {
        let mut pending = PendingLaunch::new(Arc::clone(&self.shared), entry);
        match self.establish(&mut pending, deadline).await {
            Ok(connection) => pending.promote(connection),
            Err(e) => {
                tracing::warn!(pid = pending.entry.pid(), error = %e, "Acquire failed");
                pending.fail(e.clone());
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        pending: &mut PendingLaunch,
        deadline: Instant,
    ) -> BrokerResult<MxConnection> {
        let entry = Arc::clone(&pending.entry);
        let pid = entry.pid();

        self.start_registry().await?;
        let owner = self.resolver.resolve(pid)?;
        let target_user = match User::from_uid(Uid::from_raw(owner.uid())) {
            Ok(Some(user)) => user.name,
            _ => owner.uid().to_string(),
        };

        // Endpoint first, so a fast helper always finds it.
        let sink = Arc::new(PoolIngress {
            shared: Arc::downgrade(&self.shared),
            session: entry.session().to_string(),
        });
        self.shared
            .ipc
            .create_server(entry.session(), Some(owner.uid()), sink)
            .await?;
        pending.endpoint_open = true;

        let request = LaunchRequest {
            pid,
            target_user,
            bin_path: self.options.helper_path(),
            ipc_config_path: self.options.ipc_config_path.clone(),
            session: entry.session().to_string(),
        };
        tracing::info!(pid = pid, owner = %owner, session = %request.session, "Launching helper");

        let launcher = Arc::clone(&self.launcher);
        let launch_entry = Arc::clone(&entry);
        pending.launch = Some(tokio::spawn(async move {
            if let Err(e) = launcher.launch(request).await
                && !launch_entry.set_failure(e.clone())
            {
                tracing::warn!(pid = launch_entry.pid(), error = %e, "Helper failed after handshake");
            }
        }));

        let url = tokio::time::timeout_at(deadline, entry.wait())
            .await
            .map_err(|_| self.timeout_error(pid))??;
        pending.close_endpoint();

        tokio::time::timeout_at(deadline, self.connector.connect(&url))
            .await
            .map_err(|_| {
                BrokerError::Connection(format!("timed out connecting to {} for pid {}", url, pid))
            })?
    }

    fn timeout_error(&self, pid: Pid) -> BrokerError {
        BrokerError::HandshakeTimeout {
            pid,
            timeout_ms: self.options.acquire_timeout.as_millis() as u64,
        }
    }

    /// Return a connection obtained from `acquire`.
    ///
    /// The last release closes the connection. A pair the pool does not hold
    /// is reported as `UnknownConnection` and has no effect.
    pub fn release(&self, pid: Pid, connection: &MxConnection) -> BrokerResult<()> {
        let mut slots = self.shared.slots.lock();
        let remaining = match slots.get_mut(&pid) {
            Some(Slot::Live(pooled)) if pooled.connection.same_as(connection) => {
                pooled.refcount -= 1;
                pooled.refcount
            }
            _ => {
                tracing::warn!(pid = pid, "Release of unknown connection");
                return Err(BrokerError::UnknownConnection(pid));
            }
        };

        if remaining == 0 {
            // Close and remove under the same lock so no acquire can pick
            // up a closing connection.
            if let Some(Slot::Live(pooled)) = slots.remove(&pid) {
                if let Err(e) = pooled.connection.close() {
                    tracing::warn!(pid = pid, error = %e, "Closing management connection failed");
                }
                tracing::info!(pid = pid, "Management connection closed");
            }
        } else {
            tracing::debug!(pid = pid, refcount = remaining, "Released pooled connection");
        }
        Ok(())
    }

    /// Ingress for raw handshake bytes from any transport.
    pub fn on_handshake_data(&self, raw: &[u8]) -> HandshakeDisposition {
        self.shared.deliver(None, raw)
    }

    /// Fail every pending acquire, close every live connection and stop the
    /// registry.
    pub fn shutdown(&self) {
        let drained: Vec<(Pid, Slot)> = self.shared.slots.lock().drain().collect();
        for (pid, slot) in drained {
            match slot {
                Slot::Pending(entry) => {
                    entry.set_failure(BrokerError::Interrupted("connection pool shut down".into()));
                }
                Slot::Live(pooled) => {
                    if let Err(e) = pooled.connection.close() {
                        tracing::warn!(pid = pid, error = %e, "Closing management connection failed");
                    }
                }
            }
        }
        self.registry.stop();
        tracing::info!("Connection pool shut down");
    }

    /// Outstanding references to the pooled connection for `pid`.
    pub fn ref_count(&self, pid: Pid) -> Option<usize> {
        match self.shared.slots.lock().get(&pid) {
            Some(Slot::Live(pooled)) => Some(pooled.refcount),
            _ => None,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared
            .slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Pending(_)))
            .count()
    }

    pub fn live_count(&self) -> usize {
        self.shared
            .slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }
}
