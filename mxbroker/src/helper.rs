//! The `agent-proxy` helper flow, run as the owner of the target VM.
//!
//! ```text
//! resolve owner ──► start own registry ──► export session ──► bind at broker
//!     ──► log in as self ──► attach ──► send handshake
//!     ──► linger (until detach or timeout) ──► detach ──► unbind ──► stop
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::auth::{PeerCredentials, PeerCredentialsSource, current_process_identity};
use crate::control::{
    AuthenticatedControl, HotSpotAttacher, ProxyControl, RemoteControlSession, ShutdownSignal,
    VmAttacher,
};
use crate::credentials::{Pid, ProcessOwnerResolver};
use crate::errors::{BrokerError, BrokerResult};
use crate::ipc::send_handshake;
use crate::options::IpcConfig;
use crate::pool::HandshakeMessage;
use crate::registry::{LocalCallRegistry, RemoteControlClient};
use crate::util::is_process_alive;

/// One helper run for one target pid.
pub struct AgentProxy {
    pid: Pid,
    session: String,
    config: IpcConfig,
    attacher: Arc<dyn VmAttacher>,
    resolver: ProcessOwnerResolver,
    identity: PeerCredentials,
    peers: Option<Arc<dyn PeerCredentialsSource>>,
}

impl AgentProxy {
    /// Helper using HotSpot attach and the identity of this process.
    pub fn new(pid: Pid, session: impl Into<String>, config: IpcConfig) -> Self {
        let attacher = Arc::new(HotSpotAttacher::new(config.attach_timeout()));
        Self {
            pid,
            session: session.into(),
            config,
            attacher,
            resolver: ProcessOwnerResolver::new(),
            identity: current_process_identity(),
            peers: None,
        }
    }

    pub fn with_attacher(mut self, attacher: Arc<dyn VmAttacher>) -> Self {
        self.attacher = attacher;
        self
    }

    pub fn with_owner_resolver(mut self, resolver: ProcessOwnerResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Identity the helper logs in to its own session with.
    pub fn with_identity(mut self, identity: PeerCredentials) -> Self {
        self.identity = identity;
        self
    }

    /// How the helper's registry identifies remote callers.
    pub fn with_peer_credentials(mut self, peers: Arc<dyn PeerCredentialsSource>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Run to completion. `Ok` means the handshake was delivered and the
    /// session detached.
    pub async fn run(self) -> BrokerResult<()> {
        if !is_process_alive(self.pid) {
            return Err(BrokerError::NoSuchProcess(self.pid));
        }
        let target = self.resolver.resolve(self.pid)?;
        tracing::debug!(target = %target, session = %self.session, "Resolved target owner");

        let mut registry = LocalCallRegistry::new(0);
        if let Some(peers) = &self.peers {
            registry = registry.with_peer_credentials(Arc::clone(peers));
        }
        let addr = registry.start().await?;

        let shutdown = Arc::new(ShutdownSignal::new());
        let session = Arc::new(RemoteControlSession::new(
            self.session.clone(),
            target,
            Arc::clone(&self.attacher),
            registry.directory(),
            shutdown.clone(),
        ));
        let result = match registry.export(Arc::clone(&session)) {
            Ok(()) => self.serve(&session, &shutdown, addr).await,
            Err(e) => Err(e),
        };
        registry.stop();
        result
    }

    async fn serve(
        &self,
        session: &Arc<RemoteControlSession>,
        shutdown: &ShutdownSignal,
        addr: SocketAddr,
    ) -> BrokerResult<()> {
        let broker = self.broker_registry();
        if let Some(broker) = broker {
            RemoteControlClient::connect(broker)
                .await?
                .bind(&self.session, addr)
                .await?;
        }
        tracing::info!(addr = %addr, session = %self.session, broker = ?broker, "Control session exported");

        let served = self.drive(session, shutdown).await;

        if let Some(broker) = broker
            && let Err(e) = self.unbind(broker).await
        {
            tracing::warn!(session = %self.session, error = %e, "Failed to unbind from broker registry");
        }
        served
    }

    /// Broker registry from the IPC configuration; port 0 means none.
    fn broker_registry(&self) -> Option<SocketAddr> {
        (self.config.registry_port != 0)
            .then(|| SocketAddr::from((Ipv4Addr::LOCALHOST, self.config.registry_port)))
    }

    async fn unbind(&self, broker: SocketAddr) -> BrokerResult<()> {
        RemoteControlClient::connect(broker)
            .await?
            .unbind(&self.session)
            .await
    }

    async fn drive(
        &self,
        session: &Arc<RemoteControlSession>,
        shutdown: &ShutdownSignal,
    ) -> BrokerResult<()> {
        let control = session.login(self.identity.clone())?;
        let reported = self.report(&control).await;

        let linger = self.config.linger();
        if reported.is_ok() && !linger.is_zero() {
            tokio::select! {
                _ = shutdown.wait() => {}
                _ = tokio::time::sleep(linger) => {}
            }
        }

        let detached = if session.is_closed() {
            Ok(())
        } else {
            let control = control.clone();
            tokio::task::spawn_blocking(move || control.detach())
                .await
                .map_err(|e| BrokerError::Internal(format!("detach worker failed: {}", e)))?
        };
        reported.and(detached)
    }

    /// Attach, read the management address and send the handshake.
    async fn report(&self, control: &AuthenticatedControl) -> BrokerResult<()> {
        let attaching = control.clone();
        let address = tokio::task::spawn_blocking(move || {
            attaching.attach()?;
            attaching.get_connector_address()
        })
        .await
        .map_err(|e| BrokerError::Internal(format!("attach worker failed: {}", e)))??;

        let message = HandshakeMessage::new(self.pid, address);
        send_handshake(&self.config, &self.session, &message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{AttachedVm, LOCAL_CONNECTOR_ADDRESS};
    use crate::ipc::{HandshakeSink, IpcService, UnixIpcService};
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    const ADDRESS: &str = "service:jmx:rmi://127.0.0.1/stub/helper";

    #[derive(Default)]
    struct FakeAttacher {
        attaches: AtomicUsize,
        detaches: Arc<AtomicUsize>,
        fail: bool,
    }

    struct FakeVm {
        pid: Pid,
        detaches: Arc<AtomicUsize>,
    }

    impl VmAttacher for FakeAttacher {
        fn attach(&self, pid: Pid) -> BrokerResult<Box<dyn AttachedVm>> {
            self.attaches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BrokerError::AttachFailed("no attach socket".into()));
            }
            Ok(Box::new(FakeVm {
                pid,
                detaches: Arc::clone(&self.detaches),
            }))
        }
    }

    impl AttachedVm for FakeVm {
        fn pid(&self) -> Pid {
            self.pid
        }
        fn agent_property(&mut self, key: &str) -> BrokerResult<Option<String>> {
            Ok((key == LOCAL_CONNECTOR_ADDRESS).then(|| ADDRESS.to_string()))
        }
        fn start_local_management_agent(&mut self) -> BrokerResult<()> {
            Ok(())
        }
        fn detach(&mut self) -> BrokerResult<()> {
            self.detaches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ChannelSink(mpsc::UnboundedSender<Vec<u8>>);

    impl HandshakeSink for ChannelSink {
        fn on_handshake_data(&self, raw: &[u8]) {
            let _ = self.0.send(raw.to_vec());
        }
    }

    fn me() -> PeerCredentials {
        PeerCredentials {
            username: Some("tester".into()),
            uid: Some(nix::unistd::getuid().as_raw()),
            gid: Some(nix::unistd::getgid().as_raw()),
        }
    }

    fn config(dir: &TempDir) -> IpcConfig {
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        IpcConfig {
            socket_dir: dir.path().join("ipc"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reports_handshake_then_detaches() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let ipc = UnixIpcService::new(&config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        ipc.create_server("helper-1", None, Arc::new(ChannelSink(tx)))
            .await
            .unwrap();

        let attacher = Arc::new(FakeAttacher::default());
        let pid = std::process::id();
        AgentProxy::new(pid, "helper-1", config)
            .with_attacher(attacher.clone())
            .with_identity(me())
            .run()
            .await
            .unwrap();

        // Exit success implies the attach happened before the handshake.
        assert_eq!(attacher.attaches.load(Ordering::SeqCst), 1);
        assert_eq!(attacher.detaches.load(Ordering::SeqCst), 1);
        let raw = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            HandshakeMessage::parse(&raw).unwrap(),
            HandshakeMessage::new(pid, ADDRESS)
        );
    }

    #[tokio::test]
    async fn test_wrong_identity_never_attaches() {
        let dir = TempDir::new().unwrap();
        let attacher = Arc::new(FakeAttacher::default());
        let intruder = PeerCredentials {
            gid: Some(nix::unistd::getgid().as_raw().wrapping_add(1)),
            ..me()
        };
        let err = AgentProxy::new(std::process::id(), "helper-2", config(&dir))
            .with_attacher(attacher.clone())
            .with_identity(intruder)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::AuthenticationFailed(_)), "{err:?}");
        assert_eq!(attacher.attaches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_attach_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let attacher = Arc::new(FakeAttacher {
            fail: true,
            ..Default::default()
        });
        let err = AgentProxy::new(std::process::id(), "helper-3", config(&dir))
            .with_attacher(attacher)
            .with_identity(me())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::AttachFailed(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_dead_target_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = AgentProxy::new(999_999_999, "helper-4", config(&dir))
            .with_attacher(Arc::new(FakeAttacher::default()))
            .run()
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::NoSuchProcess(999_999_999));
    }

    #[tokio::test]
    async fn test_unreachable_socket_fails_run() {
        let dir = TempDir::new().unwrap();
        let attacher = Arc::new(FakeAttacher::default());
        let err = AgentProxy::new(std::process::id(), "no-endpoint", config(&dir))
            .with_attacher(attacher.clone())
            .with_identity(me())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Ipc(_)), "{err:?}");
        // Detach still runs after a failed report.
        assert_eq!(attacher.detaches.load(Ordering::SeqCst), 1);
    }
}
