//! Remote-control sessions driven through the loopback registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use mxbroker::auth::{PeerCredentials, PeerCredentialsSource};
use mxbroker::control::{
    AttachedVm, LOCAL_CONNECTOR_ADDRESS, RemoteControlSession, ShutdownSignal, VmAttacher,
};
use mxbroker::registry::{LocalCallRegistry, RemoteControlClient};
use mxbroker::{BrokerError, BrokerResult, Pid, UserCredentials};

const ADDRESS: &str = "service:jmx:rmi://127.0.0.1/stub/rO0ABXNy";
const SESSION: &str = "agent-proxy-8000-registry";

#[derive(Default)]
struct FakeAttacher {
    attaches: AtomicUsize,
}

struct FakeVm;

impl VmAttacher for FakeAttacher {
    fn attach(&self, _pid: Pid) -> BrokerResult<Box<dyn AttachedVm>> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeVm))
    }
}

impl AttachedVm for FakeVm {
    fn pid(&self) -> Pid {
        8000
    }

    fn agent_property(&mut self, key: &str) -> BrokerResult<Option<String>> {
        Ok((key == LOCAL_CONNECTOR_ADDRESS).then(|| ADDRESS.to_string()))
    }

    fn start_local_management_agent(&mut self) -> BrokerResult<()> {
        Ok(())
    }

    fn detach(&mut self) -> BrokerResult<()> {
        Ok(())
    }
}

/// Reports a fixed identity for every connection.
struct FixedPeer(PeerCredentials);

impl PeerCredentialsSource for FixedPeer {
    fn peer_credentials(&self, _local: SocketAddr, _peer: SocketAddr) -> PeerCredentials {
        self.0.clone()
    }
}

fn owner() -> PeerCredentials {
    PeerCredentials {
        username: Some("duke".into()),
        uid: Some(9000),
        gid: Some(9001),
    }
}

async fn start(
    peer: Arc<dyn PeerCredentialsSource>,
    target: UserCredentials,
) -> (LocalCallRegistry, SocketAddr, Arc<FakeAttacher>, Arc<ShutdownSignal>) {
    let registry = LocalCallRegistry::new(0).with_peer_credentials(peer);
    let addr = registry.start().await.unwrap();
    let attacher = Arc::new(FakeAttacher::default());
    let shutdown = Arc::new(ShutdownSignal::new());
    let session = RemoteControlSession::new(
        SESSION,
        target,
        attacher.clone(),
        registry.directory(),
        shutdown.clone(),
    );
    registry.export(Arc::new(session)).unwrap();
    (registry, addr, attacher, shutdown)
}

#[tokio::test]
async fn owner_can_attach_and_detach() {
    let (registry, addr, attacher, shutdown) = start(
        Arc::new(FixedPeer(owner())),
        UserCredentials::new(8000, 9000, 9001),
    )
    .await;

    let mut client = RemoteControlClient::connect(addr).await.unwrap();
    assert_eq!(client.list().await.unwrap(), vec![SESSION.to_string()]);
    assert_eq!(client.login(SESSION).await.unwrap(), "duke");

    assert!(!client.is_attached().await.unwrap());
    assert_eq!(
        client.get_connector_address().await.unwrap_err(),
        BrokerError::NotAttached(8000)
    );

    client.attach().await.unwrap();
    client.attach().await.unwrap();
    assert_eq!(attacher.attaches.load(Ordering::SeqCst), 1);
    assert!(client.is_attached().await.unwrap());
    assert_eq!(client.get_connector_address().await.unwrap(), ADDRESS);

    client.detach().await.unwrap();
    assert!(shutdown.is_triggered());
    assert!(registry.list().is_empty());
    assert!(matches!(
        client.is_attached().await,
        Err(BrokerError::SessionClosed(_))
    ));
    registry.stop();
}

#[tokio::test]
async fn operations_require_login() {
    let (registry, addr, attacher, _) = start(
        Arc::new(FixedPeer(owner())),
        UserCredentials::new(8000, 9000, 9001),
    )
    .await;

    let mut client = RemoteControlClient::connect(addr).await.unwrap();
    assert!(matches!(
        client.attach().await,
        Err(BrokerError::AuthenticationFailed(_))
    ));
    assert!(matches!(
        client.login("no-such-session").await,
        Err(BrokerError::Registry(_))
    ));
    assert_eq!(attacher.attaches.load(Ordering::SeqCst), 0);
    registry.stop();
}

#[tokio::test]
async fn other_user_is_refused() {
    let intruder = PeerCredentials {
        username: Some("mallory".into()),
        uid: Some(9000),
        gid: Some(100),
    };
    let (registry, addr, attacher, shutdown) = start(
        Arc::new(FixedPeer(intruder)),
        UserCredentials::new(8000, 9000, 9001),
    )
    .await;

    let mut client = RemoteControlClient::connect(addr).await.unwrap();
    assert!(matches!(
        client.login(SESSION).await,
        Err(BrokerError::AuthenticationFailed(_))
    ));
    assert!(matches!(
        client.attach().await,
        Err(BrokerError::AuthenticationFailed(_))
    ));
    assert_eq!(attacher.attaches.load(Ordering::SeqCst), 0);
    assert!(!shutdown.is_triggered());
    registry.stop();
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn kernel_reported_identity_logs_in() {
    use mxbroker::auth::ProcNetTcpPeerCredentials;

    let me = PeerCredentials::from_uid(nix::unistd::getuid().as_raw());
    let (Some(uid), Some(gid)) = (me.uid, me.gid) else {
        // No user database entry for this uid.
        return;
    };

    let (registry, addr, _, _) = start(
        Arc::new(ProcNetTcpPeerCredentials::default()),
        UserCredentials::new(std::process::id(), uid, gid),
    )
    .await;

    let mut client = RemoteControlClient::connect(addr).await.unwrap();
    let principal = client.login(SESSION).await.unwrap();
    assert_eq!(Some(principal), me.username);
    client.attach().await.unwrap();
    assert_eq!(client.get_connector_address().await.unwrap(), ADDRESS);
    registry.stop();
}

#[tokio::test]
async fn client_refuses_remote_address() {
    let addr: SocketAddr = "10.0.0.1:1099".parse().unwrap();
    assert!(matches!(
        RemoteControlClient::connect(addr).await,
        Err(BrokerError::Registry(_))
    ));
}
