//! Remote-control session exported by the helper.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::attach::{AttachedVm, LOCAL_CONNECTOR_ADDRESS, VmAttacher};
use crate::auth::{LoginContext, PeerCredentials, ProxyPrincipal};
use crate::credentials::{Pid, UserCredentials};
use crate::errors::{BrokerError, BrokerResult};

/// Notified once when a session detaches, so the helper can exit.
pub trait ShutdownListener: Send + Sync {
    fn on_shutdown(&self, session: &str);
}

/// Removes a session from whatever published it.
pub trait SessionDirectory: Send + Sync {
    /// Returns `false` if `name` was not exported.
    fn unexport(&self, name: &str) -> bool;
}

/// Operations available to an authenticated caller.
pub trait ProxyControl: Send + Sync {
    /// Attach to the target and discover its management address.
    /// A no-op when already attached.
    fn attach(&self) -> BrokerResult<()>;

    /// Detach and close the session. Terminal.
    fn detach(&self) -> BrokerResult<()>;

    fn is_attached(&self) -> BrokerResult<bool>;

    fn get_connector_address(&self) -> BrokerResult<String>;
}

/// `ShutdownListener` that a waiter can await.
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self {
            tx: watch::Sender::new(false),
        }
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once any session has shut down.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl ShutdownListener for ShutdownSignal {
    fn on_shutdown(&self, session: &str) {
        tracing::debug!(session = %session, "Shutdown requested");
        self.tx.send_replace(true);
    }
}

#[derive(Default)]
struct SessionState {
    vm: Option<Box<dyn AttachedVm>>,
    address: Option<String>,
    closed: bool,
}

/// Control session for one target VM.
///
/// Callers must log in with their peer credentials first; the returned
/// `AuthenticatedControl` is the only way to reach the operations.
pub struct RemoteControlSession {
    name: String,
    target: UserCredentials,
    attacher: Arc<dyn VmAttacher>,
    directory: Arc<dyn SessionDirectory>,
    listener: Arc<dyn ShutdownListener>,
    state: Mutex<SessionState>,
}

impl fmt::Debug for RemoteControlSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteControlSession")
            .field("name", &self.name)
            .field("target", &self.target)
            .finish()
    }
}

/// Runs the detach cleanup exactly once, whatever the detach itself did.
struct DetachCleanup<'a> {
    session: &'a RemoteControlSession,
}

impl Drop for DetachCleanup<'_> {
    fn drop(&mut self) {
        let session = self.session;
        if !session.directory.unexport(&session.name) {
            tracing::debug!(session = %session.name, "Session was not exported");
        }
        session.listener.on_shutdown(&session.name);
    }
}

impl RemoteControlSession {
    pub fn new(
        name: impl Into<String>,
        target: UserCredentials,
        attacher: Arc<dyn VmAttacher>,
        directory: Arc<dyn SessionDirectory>,
        listener: Arc<dyn ShutdownListener>,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            attacher,
            directory,
            listener,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> UserCredentials {
        self.target
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Authenticate a caller against the owner of the target process.
    pub fn login(self: &Arc<Self>, peer: PeerCredentials) -> BrokerResult<AuthenticatedControl> {
        if self.is_closed() {
            return Err(BrokerError::SessionClosed(self.name.clone()));
        }

        let target = self.target;
        let mut context = LoginContext::for_peer(peer, Arc::new(move || Some(target)));
        let principal = context
            .login()?
            .proxy_principals()
            .next()
            .cloned()
            .ok_or_else(|| {
                BrokerError::AuthenticationFailed("no proxy principal was published".into())
            })?;

        tracing::info!(session = %self.name, principal = %principal, "Caller authenticated");
        Ok(AuthenticatedControl {
            session: Arc::clone(self),
            principal,
        })
    }

    fn pid(&self) -> Pid {
        self.target.pid()
    }

    fn attach(&self) -> BrokerResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BrokerError::SessionClosed(self.name.clone()));
        }
        if state.vm.is_some() && state.address.is_some() {
            return Ok(());
        }

        let mut vm = match state.vm.take() {
            Some(vm) => vm,
            None => self.attacher.attach(self.pid())?,
        };
        match discover_address(vm.as_mut()) {
            Ok(address) => {
                tracing::info!(session = %self.name, pid = self.pid(), address = %address, "Management address discovered");
                state.vm = Some(vm);
                state.address = Some(address);
                Ok(())
            }
            Err(e) => {
                if let Err(detach_err) = vm.detach() {
                    tracing::warn!(pid = self.pid(), error = %detach_err, "Detach after failed attach");
                }
                Err(e)
            }
        }
    }

    fn detach(&self) -> BrokerResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BrokerError::SessionClosed(self.name.clone()));
        }
        state.closed = true;
        state.address = None;
        let vm = state.vm.take();
        drop(state);

        let _cleanup = DetachCleanup { session: self };
        match vm {
            Some(mut vm) => vm.detach().inspect(|_| {
                tracing::info!(session = %self.name, pid = self.pid(), "Detached from VM");
            }),
            None => Ok(()),
        }
    }

    fn is_attached(&self) -> BrokerResult<bool> {
        let state = self.state.lock();
        if state.closed {
            return Err(BrokerError::SessionClosed(self.name.clone()));
        }
        Ok(state.vm.is_some())
    }

    fn get_connector_address(&self) -> BrokerResult<String> {
        let state = self.state.lock();
        if state.closed {
            return Err(BrokerError::SessionClosed(self.name.clone()));
        }
        state
            .address
            .clone()
            .ok_or(BrokerError::NotAttached(self.pid()))
    }
}

/// Read the local connector address, starting the agent if needed.
fn discover_address(vm: &mut dyn AttachedVm) -> BrokerResult<String> {
    if let Some(address) = vm.agent_property(LOCAL_CONNECTOR_ADDRESS)? {
        return Ok(address);
    }
    vm.start_local_management_agent()?;
    vm.agent_property(LOCAL_CONNECTOR_ADDRESS)?.ok_or_else(|| {
        BrokerError::AttachFailed(format!(
            "pid {} has no local connector address after starting the agent",
            vm.pid()
        ))
    })
}

/// A logged-in handle on a `RemoteControlSession`.
#[derive(Debug, Clone)]
pub struct AuthenticatedControl {
    session: Arc<RemoteControlSession>,
    principal: ProxyPrincipal,
}

impl AuthenticatedControl {
    pub fn principal(&self) -> &ProxyPrincipal {
        &self.principal
    }

    pub fn session(&self) -> &RemoteControlSession {
        &self.session
    }
}

impl ProxyControl for AuthenticatedControl {
    fn attach(&self) -> BrokerResult<()> {
        tracing::debug!(principal = %self.principal, "attach");
        self.session.attach()
    }

    fn detach(&self) -> BrokerResult<()> {
        tracing::debug!(principal = %self.principal, "detach");
        self.session.detach()
    }

    fn is_attached(&self) -> BrokerResult<bool> {
        self.session.is_attached()
    }

    fn get_connector_address(&self) -> BrokerResult<String> {
        self.session.get_connector_address()
    }
}
