//! Credential-matching login for the remote-control interface.

use std::sync::Arc;

use super::context::Authenticator;
use super::subject::{Principal, ProxyPrincipal, Subject};
use crate::credentials::UserCredentials;
use crate::errors::{BrokerError, BrokerResult};

/// Supplies the credentials of the target process at login time.
pub type TargetCredentialsCallback = Arc<dyn Fn() -> Option<UserCredentials> + Send + Sync>;

/// Login progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    NotLoggedIn,
    LoggedIn,
    Committed,
}

/// Accepts a caller only if its uid and primary gid equal those of the
/// process owner returned by the target callback.
///
/// Username, uid and primary gid must all be present in the subject. There
/// is no partial match.
pub struct ProxyLoginModule {
    target: TargetCredentialsCallback,
    state: LoginState,
    principal: Option<ProxyPrincipal>,
}

impl std::fmt::Debug for ProxyLoginModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyLoginModule")
            .field("state", &self.state)
            .field("principal", &self.principal)
            .finish()
    }
}

impl ProxyLoginModule {
    pub fn new(target: TargetCredentialsCallback) -> Self {
        Self {
            target,
            state: LoginState::NotLoggedIn,
            principal: None,
        }
    }

    /// Module checking against a fixed set of credentials.
    pub fn for_target(creds: UserCredentials) -> Self {
        Self::new(Arc::new(move || Some(creds)))
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    pub fn is_logged_in(&self) -> bool {
        self.state != LoginState::NotLoggedIn
    }

    pub fn is_committed(&self) -> bool {
        self.state == LoginState::Committed
    }

    /// Principal established by the last successful login.
    pub fn principal(&self) -> Option<&ProxyPrincipal> {
        self.principal.as_ref()
    }

    fn reset(&mut self, subject: &mut Subject) {
        if let Some(principal) = self.principal.take() {
            subject.remove(&Principal::Proxy(principal));
        }
        self.state = LoginState::NotLoggedIn;
    }

    fn verify(&self, subject: &Subject) -> BrokerResult<ProxyPrincipal> {
        let username = subject
            .username()
            .ok_or_else(|| BrokerError::AuthenticationFailed("no username principal".into()))?;
        let uid = subject
            .uid()
            .ok_or_else(|| BrokerError::AuthenticationFailed("no uid principal".into()))?;
        let gid = subject
            .primary_gid()
            .ok_or_else(|| BrokerError::AuthenticationFailed("no primary gid principal".into()))?;

        let target = (self.target)().ok_or_else(|| {
            BrokerError::AuthenticationFailed("target credentials unavailable".into())
        })?;

        if uid != target.uid() {
            return Err(BrokerError::AuthenticationFailed(format!(
                "uid {} does not own pid {}",
                uid,
                target.pid()
            )));
        }
        if gid != target.gid() {
            return Err(BrokerError::AuthenticationFailed(format!(
                "gid {} does not own pid {}",
                gid,
                target.pid()
            )));
        }

        Ok(ProxyPrincipal::new(username))
    }
}

impl Authenticator for ProxyLoginModule {
    fn name(&self) -> &str {
        "proxy_login"
    }

    fn login(&mut self, subject: &mut Subject) -> BrokerResult<()> {
        self.reset(subject);
        match self.verify(subject) {
            Ok(principal) => {
                tracing::debug!(principal = %principal, "Proxy login succeeded");
                self.principal = Some(principal);
                self.state = LoginState::LoggedIn;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Proxy login rejected");
                Err(e)
            }
        }
    }

    fn commit(&mut self, subject: &mut Subject) -> bool {
        match (self.state, &self.principal) {
            (LoginState::LoggedIn, Some(principal)) => {
                subject.add(Principal::Proxy(principal.clone()));
                self.state = LoginState::Committed;
                true
            }
            _ => false,
        }
    }

    fn abort(&mut self, subject: &mut Subject) -> bool {
        let was_logged_in = self.is_logged_in();
        self.reset(subject);
        was_logged_in
    }

    fn logout(&mut self, subject: &mut Subject) -> bool {
        self.reset(subject);
        true
    }
}
