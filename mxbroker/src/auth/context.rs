//! Ordered authenticator pipeline.

use super::login::{ProxyLoginModule, TargetCredentialsCallback};
use super::peer::PeerCredentials;
use super::subject::{Principal, Subject};
use crate::errors::{BrokerError, BrokerResult};

/// One stage of a login pipeline.
///
/// Two-phase: every stage's `login` runs first; only if all succeed are the
/// stages committed. A failing stage causes `abort` on every stage.
pub trait Authenticator: Send {
    /// Human-readable stage name for logging.
    fn name(&self) -> &str;

    /// Authenticate, possibly adding claims to the subject. `Err` vetoes.
    fn login(&mut self, subject: &mut Subject) -> BrokerResult<()>;

    /// Publish the stage's principals. Returns `false` if there is nothing
    /// to commit.
    fn commit(&mut self, subject: &mut Subject) -> bool;

    /// Undo a login or commit. Returns `false` if the stage never logged in.
    fn abort(&mut self, subject: &mut Subject) -> bool;

    /// Remove everything this stage published.
    fn logout(&mut self, subject: &mut Subject) -> bool;
}

/// Turns the OS identity reported by the transport into Unix principals.
#[derive(Debug)]
pub struct OsIdentityAuthenticator {
    peer: PeerCredentials,
    added: Vec<Principal>,
}

impl OsIdentityAuthenticator {
    pub fn new(peer: PeerCredentials) -> Self {
        Self {
            peer,
            added: Vec::new(),
        }
    }

    fn clear(&mut self, subject: &mut Subject) {
        for principal in self.added.drain(..) {
            subject.remove(&principal);
        }
    }
}

impl Authenticator for OsIdentityAuthenticator {
    fn name(&self) -> &str {
        "os_identity"
    }

    fn login(&mut self, subject: &mut Subject) -> BrokerResult<()> {
        self.clear(subject);
        if self.peer.is_empty() {
            return Err(BrokerError::AuthenticationFailed(
                "transport supplied no peer identity".into(),
            ));
        }

        let mut claims = Vec::new();
        if let Some(name) = &self.peer.username {
            claims.push(Principal::UnixUser(name.clone()));
        }
        if let Some(uid) = self.peer.uid {
            claims.push(Principal::UnixNumericUser(uid));
        }
        if let Some(gid) = self.peer.gid {
            claims.push(Principal::UnixNumericGroup { gid, primary: true });
        }
        for claim in claims {
            subject.add(claim.clone());
            self.added.push(claim);
        }
        Ok(())
    }

    fn commit(&mut self, _subject: &mut Subject) -> bool {
        !self.added.is_empty()
    }

    fn abort(&mut self, subject: &mut Subject) -> bool {
        let had = !self.added.is_empty();
        self.clear(subject);
        had
    }

    fn logout(&mut self, subject: &mut Subject) -> bool {
        self.clear(subject);
        true
    }
}

/// Runs authenticators in order against one subject.
pub struct LoginContext {
    stages: Vec<Box<dyn Authenticator>>,
    subject: Subject,
    authenticated: bool,
}

impl LoginContext {
    pub fn new(stages: Vec<Box<dyn Authenticator>>) -> Self {
        Self {
            stages,
            subject: Subject::new(),
            authenticated: false,
        }
    }

    /// Standard pipeline: transport identity, then the target-owner check.
    pub fn for_peer(peer: PeerCredentials, target: TargetCredentialsCallback) -> Self {
        Self::new(vec![
            Box::new(OsIdentityAuthenticator::new(peer)),
            Box::new(ProxyLoginModule::new(target)),
        ])
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Run every stage; commit only if all of them accept.
    pub fn login(&mut self) -> BrokerResult<&Subject> {
        self.authenticated = false;

        let mut failure = None;
        for stage in self.stages.iter_mut() {
            if let Err(e) = stage.login(&mut self.subject) {
                tracing::debug!(stage = stage.name(), error = %e, "Login stage vetoed");
                failure = Some(e);
                break;
            }
        }

        if failure.is_none() {
            for stage in self.stages.iter_mut() {
                if !stage.commit(&mut self.subject) {
                    failure = Some(BrokerError::AuthenticationFailed(format!(
                        "{} refused to commit",
                        stage.name()
                    )));
                    break;
                }
            }
        }

        if let Some(e) = failure {
            for stage in self.stages.iter_mut() {
                stage.abort(&mut self.subject);
            }
            return Err(e);
        }

        self.authenticated = true;
        Ok(&self.subject)
    }

    pub fn logout(&mut self) {
        for stage in self.stages.iter_mut().rev() {
            stage.logout(&mut self.subject);
        }
        self.authenticated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::UserCredentials;
    use std::sync::Arc;

    fn target() -> TargetCredentialsCallback {
        Arc::new(|| Some(UserCredentials::new(8000, 9000, 9001)))
    }

    fn peer(username: Option<&str>, uid: Option<u32>, gid: Option<u32>) -> PeerCredentials {
        PeerCredentials {
            username: username.map(str::to_string),
            uid,
            gid,
        }
    }

    #[test]
    fn test_pipeline_all_match() {
        let mut ctx = LoginContext::for_peer(peer(Some("duke"), Some(9000), Some(9001)), target());
        let subject = ctx.login().unwrap();
        let proxies: Vec<_> = subject.proxy_principals().collect();
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].name(), "duke");
        assert!(ctx.is_authenticated());
    }

    #[test]
    fn test_pipeline_gid_mismatch() {
        let mut ctx = LoginContext::for_peer(peer(Some("duke"), Some(9000), Some(1)), target());
        assert!(matches!(
            ctx.login(),
            Err(BrokerError::AuthenticationFailed(_))
        ));
        assert!(!ctx.is_authenticated());
        // Aborted stages leave nothing behind.
        assert!(ctx.subject().principals().is_empty());
    }

    #[test]
    fn test_pipeline_missing_uid() {
        let mut ctx = LoginContext::for_peer(peer(Some("duke"), None, Some(9001)), target());
        assert!(ctx.login().is_err());
        assert!(!ctx.is_authenticated());
    }

    #[test]
    fn test_pipeline_no_peer_identity() {
        let mut ctx = LoginContext::for_peer(PeerCredentials::default(), target());
        assert!(ctx.login().is_err());
    }

    #[test]
    fn test_logout_clears_subject() {
        let mut ctx = LoginContext::for_peer(peer(Some("duke"), Some(9000), Some(9001)), target());
        ctx.login().unwrap();
        ctx.logout();
        assert!(!ctx.is_authenticated());
        assert!(ctx.subject().principals().is_empty());
    }
}
