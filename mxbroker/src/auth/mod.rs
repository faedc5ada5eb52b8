//! Caller authentication for the helper's remote-control interface.
//!
//! ## Architecture
//!
//! ```text
//! transport peer credentials ──► OsIdentityAuthenticator ──► Subject{Unix*}
//!                                                              │
//! target UserCredentials (callback) ──► ProxyLoginModule ──────┤
//!                                                              ▼
//!                                              Subject{Unix*, Proxy(principal)}
//! ```
//!
//! `LoginContext` runs an ordered pipeline of `Authenticator`s. Every stage
//! may veto; a veto aborts all stages and no principal is published.

mod context;
mod login;
mod peer;
mod subject;

pub use context::{Authenticator, LoginContext, OsIdentityAuthenticator};
pub use login::{LoginState, ProxyLoginModule, TargetCredentialsCallback};
pub use peer::{PeerCredentials, PeerCredentialsSource, current_process_identity};
#[cfg(target_os = "linux")]
pub use peer::ProcNetTcpPeerCredentials;
pub use subject::{Principal, ProxyPrincipal, Subject};
