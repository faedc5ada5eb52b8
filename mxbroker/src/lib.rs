#![deny(clippy::all)]

//! mxbroker: privilege-separated management connections to local JVMs.
//!
//! A monitoring process running as one user gets a management connection
//! into a VM owned by another user. The `ConnectionPool` launches the
//! `agent-proxy` helper as the VM's owner; the helper attaches, exports a
//! remote-control session on its own loopback registry, binds it into the
//! pool's registry and reports the management URL back over IPC. Connections are pooled per pid and shared by refcount.

pub mod auth;
pub mod connector;
pub mod control;
pub mod credentials;
pub mod errors;
pub mod helper;
pub mod ipc;
pub mod launcher;
pub mod logging;
pub mod options;
pub mod pool;
pub mod registry;
pub mod util;

pub use connector::{JmxConnector, JmxServiceUrl, ManagementConnector, MxConnection};
pub use credentials::{Pid, ProcessOwnerResolver, UserCredentials};
pub use errors::{BrokerError, BrokerResult};
pub use helper::AgentProxy;
pub use options::{BrokerOptions, IpcConfig};
pub use pool::{ConnectionPool, HandshakeDisposition, HandshakeMessage, PoolEntry};

// Compile-time check: ConnectionPool is shared across tasks
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<ConnectionPool>;
    let _ = assert_send_sync::<registry::LocalCallRegistry>;
    let _ = assert_send_sync::<control::RemoteControlSession>;
};
