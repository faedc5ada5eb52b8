//! Privileged attach seam.

use crate::credentials::Pid;
use crate::errors::BrokerResult;

/// Agent property holding the address of the in-process management agent.
pub const LOCAL_CONNECTOR_ADDRESS: &str = "com.sun.management.jmxremote.localConnectorAddress";

/// Attaches to a running VM.
///
/// Attachers hand out an `AttachedVm` for operations on the attached VM,
/// the same way spawning and runtime handling are split elsewhere.
pub trait VmAttacher: Send + Sync {
    fn attach(&self, pid: Pid) -> BrokerResult<Box<dyn AttachedVm>>;
}

/// Operations on an attached VM.
pub trait AttachedVm: Send {
    fn pid(&self) -> Pid;

    /// Read one agent property. `Ok(None)` if the VM does not define it.
    fn agent_property(&mut self, key: &str) -> BrokerResult<Option<String>>;

    /// Start the local management agent inside the VM.
    fn start_local_management_agent(&mut self) -> BrokerResult<()>;

    fn detach(&mut self) -> BrokerResult<()>;
}
