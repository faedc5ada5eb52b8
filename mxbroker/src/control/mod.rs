//! Remote control of the attach performed by the helper.
//!
//! ## Architecture
//!
//! - **VmAttacher**: performs the privileged attach (creates AttachedVm)
//! - **AttachedVm**: operations on the attached VM (properties, agent, detach)
//! - **RemoteControlSession**: per-target session exported through the
//!   local call registry; callers log in to get an `AuthenticatedControl`

mod attach;
mod hotspot;
mod session;

pub use attach::{AttachedVm, LOCAL_CONNECTOR_ADDRESS, VmAttacher};
pub use hotspot::{HotSpotAttacher, HotSpotVm};
pub use session::{
    AuthenticatedControl, ProxyControl, RemoteControlSession, SessionDirectory, ShutdownListener,
    ShutdownSignal,
};
