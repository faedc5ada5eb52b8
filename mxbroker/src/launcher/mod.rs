//! Helper process launching.

mod spawn;

pub use spawn::ProxyLauncher;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::credentials::Pid;
use crate::errors::{BrokerError, BrokerResult};

/// Helper exit statuses. Anything not listed here is a plain launch failure.
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const AUTHENTICATION_FAILED: u8 = 10;
    pub const ATTACH_FAILED: u8 = 11;
    pub const PROCESS_IO: u8 = 12;
    pub const NO_SUCH_PROCESS: u8 = 13;
    pub const CONFIG: u8 = 14;
}

/// Exit status the helper uses to report `error` to the broker.
pub fn exit_code_for(error: &BrokerError) -> u8 {
    match error {
        BrokerError::AuthenticationFailed(_) => exit_code::AUTHENTICATION_FAILED,
        BrokerError::AttachFailed(_) => exit_code::ATTACH_FAILED,
        BrokerError::ProcessIo(_) => exit_code::PROCESS_IO,
        BrokerError::NoSuchProcess(_) => exit_code::NO_SUCH_PROCESS,
        BrokerError::Config(_) => exit_code::CONFIG,
        _ => exit_code::FAILURE,
    }
}

/// Error the broker reports for a helper that exited with `code`.
pub fn error_for_exit(pid: Pid, code: i32) -> BrokerError {
    let detail = format!("helper for pid {} failed: exit code {}", pid, code);
    match u8::try_from(code) {
        Ok(exit_code::AUTHENTICATION_FAILED) => BrokerError::AuthenticationFailed(detail),
        Ok(exit_code::ATTACH_FAILED) => BrokerError::AttachFailed(detail),
        Ok(exit_code::PROCESS_IO) => BrokerError::ProcessIo(detail),
        Ok(exit_code::NO_SUCH_PROCESS) => BrokerError::NoSuchProcess(pid),
        Ok(exit_code::CONFIG) => BrokerError::Config(detail),
        _ => BrokerError::LaunchFailed(detail),
    }
}

/// Everything needed to start one helper for one target pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub pid: Pid,
    /// Owner of the target; the helper runs as this user.
    pub target_user: String,
    /// Full path of the helper binary.
    pub bin_path: PathBuf,
    /// IPC configuration file shared with the helper.
    pub ipc_config_path: PathBuf,
    /// Name of the IPC endpoint the helper reports its handshake to.
    pub session: String,
}

impl LaunchRequest {
    /// Positional arguments: `<pid> <targetUser> <ipcConfigPath> <sessionName>`.
    pub fn args(&self) -> Vec<String> {
        vec![
            self.pid.to_string(),
            self.target_user.clone(),
            self.ipc_config_path.display().to_string(),
            self.session.clone(),
        ]
    }
}

/// Starts a helper and waits for it to exit.
///
/// `Ok(())` means the helper exited with status 0. The handshake travels
/// separately over IPC and may arrive before the process has exited.
/// Dropping the returned future must not leave the helper running.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> BrokerResult<()>;
}
