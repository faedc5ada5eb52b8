//! Subprocess spawning for the agent-proxy helper.

use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::{LaunchRequest, ProcessLauncher};
use crate::errors::{BrokerError, BrokerResult};

/// Launches the helper binary with inherited stdio.
///
/// The child is spawned with `kill_on_drop`, so cancelling `launch` (for
/// example when an acquire times out) kills the helper.
#[derive(Debug, Clone, Default)]
pub struct ProxyLauncher;

impl ProxyLauncher {
    pub fn new() -> Self {
        Self
    }

    fn spawn(request: &LaunchRequest) -> BrokerResult<Child> {
        let mut cmd = Command::new(&request.bin_path);
        cmd.args(request.args());

        // Pass RUST_LOG to subprocess if set
        if let Ok(rust_log) = std::env::var("RUST_LOG") {
            cmd.env("RUST_LOG", rust_log);
        }

        // Helper diagnostics go straight to our own streams.
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        cmd.spawn().map_err(|e| {
            let err_msg = format!(
                "Failed to spawn helper at {}: {}",
                request.bin_path.display(),
                e
            );
            tracing::error!("{}", err_msg);
            BrokerError::LaunchFailed(err_msg)
        })
    }
}

#[async_trait]
impl ProcessLauncher for ProxyLauncher {
    async fn launch(&self, request: LaunchRequest) -> BrokerResult<()> {
        let mut child = Self::spawn(&request)?;
        let helper_pid = child.id();
        tracing::debug!(
            pid = request.pid,
            helper_pid = ?helper_pid,
            session = %request.session,
            "Helper spawned"
        );

        let waited = child.wait().await;
        let result = match waited {
            Ok(status) => check_exit(&request, status),
            Err(e) => Err(BrokerError::LaunchFailed(format!(
                "waiting for helper failed: {}",
                e
            ))),
        };
        if result.is_err() {
            let _ = child.start_kill();
        }
        result
    }
}

fn check_exit(request: &LaunchRequest, status: ExitStatus) -> BrokerResult<()> {
    if status.success() {
        tracing::debug!(pid = request.pid, session = %request.session, "Helper exited cleanly");
        return Ok(());
    }

    let error = match status.code() {
        Some(code) => super::error_for_exit(request.pid, code),
        None => {
            use std::os::unix::process::ExitStatusExt;
            let detail = match status.signal() {
                Some(signal) => format!("killed by signal {}", signal),
                None => "unknown exit status".to_string(),
            };
            BrokerError::LaunchFailed(format!(
                "helper for pid {} failed: {}",
                request.pid, detail
            ))
        }
    };
    tracing::warn!(pid = request.pid, session = %request.session, error = %error, "Helper failed");
    Err(error)
}
