//! agent-proxy: attaches to a VM as its owner and reports the management
//! address back to the broker.
//!
//! Exits 0 once the handshake has been delivered and the session detached.
//! Failures exit with the code from `launcher::exit_code` for their kind so
//! the broker can tell authentication, attach and process errors apart.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use nix::unistd::{Uid, User};

use mxbroker::{AgentProxy, BrokerError, BrokerResult, IpcConfig, Pid, launcher, logging};

#[derive(Parser, Debug)]
#[command(name = "agent-proxy", version, about = "Privileged attach helper for mxbroker")]
struct Args {
    /// Target VM process id
    pid: Pid,

    /// Owner of the target; privileges are dropped to this user when run as root
    target_user: String,

    /// IPC configuration written by the broker
    ipc_config_path: PathBuf,

    /// IPC endpoint to report the handshake to; also the exported session name
    session_name: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init_stderr_logging();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, kind = e.kind(), "agent-proxy failed");
            ExitCode::from(launcher::exit_code_for(&e))
        }
    }
}

fn run(args: Args) -> BrokerResult<()> {
    // Before any runtime threads exist.
    drop_privileges(&args.target_user)?;

    let config = IpcConfig::load(&args.ipc_config_path)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| BrokerError::Internal(format!("failed to start runtime: {}", e)))?;
    runtime.block_on(AgentProxy::new(args.pid, args.session_name, config).run())
}

fn drop_privileges(target_user: &str) -> BrokerResult<()> {
    if !nix::unistd::geteuid().is_root() {
        return Ok(());
    }

    let user = lookup_user(target_user)?;
    if user.uid.is_root() {
        return Err(BrokerError::Config(format!(
            "refusing to run as root for target user {}",
            target_user
        )));
    }

    let err = |what: &str, e: nix::Error| {
        BrokerError::Config(format!("{} for {} failed: {}", what, user.name, e))
    };
    #[cfg(target_os = "linux")]
    nix::unistd::setgroups(&[user.gid]).map_err(|e| err("setgroups", e))?;
    nix::unistd::setgid(user.gid).map_err(|e| err("setgid", e))?;
    nix::unistd::setuid(user.uid).map_err(|e| err("setuid", e))?;

    if nix::unistd::geteuid().is_root() || nix::unistd::getuid().is_root() {
        return Err(BrokerError::Config("still running as root".into()));
    }
    tracing::debug!(user = %user.name, uid = user.uid.as_raw(), "Dropped privileges");
    Ok(())
}

/// Resolve by name, falling back to a numeric uid.
fn lookup_user(target_user: &str) -> BrokerResult<User> {
    let by_name = User::from_name(target_user)
        .map_err(|e| BrokerError::Config(format!("user lookup failed: {}", e)))?;
    if let Some(user) = by_name {
        return Ok(user);
    }
    let uid: u32 = target_user
        .parse()
        .map_err(|_| BrokerError::Config(format!("unknown user {}", target_user)))?;
    User::from_uid(Uid::from_raw(uid))
        .map_err(|e| BrokerError::Config(format!("user lookup failed: {}", e)))?
        .ok_or_else(|| BrokerError::Config(format!("unknown uid {}", uid)))
}
