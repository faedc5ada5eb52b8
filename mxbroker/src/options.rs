//! Broker and helper configuration.

use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{BrokerError, BrokerResult};

/// Default bound on a blocking `acquire`.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Helper binary launched for every new target pid.
pub const DEFAULT_HELPER_NAME: &str = "agent-proxy";

/// Prefix of per-launch session names.
pub const DEFAULT_SESSION_PREFIX: &str = "agent-proxy";

/// State directory of a broker running as root.
pub const ROOT_BASE_DIR: &str = "/run/mxbroker";

/// Options for a `ConnectionPool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerOptions {
    /// Directory holding the helper binary.
    pub bin_dir: PathBuf,
    /// File name of the helper inside `bin_dir`.
    pub helper_name: String,
    /// Upper bound on how long `acquire` waits for a handshake.
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,
    /// Prefix for session names handed to the helper.
    pub session_prefix: String,
    /// Where the IPC configuration shared with helpers is written.
    pub ipc_config_path: PathBuf,
    /// Side-channel and registry settings shared with helpers.
    pub ipc: IpcConfig,
    /// Daily-rolling log files go here when set.
    pub log_dir: Option<PathBuf>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        let base = default_base_dir();
        Self {
            bin_dir: std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from("/usr/libexec/mxbroker")),
            helper_name: DEFAULT_HELPER_NAME.to_string(),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            session_prefix: DEFAULT_SESSION_PREFIX.to_string(),
            ipc_config_path: base.join("ipc.json"),
            ipc: IpcConfig::default(),
            log_dir: None,
        }
    }
}

impl BrokerOptions {
    /// Full path of the helper binary.
    pub fn helper_path(&self) -> PathBuf {
        self.bin_dir.join(&self.helper_name)
    }

    /// Check preconditions before any process is launched.
    pub fn validate(&self) -> BrokerResult<()> {
        if !self.bin_dir.is_absolute() {
            return Err(BrokerError::Config(format!(
                "bin_dir must be absolute path, got: {}",
                self.bin_dir.display()
            )));
        }
        if !self.ipc_config_path.is_absolute() {
            return Err(BrokerError::Config(format!(
                "ipc_config_path must be absolute path, got: {}",
                self.ipc_config_path.display()
            )));
        }
        if let Some(log_dir) = &self.log_dir
            && !log_dir.is_absolute()
        {
            return Err(BrokerError::Config(format!(
                "log_dir must be absolute path, got: {}",
                log_dir.display()
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(BrokerError::Config(
                "acquire_timeout must be non-zero".into(),
            ));
        }
        if self.helper_name.is_empty() || self.helper_name.contains('/') {
            return Err(BrokerError::Config(format!(
                "invalid helper name: {:?}",
                self.helper_name
            )));
        }
        self.ipc.validate()
    }
}

/// Configuration shared between the broker and its helpers.
///
/// Persisted as JSON at the path passed to `agent-proxy` as `ipcConfigPath`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Directory holding one Unix socket per session.
    pub socket_dir: PathBuf,
    /// Loopback port of the pool's registry, where helpers bind sessions.
    ///
    /// The pool rewrites it with the port it actually bound. For a helper,
    /// 0 means there is no registry to bind into.
    pub registry_port: u16,
    /// How long a helper keeps its control session exported after the
    /// handshake before detaching on its own.
    pub linger_ms: u64,
    /// Bound on waiting for the target VM to open its attach socket.
    pub attach_timeout_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_base_dir().join("ipc"),
            registry_port: 0,
            linger_ms: 0,
            attach_timeout_ms: 10_000,
        }
    }
}

impl IpcConfig {
    /// Load a configuration written by the broker.
    pub fn load(path: &Path) -> BrokerResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            BrokerError::Config(format!("invalid IPC config {}: {}", path.display(), e))
        })
    }

    /// Persist this configuration for helpers to read.
    ///
    /// The file is world-readable and replaced atomically, inside a directory
    /// prepared by `ensure_shared_dir`.
    pub fn write(&self, path: &Path) -> BrokerResult<()> {
        let parent = path.parent().ok_or_else(|| {
            BrokerError::Config(format!("no parent directory for {}", path.display()))
        })?;
        ensure_shared_dir(parent)?;

        let json = serde_json::to_string_pretty(self)?;
        let staged = path.with_extension("json.tmp");
        let write_err =
            |e: std::io::Error| BrokerError::Config(format!("failed to write {}: {}", path.display(), e));
        std::fs::write(&staged, json).map_err(write_err)?;
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o644))
            .map_err(write_err)?;
        std::fs::rename(&staged, path).map_err(write_err)
    }

    pub fn validate(&self) -> BrokerResult<()> {
        if !self.socket_dir.is_absolute() {
            return Err(BrokerError::Config(format!(
                "socket_dir must be absolute path, got: {}",
                self.socket_dir.display()
            )));
        }
        Ok(())
    }

    /// Socket path of the endpoint named `session`.
    pub fn socket_path(&self, session: &str) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", session))
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }
}

/// Root uses a fixed root-owned directory; per-user runtime dirs are not
/// reachable by the helpers it launches as other users.
fn default_base_dir() -> PathBuf {
    if nix::unistd::geteuid().is_root() {
        return PathBuf::from(ROOT_BASE_DIR);
    }
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mxbroker")
}

/// Mode of directories holding state shared with helpers.
///
/// Helpers of a root broker run as other users and must traverse, never
/// list or write. Otherwise helpers run as the broker's own user.
pub fn shared_dir_mode() -> u32 {
    if nix::unistd::geteuid().is_root() {
        0o711
    } else {
        0o700
    }
}

/// Create `dir` if needed and make sure only the effective user controls it.
///
/// Refuses symlinks and directories owned by anyone else. As root, every
/// ancestor must be searchable by other users, or helpers could not reach
/// the files inside.
pub fn ensure_shared_dir(dir: &Path) -> BrokerResult<()> {
    let mode = shared_dir_mode();
    let euid = nix::unistd::geteuid();
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(dir)
        .map_err(|e| BrokerError::Config(format!("failed to create {}: {}", dir.display(), e)))?;

    let meta = std::fs::symlink_metadata(dir)
        .map_err(|e| BrokerError::Config(format!("failed to stat {}: {}", dir.display(), e)))?;
    if !meta.file_type().is_dir() {
        return Err(BrokerError::Config(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    if meta.uid() != euid.as_raw() {
        return Err(BrokerError::Config(format!(
            "{} is owned by uid {}, expected {}",
            dir.display(),
            meta.uid(),
            euid
        )));
    }
    if meta.mode() & 0o7777 != mode {
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode)).map_err(|e| {
            BrokerError::Config(format!("failed to chmod {}: {}", dir.display(), e))
        })?;
    }

    if euid.is_root() {
        for ancestor in dir.ancestors().skip(1) {
            let meta = std::fs::metadata(ancestor).map_err(|e| {
                BrokerError::Config(format!("failed to stat {}: {}", ancestor.display(), e))
            })?;
            if meta.mode() & 0o001 == 0 {
                return Err(BrokerError::Config(format!(
                    "{} is not searchable by helper users",
                    ancestor.display()
                )));
            }
        }
    }
    Ok(())
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Temp dir that helper users could traverse when running as root.
    fn shared_tempdir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        dir
    }

    #[test]
    fn test_defaults_validate() {
        let options = BrokerOptions::default();
        assert_eq!(options.acquire_timeout, Duration::from_secs(10));
        assert!(options.helper_path().ends_with("agent-proxy"));
        options.validate().unwrap();
    }

    #[test]
    fn test_relative_bin_dir_rejected() {
        let options = BrokerOptions {
            bin_dir: PathBuf::from("bin"),
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(BrokerError::Config(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let options = BrokerOptions {
            acquire_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(BrokerError::Config(_))));
    }

    #[test]
    fn test_ipc_config_write_then_load() {
        let dir = shared_tempdir();
        let path = dir.path().join("nested").join("ipc.json");
        let config = IpcConfig {
            socket_dir: dir.path().join("sockets"),
            registry_port: 41999,
            linger_ms: 250,
            attach_timeout_ms: 3_000,
        };
        config.write(&path).unwrap();

        let loaded = IpcConfig::load(&path).unwrap();
        assert_eq!(loaded, config);

        // Helpers running as other users read the file after dropping root.
        let file_mode = std::fs::metadata(&path).unwrap().mode() & 0o777;
        assert_eq!(file_mode, 0o644);
        let dir_mode = std::fs::metadata(path.parent().unwrap()).unwrap().mode() & 0o7777;
        assert_eq!(dir_mode, shared_dir_mode());
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(
            loaded.socket_path("agent-proxy-1"),
            dir.path().join("sockets").join("agent-proxy-1.sock")
        );
    }

    #[test]
    fn test_root_defaults_avoid_user_runtime_dir() {
        let options = BrokerOptions::default();
        if nix::unistd::geteuid().is_root() {
            assert!(options.ipc_config_path.starts_with(ROOT_BASE_DIR));
            assert!(options.ipc.socket_dir.starts_with(ROOT_BASE_DIR));
        } else {
            assert!(!options.ipc_config_path.starts_with(ROOT_BASE_DIR));
        }
    }

    #[test]
    fn test_shared_dir_tightens_mode() {
        let dir = shared_tempdir();
        let state = dir.path().join("state");
        std::fs::create_dir(&state).unwrap();
        std::fs::set_permissions(&state, std::fs::Permissions::from_mode(0o777)).unwrap();

        ensure_shared_dir(&state).unwrap();
        let mode = std::fs::metadata(&state).unwrap().mode() & 0o7777;
        assert_eq!(mode, shared_dir_mode());
    }

    #[test]
    fn test_shared_dir_owned_by_someone_else_is_refused() {
        if nix::unistd::geteuid().is_root() {
            let dir = shared_tempdir();
            let foreign = dir.path().join("foreign");
            std::fs::create_dir(&foreign).unwrap();
            nix::unistd::chown(&foreign, Some(nix::unistd::Uid::from_raw(65534)), None).unwrap();
            assert!(matches!(
                ensure_shared_dir(&foreign),
                Err(BrokerError::Config(_))
            ));
        } else {
            // The root directory belongs to root.
            assert!(matches!(
                ensure_shared_dir(Path::new("/")),
                Err(BrokerError::Config(_))
            ));
        }
    }

    #[test]
    fn test_shared_dir_refuses_symlink() {
        let dir = shared_tempdir();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        assert!(matches!(ensure_shared_dir(&link), Err(BrokerError::Config(_))));
    }

    #[test]
    fn test_relative_log_dir_rejected() {
        let options = BrokerOptions {
            log_dir: Some(PathBuf::from("logs")),
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(BrokerError::Config(_))));
    }

    #[test]
    fn test_ipc_config_missing_fields_use_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ipc.json");
        std::fs::write(&path, r#"{"registry_port": 1099}"#).unwrap();

        let loaded = IpcConfig::load(&path).unwrap();
        assert_eq!(loaded.registry_port, 1099);
        assert_eq!(loaded.attach_timeout_ms, 10_000);
    }

    #[test]
    fn test_ipc_config_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ipc.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(IpcConfig::load(&path), Err(BrokerError::Config(_))));
    }
}
