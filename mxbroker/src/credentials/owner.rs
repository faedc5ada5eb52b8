//! Resolve the owner of a process from `/proc/<pid>/status`.

use std::path::{Path, PathBuf};

use super::{Pid, UserCredentials};
use crate::errors::{BrokerError, BrokerResult};

const DEFAULT_PROC_ROOT: &str = "/proc";

/// Reads process status text and extracts the owning uid and gid.
#[derive(Debug, Clone)]
pub struct ProcessOwnerResolver {
    proc_root: PathBuf,
}

impl Default for ProcessOwnerResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessOwnerResolver {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
        }
    }

    /// Resolver reading from an alternate procfs mount.
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    /// Resolve the credentials of `pid`.
    ///
    /// # Errors
    ///
    /// Returns `ProcessIo` if the status file cannot be read or lacks a
    /// `Uid:` or `Gid:` line.
    pub fn resolve(&self, pid: Pid) -> BrokerResult<UserCredentials> {
        let status_path = self.proc_root.join(pid.to_string()).join("status");
        let status = std::fs::read_to_string(&status_path).map_err(|e| {
            BrokerError::ProcessIo(format!("failed to read {}: {}", status_path.display(), e))
        })?;
        let creds = parse_status(pid, &status)?;
        tracing::debug!(pid = pid, uid = creds.uid(), gid = creds.gid(), "Resolved process owner");
        Ok(creds)
    }
}

/// Parse procfs status text into credentials.
///
/// Takes the first value of the `Uid:` and `Gid:` lines (the real ids).
pub fn parse_status(pid: Pid, status: &str) -> BrokerResult<UserCredentials> {
    let mut uid = None;
    let mut gid = None;

    for line in status.lines() {
        if uid.is_none()
            && let Some(rest) = line.strip_prefix("Uid:")
        {
            uid = Some(first_id(pid, "Uid", rest)?);
        } else if gid.is_none()
            && let Some(rest) = line.strip_prefix("Gid:")
        {
            gid = Some(first_id(pid, "Gid", rest)?);
        }
    }

    match (uid, gid) {
        (Some(uid), Some(gid)) => Ok(UserCredentials::new(pid, uid, gid)),
        (None, _) => Err(BrokerError::ProcessIo(format!(
            "no Uid line in status of pid {}",
            pid
        ))),
        (_, None) => Err(BrokerError::ProcessIo(format!(
            "no Gid line in status of pid {}",
            pid
        ))),
    }
}

fn first_id(pid: Pid, field: &str, rest: &str) -> BrokerResult<u32> {
    let value = rest.split_whitespace().next().ok_or_else(|| {
        BrokerError::ProcessIo(format!("empty {} line in status of pid {}", field, pid))
    })?;
    value.parse::<u32>().map_err(|e| {
        BrokerError::ProcessIo(format!(
            "invalid {} value {:?} in status of pid {}: {}",
            field, value, pid, e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STATUS: &str = "Name:\tjava\nUmask:\t0022\nState:\tS (sleeping)\nTgid:\t8000\nPid:\t8000\nPPid:\t1\nUid:\t9000\t9000\t9000\t9000\nGid:\t9001\t9001\t9001\t9001\nGroups:\t9001 10\n";

    #[test]
    fn test_parse_status_first_values() {
        let creds = parse_status(8000, "Uid:\t500\t0\t0\t0\nGid:\t600\t0\t0\t0\n").unwrap();
        assert_eq!(creds, UserCredentials::new(8000, 500, 600));
    }

    #[test]
    fn test_parse_status_missing_uid() {
        let err = parse_status(8000, "Name:\tjava\nGid:\t9001\t9001\t9001\t9001\n").unwrap_err();
        assert!(matches!(err, BrokerError::ProcessIo(ref m) if m.contains("Uid")));
    }

    #[test]
    fn test_parse_status_missing_gid() {
        let err = parse_status(8000, "Uid:\t9000\t9000\t9000\t9000\n").unwrap_err();
        assert!(matches!(err, BrokerError::ProcessIo(ref m) if m.contains("Gid")));
    }

    #[test]
    fn test_parse_status_garbage_value() {
        let err = parse_status(8000, "Uid:\tabc\nGid:\t1\n").unwrap_err();
        assert!(matches!(err, BrokerError::ProcessIo(_)));
    }

    #[test]
    fn test_resolve_from_fake_proc_root() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("8000");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("status"), STATUS).unwrap();

        let resolver = ProcessOwnerResolver::with_proc_root(root.path());
        let creds = resolver.resolve(8000).unwrap();
        assert_eq!(creds, UserCredentials::new(8000, 9000, 9001));
    }

    #[test]
    fn test_resolve_missing_process() {
        let root = TempDir::new().unwrap();
        let resolver = ProcessOwnerResolver::with_proc_root(root.path());
        assert!(matches!(
            resolver.resolve(4242),
            Err(BrokerError::ProcessIo(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resolve_current_process() {
        let pid = std::process::id();
        let creds = ProcessOwnerResolver::new().resolve(pid).unwrap();
        assert_eq!(creds.pid(), pid);
        assert_eq!(creds.uid(), nix::unistd::getuid().as_raw());
        assert_eq!(creds.gid(), nix::unistd::getgid().as_raw());
    }
}
