//! Process liveness utilities for target pid checks.

use crate::credentials::Pid;

/// Check if a process with the given PID exists.
///
/// Uses `libc::kill(pid, 0)`. A process owned by another user (`EPERM`) still
/// counts as alive.
///
/// # Returns
/// * `true` - Process exists
/// * `false` - Process does not exist
pub fn is_process_alive(pid: Pid) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as i32, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
