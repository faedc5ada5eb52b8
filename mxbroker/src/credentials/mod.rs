//! Process identity values.
//!
//! `UserCredentials` names a process together with the OS user and group that
//! own it. `ProcessOwnerResolver` derives it from the kernel's process status.

mod owner;

pub use owner::{ProcessOwnerResolver, parse_status};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process ID of a target VM.
pub type Pid = u32;

/// Owner of a process: pid plus numeric uid and gid.
///
/// Immutable value; equality is by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserCredentials {
    pid: Pid,
    uid: u32,
    gid: u32,
}

impl UserCredentials {
    pub fn new(pid: Pid, uid: u32, gid: u32) -> Self {
        Self { pid, uid, gid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }
}

impl fmt::Display for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid={} uid={} gid={}", self.pid, self.uid, self.gid)
    }
}
