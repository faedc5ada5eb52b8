//! OS identity of the process on the other end of a connection.

use std::net::SocketAddr;

use nix::unistd::{Gid, Uid, User};

/// Identity fields reported by a transport. Any field may be unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerCredentials {
    pub username: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl PeerCredentials {
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.uid.is_none() && self.gid.is_none()
    }

    /// Fill in username and primary gid for `uid` from the user database.
    ///
    /// Unknown users keep only the uid, which is not enough to log in.
    pub fn from_uid(uid: u32) -> Self {
        match User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(user)) => Self {
                username: Some(user.name),
                uid: Some(uid),
                gid: Some(user.gid.as_raw()),
            },
            Ok(None) => {
                tracing::debug!(uid = uid, "No user database entry for peer uid");
                Self {
                    uid: Some(uid),
                    ..Default::default()
                }
            }
            Err(e) => {
                tracing::warn!(uid = uid, error = %e, "User database lookup failed");
                Self {
                    uid: Some(uid),
                    ..Default::default()
                }
            }
        }
    }
}

/// Identity of the running process: real uid, real gid and the user name.
pub fn current_process_identity() -> PeerCredentials {
    let uid = nix::unistd::getuid();
    let gid: Gid = nix::unistd::getgid();
    let username = User::from_uid(uid).ok().flatten().map(|u| u.name);
    PeerCredentials {
        username,
        uid: Some(uid.as_raw()),
        gid: Some(gid.as_raw()),
    }
}

/// Looks up the identity behind an accepted connection.
pub trait PeerCredentialsSource: Send + Sync {
    /// `local` is our end of the connection, `peer` the remote end.
    fn peer_credentials(&self, local: SocketAddr, peer: SocketAddr) -> PeerCredentials;
}

/// Finds the owner of a loopback TCP peer in `/proc/net/tcp{,6}`.
///
/// Both ends of a loopback connection live on this host, so the kernel's
/// socket table lists the peer's socket with its owning uid.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct ProcNetTcpPeerCredentials {
    proc_root: std::path::PathBuf,
}

#[cfg(target_os = "linux")]
impl Default for ProcNetTcpPeerCredentials {
    fn default() -> Self {
        Self {
            proc_root: std::path::PathBuf::from("/proc"),
        }
    }
}

#[cfg(target_os = "linux")]
impl ProcNetTcpPeerCredentials {
    pub fn with_proc_root(proc_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// Owner uid of the socket bound at `peer` and connected to `local`.
    pub fn lookup_uid(&self, local: SocketAddr, peer: SocketAddr) -> Option<u32> {
        let table = match peer {
            SocketAddr::V4(_) => "tcp",
            SocketAddr::V6(_) => "tcp6",
        };
        let path = self.proc_root.join("net").join(table);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Cannot read socket table");
                return None;
            }
        };
        find_socket_uid(&content, peer, local)
    }
}

#[cfg(target_os = "linux")]
impl PeerCredentialsSource for ProcNetTcpPeerCredentials {
    fn peer_credentials(&self, local: SocketAddr, peer: SocketAddr) -> PeerCredentials {
        match self.lookup_uid(local, peer) {
            Some(uid) => PeerCredentials::from_uid(uid),
            None => PeerCredentials::default(),
        }
    }
}

/// Scan a procfs socket table for the socket `sock_local` -> `sock_remote`.
#[cfg(target_os = "linux")]
fn find_socket_uid(table: &str, sock_local: SocketAddr, sock_remote: SocketAddr) -> Option<u32> {
    // sl local_address rem_address st tx_queue:rx_queue tr:tm->when retrnsmt uid ...
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return None;
        }
        let local = parse_proc_addr(fields[1])?;
        let remote = parse_proc_addr(fields[2])?;
        if local == sock_local && remote == sock_remote {
            fields[7].parse().ok()
        } else {
            None
        }
    })
}

/// Decode `0100007F:1F90` style addresses. Address words are printed in host
/// byte order, ports in network order.
#[cfg(target_os = "linux")]
fn parse_proc_addr(field: &str) -> Option<SocketAddr> {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    let (addr_hex, port_hex) = field.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    let ip = match addr_hex.len() {
        8 => {
            let word = u32::from_str_radix(addr_hex, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&addr_hex[i * 8..(i + 1) * 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}
