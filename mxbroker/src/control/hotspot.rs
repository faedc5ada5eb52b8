//! HotSpot dynamic attach over the VM's Unix attach socket.
//!
//! The VM opens `<tmp>/.java_pid<pid>` after it finds an `.attach_pid<pid>`
//! file and receives `SIGQUIT`. Each command is one connection: protocol
//! version, command name and three arguments, all NUL-terminated. The reply
//! starts with a numeric result code line.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};

use super::attach::{AttachedVm, VmAttacher};
use crate::credentials::Pid;
use crate::errors::{BrokerError, BrokerResult};
use crate::util::is_process_alive;

const PROTOCOL_VERSION: &str = "1";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Attaches through the HotSpot attach listener.
#[derive(Debug, Clone)]
pub struct HotSpotAttacher {
    proc_root: PathBuf,
    timeout: Duration,
}

impl HotSpotAttacher {
    pub fn new(timeout: Duration) -> Self {
        Self::with_proc_root("/proc", timeout)
    }

    pub fn with_proc_root(proc_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            proc_root: proc_root.into(),
            timeout,
        }
    }

    /// Pid of the target inside its own pid namespace.
    fn namespace_pid(&self, pid: Pid) -> Pid {
        let status = self.proc_root.join(pid.to_string()).join("status");
        std::fs::read_to_string(status)
            .ok()
            .and_then(|content| {
                content
                    .lines()
                    .find_map(|line| line.strip_prefix("NSpid:"))
                    .and_then(|rest| rest.split_whitespace().last())
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(pid)
    }

    /// Temp directory as seen by the target, through its root if reachable.
    fn tmp_dir(&self, pid: Pid) -> PathBuf {
        let through_root = self.proc_root.join(pid.to_string()).join("root").join("tmp");
        if through_root.is_dir() {
            through_root
        } else {
            std::env::temp_dir()
        }
    }

    fn trigger_attach_listener(
        &self,
        pid: Pid,
        ns_pid: Pid,
        tmp_dir: &Path,
        socket: &Path,
    ) -> BrokerResult<()> {
        let name = format!(".attach_pid{}", ns_pid);
        let candidates = [
            self.proc_root.join(pid.to_string()).join("cwd").join(&name),
            tmp_dir.join(&name),
        ];
        let attach_file = candidates
            .into_iter()
            .find(|path| std::fs::File::create(path).is_ok())
            .ok_or_else(|| {
                BrokerError::AttachFailed(format!("cannot create attach file for pid {}", pid))
            })?;

        let result = self.signal_and_wait(pid, socket);
        let _ = std::fs::remove_file(&attach_file);
        result
    }

    fn signal_and_wait(&self, pid: Pid, socket: &Path) -> BrokerResult<()> {
        kill(nix::unistd::Pid::from_raw(pid as i32), Signal::SIGQUIT).map_err(|e| {
            BrokerError::AttachFailed(format!("failed to signal pid {}: {}", pid, e))
        })?;

        let deadline = Instant::now() + self.timeout;
        while !is_socket(socket) {
            if Instant::now() >= deadline {
                return Err(BrokerError::AttachFailed(format!(
                    "pid {} did not open {} within {}ms",
                    pid,
                    socket.display(),
                    self.timeout.as_millis()
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }
}

impl VmAttacher for HotSpotAttacher {
    fn attach(&self, pid: Pid) -> BrokerResult<Box<dyn AttachedVm>> {
        if !is_process_alive(pid) {
            return Err(BrokerError::AttachFailed(format!("no such process: {}", pid)));
        }

        let ns_pid = self.namespace_pid(pid);
        let tmp_dir = self.tmp_dir(pid);
        let socket = tmp_dir.join(format!(".java_pid{}", ns_pid));

        if !is_socket(&socket) {
            tracing::debug!(pid = pid, socket = %socket.display(), "Starting attach listener");
            self.trigger_attach_listener(pid, ns_pid, &tmp_dir, &socket)?;
        }

        tracing::info!(pid = pid, "Attached to VM");
        Ok(Box::new(HotSpotVm {
            pid,
            socket,
            timeout: self.timeout,
            attached: true,
        }))
    }
}

fn is_socket(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

/// VM reached through its attach socket.
#[derive(Debug)]
pub struct HotSpotVm {
    pid: Pid,
    socket: PathBuf,
    timeout: Duration,
    attached: bool,
}

impl HotSpotVm {
    /// Run one attach command, returning the result code and the output.
    fn execute(&self, command: &str, args: &[&str]) -> BrokerResult<(i32, String)> {
        if !self.attached {
            return Err(BrokerError::AttachFailed(format!(
                "pid {} is detached",
                self.pid
            )));
        }
        let io_err = |e: std::io::Error| {
            BrokerError::AttachFailed(format!("{} on pid {}: {}", command, self.pid, e))
        };

        let mut stream = UnixStream::connect(&self.socket).map_err(io_err)?;
        stream.set_read_timeout(Some(self.timeout)).map_err(io_err)?;

        let mut request = Vec::new();
        for part in [PROTOCOL_VERSION, command]
            .into_iter()
            .chain((0..3).map(|i| args.get(i).copied().unwrap_or("")))
        {
            request.extend_from_slice(part.as_bytes());
            request.push(0);
        }
        stream.write_all(&request).map_err(io_err)?;

        let mut response = String::new();
        stream.read_to_string(&mut response).map_err(io_err)?;

        let (code_line, output) = response.split_once('\n').unwrap_or((&response, ""));
        let code = code_line.trim().parse::<i32>().map_err(|_| {
            BrokerError::AttachFailed(format!(
                "{} on pid {}: unexpected reply {:?}",
                command, self.pid, code_line
            ))
        })?;
        Ok((code, output.to_string()))
    }
}

impl AttachedVm for HotSpotVm {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn agent_property(&mut self, key: &str) -> BrokerResult<Option<String>> {
        let (code, output) = self.execute("agentProperties", &[])?;
        if code != 0 {
            return Err(BrokerError::AttachFailed(format!(
                "agentProperties returned {}: {}",
                code,
                output.trim()
            )));
        }
        Ok(parse_properties(&output).remove(key))
    }

    fn start_local_management_agent(&mut self) -> BrokerResult<()> {
        let (code, output) = self.execute("jcmd", &["ManagementAgent.start_local"])?;
        if code != 0 {
            return Err(BrokerError::AttachFailed(format!(
                "ManagementAgent.start_local returned {}: {}",
                code,
                output.trim()
            )));
        }
        tracing::info!(pid = self.pid, "Local management agent started");
        Ok(())
    }

    fn detach(&mut self) -> BrokerResult<()> {
        // Commands use a connection each; nothing stays open.
        self.attached = false;
        Ok(())
    }
}

/// Parse `java.util.Properties` text output.
pub(crate) fn parse_properties(text: &str) -> HashMap<String, String> {
    let mut properties = HashMap::new();
    for line in text.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }

        let mut escaped = false;
        let split = line.char_indices().find(|&(_, c)| {
            let is_separator = !escaped && (c == '=' || c == ':');
            escaped = !escaped && c == '\\';
            is_separator
        });
        let (key, value) = match split {
            Some((i, _)) => (&line[..i], &line[i + 1..]),
            None => (line, ""),
        };
        properties.insert(
            unescape(key.trim_end()),
            unescape(value.trim_start()),
        );
    }
    properties
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\x0c'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push_str("\\u");
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::attach::LOCAL_CONNECTOR_ADDRESS;
    use std::os::unix::net::UnixListener;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    const ADDRESS: &str = "service:jmx:rmi://127.0.0.1/stub/rO0ABXNy";

    #[test]
    fn test_parse_properties() {
        let text = "#Agent properties\n#Mon Oct 19 10:00:00 UTC 2026\n\
                    sun.jvm.args=-Xmx1g\n\
                    com.sun.management.jmxremote.localConnectorAddress=service\\:jmx\\:rmi\\://127.0.0.1/stub/rO0ABXNy\n\
                    key\\=with\\=equals = value\\u0021\n\
                    empty\n";
        let props = parse_properties(text);
        assert_eq!(props[LOCAL_CONNECTOR_ADDRESS], ADDRESS);
        assert_eq!(props["sun.jvm.args"], "-Xmx1g");
        assert_eq!(props["key=with=equals"], "value!");
        assert_eq!(props["empty"], "");
        assert_eq!(props.len(), 4);
    }

    /// Minimal attach listener answering agentProperties and jcmd.
    fn serve(listener: UnixListener, started: Arc<AtomicBool>) {
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { return };
                let mut request = Vec::new();
                let mut byte = [0u8; 1];
                while request.iter().filter(|b| **b == 0).count() < 5 {
                    if stream.read(&mut byte).unwrap_or(0) == 0 {
                        break;
                    }
                    request.push(byte[0]);
                }
                let parts: Vec<String> = request
                    .split(|b| *b == 0)
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .collect();
                let reply = match parts[1].as_str() {
                    "agentProperties" if started.load(Ordering::SeqCst) => format!(
                        "0\n#Agent properties\n{}=service\\:jmx\\:rmi\\://127.0.0.1/stub/rO0ABXNy\n",
                        LOCAL_CONNECTOR_ADDRESS
                    ),
                    "agentProperties" => "0\n#Agent properties\nsun.java.command=App\n".to_string(),
                    "jcmd" if parts[2] == "ManagementAgent.start_local" => {
                        started.store(true, Ordering::SeqCst);
                        "0\n".to_string()
                    }
                    _ => "101\nunknown command\n".to_string(),
                };
                let _ = stream.write_all(reply.as_bytes());
            }
        });
    }

    fn fake_vm(dir: &TempDir) -> (HotSpotAttacher, Arc<AtomicBool>) {
        let pid = std::process::id();
        let proc_pid = dir.path().join(pid.to_string());
        let tmp = proc_pid.join("root").join("tmp");
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(proc_pid.join("status"), format!("Name:\tjava\nNSpid:\t{}\t1\n", pid))
            .unwrap();

        let listener = UnixListener::bind(tmp.join(".java_pid1")).unwrap();
        let started = Arc::new(AtomicBool::new(false));
        serve(listener, Arc::clone(&started));
        (
            HotSpotAttacher::with_proc_root(dir.path(), Duration::from_secs(2)),
            started,
        )
    }

    #[test]
    fn test_attach_and_start_agent() {
        let dir = TempDir::new().unwrap();
        let (attacher, started) = fake_vm(&dir);

        let mut vm = attacher.attach(std::process::id()).unwrap();
        assert_eq!(vm.agent_property(LOCAL_CONNECTOR_ADDRESS).unwrap(), None);

        vm.start_local_management_agent().unwrap();
        assert!(started.load(Ordering::SeqCst));
        assert_eq!(
            vm.agent_property(LOCAL_CONNECTOR_ADDRESS).unwrap().as_deref(),
            Some(ADDRESS)
        );

        vm.detach().unwrap();
        assert!(matches!(
            vm.agent_property(LOCAL_CONNECTOR_ADDRESS),
            Err(BrokerError::AttachFailed(_))
        ));
    }

    #[test]
    fn test_attach_dead_process() {
        let attacher = HotSpotAttacher::new(Duration::from_millis(100));
        assert!(matches!(
            attacher.attach(999_999_999),
            Err(BrokerError::AttachFailed(_))
        ));
    }

    #[test]
    fn test_namespace_pid_fallback() {
        let dir = TempDir::new().unwrap();
        let attacher = HotSpotAttacher::with_proc_root(dir.path(), Duration::from_millis(100));
        assert_eq!(attacher.namespace_pid(4242), 4242);
    }
}
