//! Handshake payload reported by a helper over the IPC side channel.
//!
//! Wire format: a JSON object with exactly the keys `pid` (integer) and
//! `jmxUrl` (string).

use serde::Serialize;
use serde_json::{Map, Value};

use crate::credentials::Pid;

const PID_KEY: &str = "pid";
const URL_KEY: &str = "jmxUrl";

/// Validated handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandshakeMessage {
    pub pid: Pid,
    #[serde(rename = "jmxUrl")]
    pub jmx_url: String,
}

/// Why a handshake was rejected.
///
/// `pid` is set when the payload still named a usable pid, so the failure
/// can be routed to the entry waiting for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeError {
    pub pid: Option<Pid>,
    pub reason: String,
}

impl HandshakeError {
    fn uncorrelated(reason: impl Into<String>) -> Self {
        Self {
            pid: None,
            reason: reason.into(),
        }
    }

    fn for_pid(pid: Pid, reason: impl Into<String>) -> Self {
        Self {
            pid: Some(pid),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "pid {}: {}", pid, self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

impl HandshakeMessage {
    pub fn new(pid: Pid, jmx_url: impl Into<String>) -> Self {
        Self {
            pid,
            jmx_url: jmx_url.into(),
        }
    }

    /// Strictly validate untrusted bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, HandshakeError> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| HandshakeError::uncorrelated(format!("invalid JSON: {}", e)))?;
        let Value::Object(object) = value else {
            return Err(HandshakeError::uncorrelated("payload is not a JSON object"));
        };

        let pid = parse_pid(&object)?;

        if let Some(extra) = object.keys().find(|k| *k != PID_KEY && *k != URL_KEY) {
            return Err(HandshakeError::for_pid(
                pid,
                format!("unexpected key {:?}", extra),
            ));
        }

        let jmx_url = match object.get(URL_KEY) {
            Some(Value::String(url)) if !url.is_empty() => url.clone(),
            Some(Value::String(_)) => return Err(HandshakeError::for_pid(pid, "jmxUrl is empty")),
            Some(Value::Null) | None => {
                return Err(HandshakeError::for_pid(pid, "jmxUrl is missing"));
            }
            Some(other) => {
                return Err(HandshakeError::for_pid(
                    pid,
                    format!("jmxUrl is not a string: {}", other),
                ));
            }
        };

        Ok(Self { pid, jmx_url })
    }

    /// Serialize for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        // A struct of a u32 and a String always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

fn parse_pid(object: &Map<String, Value>) -> Result<Pid, HandshakeError> {
    match object.get(PID_KEY) {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| Pid::try_from(v).ok())
            .filter(|pid| *pid > 0)
            .ok_or_else(|| HandshakeError::uncorrelated(format!("pid out of range: {}", n))),
        Some(Value::Null) | None => Err(HandshakeError::uncorrelated("pid is missing")),
        Some(other) => Err(HandshakeError::uncorrelated(format!(
            "pid is not an integer: {}",
            other
        ))),
    }
}
