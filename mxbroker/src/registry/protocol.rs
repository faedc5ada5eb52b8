//! Line-delimited JSON protocol spoken over a registry connection.
//!
//! One request object per line, answered by one response object per line.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::credentials::Pid;
use crate::errors::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Authenticate this connection against an exported session.
    Login { session: String },
    Attach,
    Detach,
    IsAttached,
    ConnectorAddress,
    /// Names of exported and bound sessions. Needs no login.
    List,
    /// Publish `name` as served by the registry listening on `addr`.
    Bind { name: String, addr: SocketAddr },
    /// Withdraw a binding. Only the identity that bound it may do so.
    Unbind { name: String },
    /// Address of the registry serving `name`.
    Lookup { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<Pid>,
}

impl From<&BrokerError> for WireError {
    fn from(e: &BrokerError) -> Self {
        let (message, pid) = match e {
            BrokerError::LaunchFailed(m)
            | BrokerError::HandshakeMalformed(m)
            | BrokerError::AuthenticationFailed(m)
            | BrokerError::AttachFailed(m)
            | BrokerError::ProcessIo(m)
            | BrokerError::Connection(m)
            | BrokerError::SessionClosed(m)
            | BrokerError::Interrupted(m)
            | BrokerError::Registry(m)
            | BrokerError::Ipc(m)
            | BrokerError::Config(m)
            | BrokerError::Internal(m) => (m.clone(), None),
            BrokerError::HandshakeTimeout { pid, .. }
            | BrokerError::NotAttached(pid)
            | BrokerError::UnknownConnection(pid)
            | BrokerError::NoSuchProcess(pid) => (e.to_string(), Some(*pid)),
        };
        Self {
            kind: e.kind().to_string(),
            message,
            pid,
        }
    }
}

impl From<WireError> for BrokerError {
    fn from(e: WireError) -> Self {
        let pid = e.pid.unwrap_or_default();
        match e.kind.as_str() {
            "authentication_failed" => BrokerError::AuthenticationFailed(e.message),
            "attach_failed" => BrokerError::AttachFailed(e.message),
            "process_io" => BrokerError::ProcessIo(e.message),
            "not_attached" => BrokerError::NotAttached(pid),
            "no_such_process" => BrokerError::NoSuchProcess(pid),
            "session_closed" => BrokerError::SessionClosed(e.message),
            "interrupted" => BrokerError::Interrupted(e.message),
            "registry" => BrokerError::Registry(e.message),
            "internal" => BrokerError::Internal(e.message),
            other => BrokerError::Registry(format!("{}: {}", other, e.message)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn ok(value: impl Into<Value>) -> Self {
        Self {
            ok: true,
            value: Some(value.into()),
            error: None,
        }
    }

    pub fn error(e: &BrokerError) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(e.into()),
        }
    }

    pub fn into_result(self) -> Result<Value, BrokerError> {
        match (self.ok, self.error) {
            (true, _) => Ok(self.value.unwrap_or(Value::Null)),
            (false, Some(e)) => Err(e.into()),
            (false, None) => Err(BrokerError::Registry(
                "error response without details".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let login = serde_json::to_string(&Request::Login {
            session: "s".into(),
        })
        .unwrap();
        assert_eq!(login, r#"{"op":"login","session":"s"}"#);
        assert_eq!(
            serde_json::from_str::<Request>(r#"{"op":"connector_address"}"#).unwrap(),
            Request::ConnectorAddress
        );
        assert!(serde_json::from_str::<Request>(r#"{"op":"shutdown"}"#).is_err());
        assert_eq!(
            serde_json::from_str::<Request>(
                r#"{"op":"bind","name":"s","addr":"127.0.0.1:41000"}"#
            )
            .unwrap(),
            Request::Bind {
                name: "s".into(),
                addr: "127.0.0.1:41000".parse().unwrap(),
            }
        );
    }

    #[test]
    fn test_error_kind_survives_the_wire() {
        let sent = BrokerError::NotAttached(8000);
        let response = Response::error(&sent);
        let json = serde_json::to_string(&response).unwrap();
        let parsed: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.into_result().unwrap_err(), sent);

        let sent = BrokerError::AuthenticationFailed("gid 1 does not own pid 8000".into());
        assert_eq!(
            Response::error(&sent).into_result().unwrap_err(),
            sent
        );
    }

    #[test]
    fn test_ok_value() {
        assert_eq!(
            Response::ok(true).into_result().unwrap(),
            Value::Bool(true)
        );
    }
}
