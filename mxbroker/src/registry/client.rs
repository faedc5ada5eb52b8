//! Client side of the registry protocol.

use std::net::SocketAddr;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::protocol::{Request, Response};
use crate::errors::{BrokerError, BrokerResult};

/// Connection to a `LocalCallRegistry`.
pub struct RemoteControlClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RemoteControlClient {
    /// Connect to a registry. Only loopback addresses are accepted.
    pub async fn connect(addr: SocketAddr) -> BrokerResult<Self> {
        if !addr.ip().is_loopback() {
            return Err(BrokerError::Registry(format!(
                "registry address {} is not local",
                addr
            )));
        }
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| BrokerError::Registry(format!("failed to connect to {}: {}", addr, e)))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn call(&mut self, request: &Request) -> BrokerResult<Value> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| BrokerError::Registry(format!("send failed: {}", e)))?;

        let reply = self
            .lines
            .next_line()
            .await
            .map_err(|e| BrokerError::Registry(format!("receive failed: {}", e)))?
            .ok_or_else(|| BrokerError::Registry("registry closed the connection".into()))?;
        let response: Response = serde_json::from_str(&reply)
            .map_err(|e| BrokerError::Registry(format!("bad response: {}", e)))?;
        response.into_result()
    }

    /// Log in to `session`. Returns the authenticated principal name.
    pub async fn login(&mut self, session: &str) -> BrokerResult<String> {
        let value = self
            .call(&Request::Login {
                session: session.to_string(),
            })
            .await?;
        expect_string(value)
    }

    pub async fn attach(&mut self) -> BrokerResult<()> {
        self.call(&Request::Attach).await.map(|_| ())
    }

    pub async fn detach(&mut self) -> BrokerResult<()> {
        self.call(&Request::Detach).await.map(|_| ())
    }

    pub async fn is_attached(&mut self) -> BrokerResult<bool> {
        self.call(&Request::IsAttached)
            .await?
            .as_bool()
            .ok_or_else(|| BrokerError::Registry("is_attached reply is not a boolean".into()))
    }

    pub async fn get_connector_address(&mut self) -> BrokerResult<String> {
        expect_string(self.call(&Request::ConnectorAddress).await?)
    }

    /// Look `session` up at the registry on `registry`, then connect to the
    /// registry serving it and log in. Returns the client and the principal.
    pub async fn open_session(registry: SocketAddr, session: &str) -> BrokerResult<(Self, String)> {
        let addr = Self::connect(registry).await?.lookup(session).await?;
        let mut client = Self::connect(addr).await?;
        let principal = client.login(session).await?;
        Ok((client, principal))
    }

    /// Address of the registry serving `session`.
    pub async fn lookup(&mut self, session: &str) -> BrokerResult<SocketAddr> {
        let value = self
            .call(&Request::Lookup {
                name: session.to_string(),
            })
            .await?;
        expect_string(value)?
            .parse()
            .map_err(|e| BrokerError::Registry(format!("bad lookup reply: {}", e)))
    }

    /// Publish `session` as served by the registry on `addr`.
    pub async fn bind(&mut self, session: &str, addr: SocketAddr) -> BrokerResult<()> {
        self.call(&Request::Bind {
            name: session.to_string(),
            addr,
        })
        .await
        .map(|_| ())
    }

    pub async fn unbind(&mut self, session: &str) -> BrokerResult<()> {
        self.call(&Request::Unbind {
            name: session.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn list(&mut self) -> BrokerResult<Vec<String>> {
        let value = self.call(&Request::List).await?;
        serde_json::from_value(value)
            .map_err(|e| BrokerError::Registry(format!("bad session list: {}", e)))
    }
}

fn expect_string(value: Value) -> BrokerResult<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(BrokerError::Registry(format!(
            "expected a string reply, got {}",
            other
        ))),
    }
}
