//! Default connector for local JMX endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;

use super::{JmxServiceUrl, ManagementConnection, ManagementConnector, MxConnection};
use crate::errors::{BrokerError, BrokerResult};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to endpoints published by a local management agent.
///
/// Only local addresses are accepted. When the URL names a port, the
/// endpoint must accept a TCP connection, which is held open for the life
/// of the connection.
#[derive(Debug, Clone)]
pub struct JmxConnector {
    connect_timeout: Duration,
}

impl Default for JmxConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl JmxConnector {
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ManagementConnector for JmxConnector {
    async fn connect(&self, url: &str) -> BrokerResult<MxConnection> {
        let url = JmxServiceUrl::parse(url)?;
        if !url.is_local() {
            return Err(BrokerError::Connection(format!(
                "refusing non-local endpoint {}",
                url
            )));
        }

        let stream = match url.port() {
            Some(port) => {
                let host = match url.host() {
                    "" | "localhost" => "127.0.0.1",
                    "[::1]" => "::1",
                    other => other,
                };
                let stream =
                    tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
                        .await
                        .map_err(|_| {
                            BrokerError::Connection(format!("timed out connecting to {}", url))
                        })?
                        .map_err(|e| {
                            BrokerError::Connection(format!("failed to connect to {}: {}", url, e))
                        })?;
                Some(stream)
            }
            None => None,
        };

        tracing::debug!(url = %url, reachable = stream.is_some(), "Management connection opened");
        Ok(MxConnection::new(JmxConnection {
            url,
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Connection handle produced by `JmxConnector`.
#[derive(Debug)]
pub struct JmxConnection {
    url: JmxServiceUrl,
    stream: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
}

impl ManagementConnection for JmxConnection {
    fn service_url(&self) -> &JmxServiceUrl {
        &self.url
    }

    fn close(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stream.lock().take();
        tracing::debug!(url = %self.url, "Management connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
