//! Server sockets pinned to the loopback interface.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::{TcpListener, TcpSocket};

use crate::errors::{BrokerError, BrokerResult};

/// Creates listeners bound to `127.0.0.1`, never to a wildcard address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackSocketFactory {
    port: u16,
    backlog: u32,
}

impl LoopbackSocketFactory {
    /// `backlog` 0 means the platform default.
    pub fn new(port: u16, backlog: u32) -> Self {
        Self { port, backlog }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn effective_backlog(&self) -> u32 {
        if self.backlog == 0 {
            libc::SOMAXCONN as u32
        } else {
            self.backlog
        }
    }

    pub fn bind(&self) -> BrokerResult<TcpListener> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port));
        let bind_err =
            |e: std::io::Error| BrokerError::Registry(format!("failed to bind {}: {}", addr, e));

        let socket = TcpSocket::new_v4().map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        socket.listen(self.effective_backlog()).map_err(bind_err)
    }
}
