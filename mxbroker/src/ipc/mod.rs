//! Side channel carrying handshakes from helpers back to the pool.
//!
//! The pool owns one named endpoint per in-flight launch. Whatever a helper
//! writes to it is handed, as opaque bytes, to a `HandshakeSink`.

mod unix;

pub use unix::{MAX_PAYLOAD_BYTES, UnixIpcService, send_handshake};

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::BrokerResult;

/// Receiver of raw handshake payloads.
pub trait HandshakeSink: Send + Sync {
    fn on_handshake_data(&self, raw: &[u8]);
}

/// Transport for the handshake side channel.
#[async_trait]
pub trait IpcService: Send + Sync {
    /// Open endpoint `name`. When `owner_uid` is set the endpoint must be
    /// usable by that user.
    async fn create_server(
        &self,
        name: &str,
        owner_uid: Option<u32>,
        sink: Arc<dyn HandshakeSink>,
    ) -> BrokerResult<()>;

    /// Close endpoint `name`. Unknown names are ignored.
    fn destroy_server(&self, name: &str);
}
