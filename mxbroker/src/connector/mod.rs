//! Management connections: turning a negotiated URL into a live handle.
//!
//! `ManagementConnector` is the seam the pool uses; `JmxConnector` is the
//! default implementation. Handles are shared as `MxConnection`, a cheap
//! clonable reference that compares by identity.

mod jmx;
mod url;

pub use jmx::{JmxConnection, JmxConnector};
pub use url::JmxServiceUrl;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::BrokerResult;

/// Connects to a management endpoint.
#[async_trait]
pub trait ManagementConnector: Send + Sync {
    async fn connect(&self, url: &str) -> BrokerResult<MxConnection>;
}

/// A live management channel.
pub trait ManagementConnection: Send + Sync + fmt::Debug {
    fn service_url(&self) -> &JmxServiceUrl;

    /// Tear the channel down. Called once by the pool when the last
    /// reference is released.
    fn close(&self) -> BrokerResult<()>;

    fn is_closed(&self) -> bool;
}

/// Shared handle to a pooled management connection.
///
/// Every caller that acquired the same pid holds a clone of the same handle.
#[derive(Clone)]
pub struct MxConnection {
    inner: Arc<dyn ManagementConnection>,
}

impl MxConnection {
    pub fn new(connection: impl ManagementConnection + 'static) -> Self {
        Self {
            inner: Arc::new(connection),
        }
    }

    /// Whether both handles refer to the same underlying connection.
    pub fn same_as(&self, other: &MxConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn service_url(&self) -> &JmxServiceUrl {
        self.inner.service_url()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub(crate) fn close(&self) -> BrokerResult<()> {
        self.inner.close()
    }
}

impl fmt::Debug for MxConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MxConnection").field(&self.inner).finish()
    }
}
