//! Per-pid synchronization object for one in-flight launch.

use tokio::sync::watch;

use crate::credentials::Pid;
use crate::errors::{BrokerError, BrokerResult};

/// How a pending entry ended, as seen by callers that joined it late.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// A pooled connection now exists for the pid.
    Connected,
    Failed(BrokerError),
}

/// Single-use gate correlating one launch with its handshake.
///
/// The gate opens exactly once, with either a management URL or a failure.
/// Later attempts to post a result are ignored and reported as `false`.
#[derive(Debug)]
pub struct PoolEntry {
    pid: Pid,
    session: String,
    gate: watch::Sender<Option<BrokerResult<String>>>,
    settled: watch::Sender<Option<Settlement>>,
}

impl PoolEntry {
    pub fn new(pid: Pid, session: impl Into<String>) -> Self {
        Self {
            pid,
            session: session.into(),
            gate: watch::Sender::new(None),
            settled: watch::Sender::new(None),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// IPC endpoint the helper reports to.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Open the gate with a URL. Returns `false` if it was already open.
    pub fn set_result(&self, url: String) -> bool {
        self.open(Ok(url))
    }

    /// Open the gate with a failure. Returns `false` if it was already open.
    pub fn set_failure(&self, error: BrokerError) -> bool {
        self.open(Err(error))
    }

    fn open(&self, outcome: BrokerResult<String>) -> bool {
        let mut outcome = Some(outcome);
        self.gate.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    pub fn is_released(&self) -> bool {
        self.gate.borrow().is_some()
    }

    /// Wait until the gate opens.
    pub async fn wait(&self) -> BrokerResult<String> {
        let mut rx = self.gate.subscribe();
        let opened = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| BrokerError::Internal("pool entry gate dropped".into()))?;
        match &*opened {
            Some(outcome) => outcome.clone(),
            None => Err(BrokerError::Internal("pool entry gate empty".into())),
        }
    }

    /// Record the final outcome for followers. Only the first call counts.
    pub(crate) fn settle(&self, settlement: Settlement) {
        let mut settlement = Some(settlement);
        self.settled.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = settlement.take();
            true
        });
    }

    /// Wait for the owning acquire to finish with this entry.
    pub async fn settled(&self) -> Settlement {
        let mut rx = self.settled.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(settled) => settled
                .clone()
                .unwrap_or(Settlement::Failed(BrokerError::Internal(
                    "pool entry settlement empty".into(),
                ))),
            Err(_) => Settlement::Failed(BrokerError::Internal(
                "pool entry settlement dropped".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_gate_opens_once() {
        let entry = PoolEntry::new(8000, "s");
        assert!(!entry.is_released());
        assert!(entry.set_result("service:jmx:rmi:///a".into()));
        assert!(!entry.set_result("service:jmx:rmi:///b".into()));
        assert!(!entry.set_failure(BrokerError::LaunchFailed("late".into())));
        assert!(entry.is_released());
        assert_eq!(entry.wait().await.unwrap(), "service:jmx:rmi:///a");
    }

    #[tokio::test]
    async fn test_failure_first_wins() {
        let entry = PoolEntry::new(8000, "s");
        assert!(entry.set_failure(BrokerError::LaunchFailed("exit 1".into())));
        assert!(!entry.set_result("service:jmx:rmi:///a".into()));
        assert_eq!(
            entry.wait().await,
            Err(BrokerError::LaunchFailed("exit 1".into()))
        );
    }

    #[tokio::test]
    async fn test_waiter_released_from_other_task() {
        let entry = Arc::new(PoolEntry::new(8000, "s"));
        let waiter = {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move { entry.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        entry.set_result("service:jmx:rmi:///a".into());
        assert_eq!(waiter.await.unwrap().unwrap(), "service:jmx:rmi:///a");
    }

    #[tokio::test]
    async fn test_wait_times_out_while_closed() {
        let entry = PoolEntry::new(8000, "s");
        let waited = tokio::time::timeout(Duration::from_millis(50), entry.wait()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_settle_only_first() {
        let entry = PoolEntry::new(8000, "s");
        entry.settle(Settlement::Connected);
        entry.settle(Settlement::Failed(BrokerError::Internal("x".into())));
        assert_eq!(entry.settled().await, Settlement::Connected);
    }
}
