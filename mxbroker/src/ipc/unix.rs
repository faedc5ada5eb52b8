//! Unix domain socket implementation of the handshake side channel.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

use super::{HandshakeSink, IpcService};
use crate::errors::{BrokerError, BrokerResult};
use crate::options::{IpcConfig, ensure_shared_dir};
use crate::pool::HandshakeMessage;

/// Largest payload accepted from a helper.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

struct Endpoint {
    path: PathBuf,
    accept_task: JoinHandle<()>,
}

/// One listening socket per session in `socket_dir`.
///
/// Each accepted connection is read to EOF and the bytes forwarded to the
/// endpoint's sink.
pub struct UnixIpcService {
    socket_dir: PathBuf,
    endpoints: Mutex<HashMap<String, Endpoint>>,
}

impl UnixIpcService {
    pub fn new(config: &IpcConfig) -> Self {
        Self::with_socket_dir(config.socket_dir.clone())
    }

    pub fn with_socket_dir(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Names of open endpoints.
    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.lock().keys().cloned().collect()
    }

    fn socket_path(&self, name: &str) -> BrokerResult<PathBuf> {
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(BrokerError::Ipc(format!("invalid endpoint name {:?}", name)));
        }
        Ok(self.socket_dir.join(format!("{}.sock", name)))
    }

    /// Helpers running as other users must be able to reach their socket,
    /// and nobody but the broker may replace it.
    fn prepare_socket_dir(&self) -> BrokerResult<()> {
        ensure_shared_dir(&self.socket_dir)
    }
}

fn restrict_socket(path: &Path, owner_uid: Option<u32>) -> BrokerResult<()> {
    if let Some(uid) = owner_uid
        && nix::unistd::geteuid().is_root()
    {
        nix::unistd::chown(path, Some(nix::unistd::Uid::from_raw(uid)), None)
            .map_err(|e| BrokerError::Ipc(format!("failed to chown {}: {}", path.display(), e)))?;
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| BrokerError::Ipc(format!("failed to chmod {}: {}", path.display(), e)))
}

async fn accept_loop(name: String, listener: UnixListener, sink: Arc<dyn HandshakeSink>) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                tracing::warn!(session = %name, error = %e, "IPC accept failed");
                return;
            }
        };
        let sink = Arc::clone(&sink);
        let name = name.clone();
        tokio::spawn(async move {
            match read_payload(stream).await {
                Ok(payload) => {
                    tracing::trace!(session = %name, bytes = payload.len(), "IPC payload received");
                    sink.on_handshake_data(&payload);
                }
                Err(e) => tracing::warn!(session = %name, error = %e, "Dropped IPC payload"),
            }
        });
    }
}

async fn read_payload(stream: UnixStream) -> BrokerResult<Vec<u8>> {
    let mut payload = Vec::new();
    stream
        .take(MAX_PAYLOAD_BYTES as u64 + 1)
        .read_to_end(&mut payload)
        .await
        .map_err(|e| BrokerError::Ipc(format!("read failed: {}", e)))?;
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(BrokerError::Ipc(format!(
            "payload exceeds {} bytes",
            MAX_PAYLOAD_BYTES
        )));
    }
    Ok(payload)
}

#[async_trait]
impl IpcService for UnixIpcService {
    async fn create_server(
        &self,
        name: &str,
        owner_uid: Option<u32>,
        sink: Arc<dyn HandshakeSink>,
    ) -> BrokerResult<()> {
        let path = self.socket_path(name)?;
        if self.endpoints.lock().contains_key(name) {
            return Err(BrokerError::Ipc(format!("endpoint {} already exists", name)));
        }

        self.prepare_socket_dir()?;
        // A stale socket from a crashed broker blocks bind.
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }

        let listener = UnixListener::bind(&path)
            .map_err(|e| BrokerError::Ipc(format!("failed to bind {}: {}", path.display(), e)))?;
        if let Err(e) = restrict_socket(&path, owner_uid) {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        let accept_task = tokio::spawn(accept_loop(name.to_string(), listener, sink));
        tracing::debug!(session = %name, path = %path.display(), "IPC endpoint created");
        self.endpoints
            .lock()
            .insert(name.to_string(), Endpoint { path, accept_task });
        Ok(())
    }

    fn destroy_server(&self, name: &str) {
        let Some(endpoint) = self.endpoints.lock().remove(name) else {
            return;
        };
        endpoint.accept_task.abort();
        let _ = std::fs::remove_file(&endpoint.path);
        tracing::debug!(session = %name, "IPC endpoint destroyed");
    }
}

impl Drop for UnixIpcService {
    fn drop(&mut self) {
        for (_, endpoint) in self.endpoints.get_mut().drain() {
            endpoint.accept_task.abort();
            let _ = std::fs::remove_file(&endpoint.path);
        }
    }
}

/// Helper side: deliver a handshake to the endpoint named `session`.
pub async fn send_handshake(
    config: &IpcConfig,
    session: &str,
    message: &HandshakeMessage,
) -> BrokerResult<()> {
    let path = config.socket_path(session);
    let mut stream = UnixStream::connect(&path).await.map_err(|e| {
        BrokerError::Ipc(format!("failed to connect to {}: {}", path.display(), e))
    })?;
    stream
        .write_all(&message.to_bytes())
        .await
        .map_err(|e| BrokerError::Ipc(format!("failed to send handshake: {}", e)))?;
    stream
        .shutdown()
        .await
        .map_err(|e| BrokerError::Ipc(format!("failed to finish handshake: {}", e)))?;
    tracing::debug!(session = %session, pid = message.pid, "Handshake sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<Vec<u8>>);

    impl HandshakeSink for ChannelSink {
        fn on_handshake_data(&self, raw: &[u8]) {
            let _ = self.0.send(raw.to_vec());
        }
    }

    fn config(dir: &TempDir) -> IpcConfig {
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        IpcConfig {
            socket_dir: dir.path().join("ipc"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_handshake_reaches_sink() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let service = UnixIpcService::new(&config);
        let (tx, mut rx) = mpsc::unbounded_channel();

        service
            .create_server("s1", None, Arc::new(ChannelSink(tx)))
            .await
            .unwrap();
        assert_eq!(service.endpoints(), vec!["s1".to_string()]);

        let message = HandshakeMessage::new(8000, "service:jmx:rmi://127.0.0.1:1099/blah");
        send_handshake(&config, "s1", &message).await.unwrap();

        let raw = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(HandshakeMessage::parse(&raw).unwrap(), message);
    }

    #[tokio::test]
    async fn test_socket_dir_is_private_to_broker() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let service = UnixIpcService::new(&config);
        let (tx, _rx) = mpsc::unbounded_channel();
        service
            .create_server("s3", None, Arc::new(ChannelSink(tx)))
            .await
            .unwrap();

        let mode = std::fs::metadata(&config.socket_dir).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, crate::options::shared_dir_mode());
        let socket_mode = std::fs::metadata(config.socket_path("s3"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(socket_mode, 0o600);
    }

    #[tokio::test]
    async fn test_destroy_removes_socket() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let service = UnixIpcService::new(&config);
        let (tx, _rx) = mpsc::unbounded_channel();

        service
            .create_server("s2", None, Arc::new(ChannelSink(tx)))
            .await
            .unwrap();
        let path = config.socket_path("s2");
        assert!(path.exists());

        service.destroy_server("s2");
        assert!(!path.exists());
        assert!(service.endpoints().is_empty());

        let message = HandshakeMessage::new(8000, "service:jmx:rmi:///x");
        assert!(matches!(
            send_handshake(&config, "s2", &message).await,
            Err(BrokerError::Ipc(_))
        ));
        // Unknown names are ignored.
        service.destroy_server("s2");
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_names() {
        let dir = TempDir::new().unwrap();
        let service = UnixIpcService::new(&config(&dir));
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn HandshakeSink> = Arc::new(ChannelSink(tx));

        service.create_server("dup", None, sink.clone()).await.unwrap();
        assert!(service.create_server("dup", None, sink.clone()).await.is_err());
        assert!(service.create_server("../escape", None, sink).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_payload_dropped() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let service = UnixIpcService::new(&config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        service
            .create_server("big", None, Arc::new(ChannelSink(tx)))
            .await
            .unwrap();

        let mut stream = UnixStream::connect(config.socket_path("big")).await.unwrap();
        // Peer may close once the cap is hit.
        let _ = stream.write_all(&vec![b' '; MAX_PAYLOAD_BYTES + 10]).await;
        let _ = stream.shutdown().await;
        drop(stream);

        let received = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(received.is_err());
    }
}
