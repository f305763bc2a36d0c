//! Client operations.
//!
//! Every operation opens its own connection, sends one request and drives
//! the message channel or chunk stream to completion. Results are reported
//! as a [`ClientOutcome`] so callers can tell a refusal or a user abort apart
//! from a failure.

use std::path::{Path, PathBuf};
use std::time::Duration;

use protocol::channel::{receive_message, receive_reply};
use protocol::chunk::{receive_file, send_file, Direction, Progress, TransferSession};
use protocol::error::{ProtocolError, Result};
use protocol::messages::{DirectoryListing, FileHeader, RequestEnvelope};
use protocol::DEFAULT_CHUNK_SIZE;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::files::sanitize_file_name;

/// Default time allowed for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a client operation.
#[derive(Debug)]
pub enum ClientOutcome<T> {
    /// The operation completed.
    Success(T),
    /// The server refused the request.
    Refused,
    /// The user cancelled the transfer.
    Cancelled {
        /// Bytes moved before the transfer stopped.
        transferred: u64,
    },
    /// The operation failed.
    Failed(ProtocolError),
}

impl<T> ClientOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ClientOutcome::Success(_))
    }

    /// The success value, if any.
    pub fn success(self) -> Option<T> {
        match self {
            ClientOutcome::Success(value) => Some(value),
            _ => None,
        }
    }
}

impl<T> From<Result<T>> for ClientOutcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => ClientOutcome::Success(value),
            Err(ProtocolError::ConnectionRefused) => ClientOutcome::Refused,
            Err(ProtocolError::TransferCancelled { transferred }) => {
                ClientOutcome::Cancelled { transferred }
            }
            Err(e) => ClientOutcome::Failed(e),
        }
    }
}

/// Client for one remote host.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    /// `host:port` of the server.
    address: String,
    connect_timeout: Duration,
    chunk_size: usize,
}

impl RemoteClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Client using the `[client]` and `[transfer]` settings.
    pub fn from_config(address: impl Into<String>, config: &Config) -> Self {
        Self::new(address)
            .with_connect_timeout(config.client.connect_timeout())
            .with_chunk_size(config.transfer.chunk_size)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                ProtocolError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    self.address, self.connect_timeout
                ))
            })??;
        debug!(address = %self.address, "connected");
        Ok(stream)
    }

    /// List a directory on the server.
    ///
    /// A path the server cannot list fails with [`ProtocolError::NotFound`].
    pub async fn list_directory(&self, path: &str) -> ClientOutcome<DirectoryListing> {
        self.try_list_directory(path).await.into()
    }

    async fn try_list_directory(&self, path: &str) -> Result<DirectoryListing> {
        let mut stream = self.connect().await?;
        RequestEnvelope::list_directory(path)
            .write_to(&mut stream)
            .await?;

        let json = receive_message(&mut stream)
            .await?
            .ok_or_else(|| ProtocolError::NotFound(path.to_string()))?;
        DirectoryListing::from_json(&json)
    }

    /// Download `remote_path` into `dest_dir`, keeping the server's file name.
    ///
    /// On cancellation the destination keeps the bytes received so far.
    pub async fn pull_file<F>(
        &self,
        remote_path: &str,
        dest_dir: &Path,
        cancel: CancellationToken,
        on_progress: F,
    ) -> ClientOutcome<PathBuf>
    where
        F: FnMut(Progress),
    {
        self.try_pull_file(remote_path, dest_dir, cancel, on_progress)
            .await
            .into()
    }

    async fn try_pull_file<F>(
        &self,
        remote_path: &str,
        dest_dir: &Path,
        cancel: CancellationToken,
        on_progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(Progress),
    {
        let mut stream = self.connect().await?;
        RequestEnvelope::pull_file(remote_path)
            .write_to(&mut stream)
            .await?;

        let header = FileHeader::read_from(&mut stream)
            .await?
            .ok_or_else(|| ProtocolError::NotFound(remote_path.to_string()))?;
        let name = sanitize_file_name(&header.name)
            .map_err(|e| ProtocolError::ProtocolViolation(e.to_string()))?;

        let destination = dest_dir.join(name);
        let mut file = tokio::fs::File::create(&destination).await?;

        let mut session = TransferSession::new(Direction::Download, cancel)
            .with_total_size(header.size)
            .with_chunk_size(self.chunk_size);
        receive_file(&mut stream, &mut file, &mut session, on_progress).await?;

        info!(
            path = %destination.display(),
            bytes = session.transferred(),
            "pulled file"
        );
        Ok(destination)
    }

    /// Upload `local_file` into `remote_dir` on the server.
    ///
    /// Returns the number of bytes sent.
    pub async fn push_file<F>(
        &self,
        local_file: &Path,
        remote_dir: &str,
        cancel: CancellationToken,
        on_progress: F,
    ) -> ClientOutcome<u64>
    where
        F: FnMut(Progress),
    {
        self.try_push_file(local_file, remote_dir, cancel, on_progress)
            .await
            .into()
    }

    async fn try_push_file<F>(
        &self,
        local_file: &Path,
        remote_dir: &str,
        cancel: CancellationToken,
        on_progress: F,
    ) -> Result<u64>
    where
        F: FnMut(Progress),
    {
        let name = local_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                ProtocolError::NotFound(format!("{} has no file name", local_file.display()))
            })?;

        let mut file = tokio::fs::File::open(local_file).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProtocolError::NotFound(local_file.display().to_string())
            } else {
                e.into()
            }
        })?;
        let size = file.metadata().await?.len();

        let mut stream = self.connect().await?;
        RequestEnvelope::push_file(remote_dir, name)
            .write_to(&mut stream)
            .await?;

        let mut session = TransferSession::new(Direction::Upload, cancel)
            .with_total_size(size)
            .with_chunk_size(self.chunk_size);
        send_file(&mut stream, &mut file, &mut session, on_progress).await?;

        // The server closes once the file is stored, or answers REFUSE
        receive_reply(&mut stream).await?;

        info!(
            path = %local_file.display(),
            bytes = session.transferred(),
            "pushed file"
        );
        Ok(session.transferred())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_result() {
        assert!(ClientOutcome::from(Ok::<_, ProtocolError>(5)).is_success());
        assert!(matches!(
            ClientOutcome::<()>::from(Err(ProtocolError::ConnectionRefused)),
            ClientOutcome::Refused
        ));
        assert!(matches!(
            ClientOutcome::<()>::from(Err(ProtocolError::TransferCancelled { transferred: 3072 })),
            ClientOutcome::Cancelled { transferred: 3072 }
        ));
        assert!(matches!(
            ClientOutcome::<()>::from(Err(ProtocolError::MalformedFrame("x".into()))),
            ClientOutcome::Failed(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_outcome_success_value() {
        assert_eq!(ClientOutcome::Success(7).success(), Some(7));
        assert_eq!(ClientOutcome::<i32>::Refused.success(), None);
    }

    #[tokio::test]
    async fn test_connect_failure_is_failed() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RemoteClient::new(addr.to_string());
        assert!(matches!(
            client.list_directory("/").await,
            ClientOutcome::Failed(ProtocolError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_push_missing_local_file() {
        let client = RemoteClient::new("127.0.0.1:1");
        let outcome = client
            .push_file(
                Path::new("/definitely/not/here.bin"),
                "/tmp",
                CancellationToken::new(),
                |_| {},
            )
            .await;
        assert!(matches!(
            outcome,
            ClientOutcome::Failed(ProtocolError::NotFound(_))
        ));
    }

    #[test]
    fn test_client_defaults() {
        let client = RemoteClient::new("localhost:7005");
        assert_eq!(client.address(), "localhost:7005");
        assert_eq!(client.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(client.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_client_from_config() {
        let mut config = Config::default();
        config.client.connect_timeout_secs = 2;
        config.transfer.chunk_size = 4096;

        let client = RemoteClient::from_config("10.0.0.2:7005", &config);
        assert_eq!(client.connect_timeout, Duration::from_secs(2));
        assert_eq!(client.chunk_size, 4096);
    }
}
