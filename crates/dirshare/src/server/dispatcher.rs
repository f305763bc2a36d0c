//! Request dispatcher.
//!
//! Handles exactly one request per connection: reads the request envelope,
//! consults the refusal policy, then answers a listing, streams a file out,
//! or receives a file.
//!
//! Reply rules:
//! - refused request: a `REFUSE` frame (pushes additionally drain the
//!   incoming chunks so the pusher can finish writing and read the reply)
//! - missing or unreadable path on a listing or pull: a `NULL` frame
//! - path outside the allowed paths: a `REFUSE` frame
//!
//! After a listing or pull the dispatcher waits for the peer to close the
//! connection, bounded by the idle timeout.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol::channel::{send_message, send_null, send_refusal, wait_for_closure};
use protocol::chunk::{receive_file, send_file, Direction, TransferSession, DEFAULT_CHUNK_SIZE};
use protocol::error::{ProtocolError, Result};
use protocol::messages::{Operation, RequestEnvelope};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::files::{BrowserError, DirectoryBrowser, FileStore, TransferError};

/// Decides, before any processing, whether a request gets a `REFUSE` reply.
pub trait RefusalPolicy: Send + Sync {
    fn should_refuse(&self, remote: SocketAddr, request: &RequestEnvelope) -> bool;
}

impl<F> RefusalPolicy for F
where
    F: Fn(SocketAddr, &RequestEnvelope) -> bool + Send + Sync,
{
    fn should_refuse(&self, remote: SocketAddr, request: &RequestEnvelope) -> bool {
        self(remote, request)
    }
}

/// Policy that serves every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl RefusalPolicy for AcceptAll {
    fn should_refuse(&self, _remote: SocketAddr, _request: &RequestEnvelope) -> bool {
        false
    }
}

/// Refuses every request from a fixed set of addresses, plus individual
/// pending refusals that are consumed by the first matching request.
#[derive(Debug, Default)]
pub struct RefusalList {
    addresses: HashSet<IpAddr>,
    pending: Mutex<HashSet<(IpAddr, RequestEnvelope)>>,
}

impl RefusalList {
    pub fn new(addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addresses: addresses.into_iter().collect(),
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Refuse the next occurrence of `request` from `address`.
    pub fn refuse_once(&self, address: IpAddr, request: &RequestEnvelope) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert((address, request.clone()));
        }
    }

    /// Number of pending one-shot refusals.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl RefusalPolicy for RefusalList {
    fn should_refuse(&self, remote: SocketAddr, request: &RequestEnvelope) -> bool {
        if self.addresses.contains(&remote.ip()) {
            return true;
        }
        self.pending
            .lock()
            .map(|mut pending| pending.remove(&(remote.ip(), request.clone())))
            .unwrap_or(false)
    }
}

/// Routes a connection's single request to the matching file operation.
pub struct RequestDispatcher {
    files: FileStore,
    policy: Arc<dyn RefusalPolicy>,
    chunk_size: usize,
    /// Bound on waiting for the peer to close. `None` waits indefinitely.
    idle_timeout: Option<Duration>,
}

impl RequestDispatcher {
    pub fn new(files: FileStore) -> Self {
        Self {
            files,
            policy: Arc::new(AcceptAll),
            chunk_size: DEFAULT_CHUNK_SIZE,
            idle_timeout: None,
        }
    }

    /// Build a dispatcher from the `[server]`, `[transfer]` and `[listing]`
    /// sections.
    pub fn from_config(config: &Config) -> Self {
        let browser = DirectoryBrowser::new(config.transfer.allowed_paths.clone())
            .with_dot_path(config.listing.dot_path);
        let files = FileStore::new(browser).with_overwrite(config.transfer.overwrite);
        let refused = RefusalList::new(config.server.refused_addresses.iter().copied());

        Self::new(files)
            .with_refusal_policy(Arc::new(refused))
            .with_chunk_size(config.transfer.chunk_size)
            .with_idle_timeout(config.server.idle_timeout())
    }

    pub fn with_refusal_policy(mut self, policy: Arc<dyn RefusalPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    /// Serve the single request carried by `stream`.
    ///
    /// Errors are local to this connection. Returning drops the stream,
    /// which closes the connection.
    pub async fn handle_connection<S>(
        &self,
        mut stream: S,
        remote: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request = RequestEnvelope::read_from(&mut stream).await?;
        debug!(request = %request, "received request");

        if self.policy.should_refuse(remote, &request) {
            info!(request = %request, "refusing request");
            return self.refuse(&mut stream, &request, cancel).await;
        }

        match request.operation {
            Operation::ListDirectory => self.list_directory(&mut stream, &request.path).await?,
            Operation::PullFile => self.pull_file(&mut stream, &request.path, cancel).await?,
            Operation::PushFile => {
                let file_name = request.file_name.as_deref().unwrap_or_default();
                return self
                    .push_file(&mut stream, &request.path, file_name, cancel)
                    .await;
            }
        }

        self.await_closure(&mut stream).await
    }

    async fn refuse<S>(
        &self,
        stream: &mut S,
        request: &RequestEnvelope,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        send_refusal(stream).await?;
        if request.operation == Operation::PushFile {
            self.drain_chunks(stream, cancel).await
        } else {
            self.await_closure(stream).await
        }
    }

    async fn list_directory<S>(&self, stream: &mut S, path: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match self.files.browser().list_directory(path) {
            Ok(listing) => send_message(stream, &listing.to_json()?).await,
            Err(BrowserError::PathOutsideBoundary(_)) => {
                info!(path, "listing outside allowed paths refused");
                send_refusal(stream).await
            }
            Err(e) if e.is_not_found() => {
                debug!(path, error = %e, "cannot list directory");
                send_null(stream).await
            }
            // Close without a reply; the peer sees the stream end
            Err(e) => Err(ProtocolError::Io(format!("listing {}: {}", path, e))),
        }
    }

    async fn pull_file<S>(&self, stream: &mut S, path: &str, cancel: CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut source = match self.files.open_source(path).await {
            Ok(source) => source,
            Err(TransferError::PathOutsideBoundary(_)) => {
                info!(path, "pull outside allowed paths refused");
                return send_refusal(stream).await;
            }
            Err(e) => {
                debug!(path, error = %e, "cannot open file for pull");
                return send_null(stream).await;
            }
        };

        source.header.write_to(stream).await?;

        let mut session = TransferSession::new(Direction::Download, cancel)
            .with_total_size(source.header.size)
            .with_chunk_size(self.chunk_size);
        send_file(stream, &mut source.file, &mut session, |_| {}).await?;

        info!(
            path = %source.path.display(),
            bytes = session.transferred(),
            "file sent"
        );
        Ok(())
    }

    async fn push_file<S>(
        &self,
        stream: &mut S,
        target_dir: &str,
        file_name: &str,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut destination = match self.files.create_destination(target_dir, file_name).await {
            Ok(destination) => destination,
            Err(TransferError::InvalidFileName(name)) => {
                send_refusal(stream).await?;
                self.drain_chunks(stream, cancel).await?;
                return Err(ProtocolError::ProtocolViolation(format!(
                    "invalid file name {:?}",
                    name
                )));
            }
            Err(e) => {
                warn!(target_dir, file_name, error = %e, "cannot create push destination");
                send_refusal(stream).await?;
                return self.drain_chunks(stream, cancel).await;
            }
        };

        let mut session = TransferSession::new(Direction::Upload, cancel);
        receive_file(stream, &mut destination.file, &mut session, |_| {}).await?;

        info!(
            path = %destination.path.display(),
            bytes = session.transferred(),
            "file received"
        );
        Ok(())
    }

    /// Read and discard a chunk stream up to its terminator.
    async fn drain_chunks<S>(&self, stream: &mut S, cancel: CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut session = TransferSession::new(Direction::Upload, cancel);
        receive_file(stream, &mut tokio::io::sink(), &mut session, |_| {}).await?;
        debug!(bytes = session.transferred(), "discarded refused upload");
        Ok(())
    }

    async fn await_closure<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Some(limit) = self.idle_timeout else {
            return wait_for_closure(stream).await;
        };

        if tokio::time::timeout(limit, wait_for_closure(stream))
            .await
            .is_err()
        {
            debug!(timeout_secs = limit.as_secs(), "peer kept connection open, closing");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::channel::{receive_message, receive_reply};
    use protocol::chunk::END_OF_TRANSMISSION;
    use protocol::messages::{DirectoryListing, FileHeader};
    use std::fs;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn remote() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn dispatcher() -> RequestDispatcher {
        RequestDispatcher::new(FileStore::new(DirectoryBrowser::allow_all()))
    }

    /// Run the dispatcher on one end of a pipe; returns the client end and
    /// the handler's join handle.
    fn serve(
        dispatcher: RequestDispatcher,
    ) -> (
        tokio::io::DuplexStream,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (client, server) = tokio::io::duplex(8192);
        let handle = tokio::spawn(async move {
            dispatcher
                .handle_connection(server, remote(), CancellationToken::new())
                .await
        });
        (client, handle)
    }

    async fn push_bytes(client: &mut tokio::io::DuplexStream, data: &[u8]) {
        for chunk in data.chunks(DEFAULT_CHUNK_SIZE) {
            client.write_i32(chunk.len() as i32).await.unwrap();
            client.write_all(chunk).await.unwrap();
        }
        client.write_i32(END_OF_TRANSMISSION).await.unwrap();
        client.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_directory() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("b.txt"), "b").unwrap();
        fs::create_dir(temp_dir.path().join("a_dir")).unwrap();

        let (mut client, handle) = serve(dispatcher());
        RequestEnvelope::list_directory(temp_dir.path().to_string_lossy())
            .write_to(&mut client)
            .await
            .unwrap();

        let json = receive_message(&mut client).await.unwrap().unwrap();
        let listing = DirectoryListing::from_json(&json).unwrap();
        assert_eq!(listing.entries()[0].name, "..");
        assert_eq!(listing.len(), 3);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_list_missing_directory_is_null() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing");

        let (mut client, handle) = serve(dispatcher());
        RequestEnvelope::list_directory(missing.to_string_lossy())
            .write_to(&mut client)
            .await
            .unwrap();

        assert_eq!(receive_message(&mut client).await.unwrap(), None);
        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_list_outside_allowed_paths_is_refused() {
        let allowed = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let dispatcher = RequestDispatcher::new(FileStore::new(DirectoryBrowser::new(vec![
            allowed.path().to_path_buf(),
        ])));

        let (mut client, handle) = serve(dispatcher);
        RequestEnvelope::list_directory(other.path().to_string_lossy())
            .write_to(&mut client)
            .await
            .unwrap();

        assert!(matches!(
            receive_message(&mut client).await,
            Err(ProtocolError::ConnectionRefused)
        ));
        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pull_file() {
        let temp_dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..5000).map(|i| (i % 256) as u8).collect();
        let path = temp_dir.path().join("data.bin");
        fs::write(&path, &data).unwrap();

        let (mut client, handle) = serve(dispatcher());
        RequestEnvelope::pull_file(path.to_string_lossy())
            .write_to(&mut client)
            .await
            .unwrap();

        let header = FileHeader::read_from(&mut client).await.unwrap().unwrap();
        assert_eq!(header, FileHeader::new(5000, "data.bin"));

        let mut received = Vec::new();
        let mut session = TransferSession::new(Direction::Download, CancellationToken::new());
        receive_file(&mut client, &mut received, &mut session, |_| {})
            .await
            .unwrap();
        assert_eq!(received, data);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pull_missing_file_is_null() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.bin");

        let (mut client, handle) = serve(dispatcher());
        RequestEnvelope::pull_file(missing.to_string_lossy())
            .write_to(&mut client)
            .await
            .unwrap();

        assert_eq!(FileHeader::read_from(&mut client).await.unwrap(), None);
        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_push_file() {
        let temp_dir = TempDir::new().unwrap();
        let data = vec![42u8; 3000];

        let (mut client, handle) = serve(dispatcher());
        RequestEnvelope::push_file(temp_dir.path().to_string_lossy(), "upload.bin")
            .write_to(&mut client)
            .await
            .unwrap();
        push_bytes(&mut client, &data).await;

        receive_reply(&mut client).await.unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(fs::read(temp_dir.path().join("upload.bin")).unwrap(), data);
    }

    #[tokio::test]
    async fn test_push_refused_by_policy() {
        let temp_dir = TempDir::new().unwrap();
        let policy = |_: SocketAddr, request: &RequestEnvelope| {
            request.operation == Operation::PushFile
        };
        let dispatcher = dispatcher().with_refusal_policy(Arc::new(policy));

        let (mut client, handle) = serve(dispatcher);
        RequestEnvelope::push_file(temp_dir.path().to_string_lossy(), "upload.bin")
            .write_to(&mut client)
            .await
            .unwrap();
        push_bytes(&mut client, &[1u8; 4000]).await;

        assert!(matches!(
            receive_reply(&mut client).await,
            Err(ProtocolError::ConnectionRefused)
        ));
        handle.await.unwrap().unwrap();
        assert!(!temp_dir.path().join("upload.bin").exists());
    }

    #[tokio::test]
    async fn test_push_invalid_name_is_violation() {
        let temp_dir = TempDir::new().unwrap();

        let (mut client, handle) = serve(dispatcher());
        RequestEnvelope::push_file(temp_dir.path().to_string_lossy(), "..")
            .write_to(&mut client)
            .await
            .unwrap();
        push_bytes(&mut client, b"data").await;

        assert!(matches!(
            receive_reply(&mut client).await,
            Err(ProtocolError::ConnectionRefused)
        ));
        assert!(matches!(
            handle.await.unwrap(),
            Err(ProtocolError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let (mut client, handle) = serve(dispatcher());
        client.write_i32(99).await.unwrap();

        assert!(matches!(
            handle.await.unwrap(),
            Err(ProtocolError::ProtocolViolation(_))
        ));

        // Server end is gone
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_idle_timeout_bounds_closure_wait() {
        let temp_dir = TempDir::new().unwrap();
        let dispatcher = dispatcher().with_idle_timeout(Some(Duration::from_millis(50)));

        let (mut client, handle) = serve(dispatcher);
        RequestEnvelope::list_directory(temp_dir.path().to_string_lossy())
            .write_to(&mut client)
            .await
            .unwrap();
        receive_message(&mut client).await.unwrap();

        // Client keeps its end open; the handler still finishes
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_from_config_refuses_configured_addresses() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.server.refused_addresses = vec![remote().ip()];

        let (mut client, handle) = serve(RequestDispatcher::from_config(&config));
        RequestEnvelope::list_directory(temp_dir.path().to_string_lossy())
            .write_to(&mut client)
            .await
            .unwrap();

        assert!(matches!(
            receive_message(&mut client).await,
            Err(ProtocolError::ConnectionRefused)
        ));
        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_refusal_list_addresses() {
        let blocked: IpAddr = "10.0.0.1".parse().unwrap();
        let list = RefusalList::new([blocked]);
        let request = RequestEnvelope::list_directory("/");

        assert!(list.should_refuse("10.0.0.1:1234".parse().unwrap(), &request));
        assert!(!list.should_refuse(remote(), &request));
    }

    #[test]
    fn test_refusal_list_pending_is_one_shot() {
        let list = RefusalList::default();
        let request = RequestEnvelope::pull_file("/srv/a.txt");
        list.refuse_once(remote().ip(), &request);
        assert_eq!(list.pending_len(), 1);

        let other = RequestEnvelope::pull_file("/srv/b.txt");
        assert!(!list.should_refuse(remote(), &other));
        assert!(list.should_refuse(remote(), &request));
        assert!(!list.should_refuse(remote(), &request));
        assert_eq!(list.pending_len(), 0);
    }

    #[test]
    fn test_refusal_list_pending_distinguishes_fields() {
        let list = RefusalList::default();
        list.refuse_once(remote().ip(), &RequestEnvelope::push_file("/a b", "c"));

        // Same words, split differently between directory and name
        assert!(!list.should_refuse(remote(), &RequestEnvelope::push_file("/a", "b c")));
        assert!(!list.should_refuse(remote(), &RequestEnvelope::list_directory("/a b")));
        assert_eq!(list.pending_len(), 1);
        assert!(list.should_refuse(remote(), &RequestEnvelope::push_file("/a b", "c")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_io_failure_closes_without_reply() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("a");
        let b = temp_dir.path().join("b");
        std::os::unix::fs::symlink(&b, &a).unwrap();
        std::os::unix::fs::symlink(&a, &b).unwrap();

        let (mut client, handle) = serve(dispatcher());
        RequestEnvelope::list_directory(a.to_string_lossy())
            .write_to(&mut client)
            .await
            .unwrap();

        // No NULL reply: the stream just ends
        assert!(matches!(
            receive_message(&mut client).await,
            Err(ProtocolError::MalformedFrame(_))
        ));
        assert!(matches!(
            handle.await.unwrap(),
            Err(ProtocolError::Io(_))
        ));
    }
}
