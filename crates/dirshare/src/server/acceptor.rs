//! Bounded TCP acceptor.
//!
//! One accept loop plus at most `max_connections` handler tasks. A slot is
//! taken from a counting semaphore *before* `accept()` is called, so a full
//! pool throttles accepting instead of rejecting connections; pending
//! clients wait in the listen backlog.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use protocol::error::Result as ProtocolResult;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use super::dispatcher::RequestDispatcher;

/// Largest accepted value for `max_connections`.
pub const MAX_CONNECTIONS_LIMIT: usize = 1024;

/// Pause after a failed `accept()` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Serves one accepted connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Handle a connection until it is done.
    ///
    /// `cancel` fires when the acceptor stops.
    fn handle<'a>(
        &'a self,
        stream: TcpStream,
        remote: SocketAddr,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ProtocolResult<()>> + Send + 'a>>;
}

impl ConnectionHandler for RequestDispatcher {
    fn handle<'a>(
        &'a self,
        stream: TcpStream,
        remote: SocketAddr,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ProtocolResult<()>> + Send + 'a>> {
        Box::pin(self.handle_connection(stream, remote, cancel))
    }
}

/// Acceptor errors.
#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("max_connections must be between 1 and 1024, got {0}")]
    InvalidMaxConnections(usize),

    #[error("acceptor is already stopped")]
    AlreadyStopped,
}

/// Externally visible acceptor state. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    Listening,
    Stopped,
}

/// Accepts TCP connections and runs a bounded number of handlers at once.
pub struct BoundedAcceptor {
    local_addr: SocketAddr,
    max_connections: usize,
    state: Arc<RwLock<AcceptorState>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl BoundedAcceptor {
    /// Bind `addr` and start accepting.
    ///
    /// Port 0 binds an ephemeral port; see [`BoundedAcceptor::local_addr`].
    pub async fn start(
        addr: SocketAddr,
        max_connections: usize,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self, AcceptorError> {
        if max_connections == 0 || max_connections > MAX_CONNECTIONS_LIMIT {
            return Err(AcceptorError::InvalidMaxConnections(max_connections));
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| AcceptorError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| AcceptorError::Bind { addr, source })?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let slots = Arc::new(Semaphore::new(max_connections));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            slots,
            handler,
            shutdown.clone(),
            tracker.clone(),
        ));

        info!(%local_addr, max_connections, "listening");

        Ok(Self {
            local_addr,
            max_connections,
            state: Arc::new(RwLock::new(AcceptorState::Listening)),
            shutdown,
            tracker,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub async fn state(&self) -> AcceptorState {
        *self.state.read().await
    }

    /// Number of handler tasks currently running.
    pub fn active_connections(&self) -> usize {
        self.tracker.len()
    }

    /// Token cancelled when the acceptor stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close the listener, cancel in-flight handlers and wait for them.
    ///
    /// Fails with [`AcceptorError::AlreadyStopped`] on a second call.
    pub async fn stop(&self) -> Result<(), AcceptorError> {
        {
            let mut state = self.state.write().await;
            if *state == AcceptorState::Stopped {
                return Err(AcceptorError::AlreadyStopped);
            }
            *state = AcceptorState::Stopped;
        }

        self.shutdown.cancel();

        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "accept loop ended abnormally");
            }
        }

        self.tracker.close();
        self.tracker.wait().await;

        info!(local_addr = %self.local_addr, "acceptor stopped");
        Ok(())
    }
}

impl Drop for BoundedAcceptor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    slots: Arc<Semaphore>,
    handler: Arc<dyn ConnectionHandler>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    let mut next_id: u64 = 0;

    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    drop(permit);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        next_id += 1;
        let handler = handler.clone();
        let cancel = shutdown.child_token();
        let span = tracing::info_span!("connection", id = next_id, %remote);

        tracker.spawn(
            async move {
                let _permit = permit;
                debug!("accepted");

                let result = tokio::select! {
                    biased;
                    result = handler.handle(stream, remote, cancel.clone()) => result,
                    _ = cancel.cancelled() => {
                        debug!("aborted by shutdown");
                        return;
                    }
                };

                match result {
                    Ok(()) => debug!("closed"),
                    Err(e) if e.is_cancelled() => debug!(error = %e, "transfer cancelled"),
                    Err(e) => warn!(error = %e, "connection failed"),
                }
            }
            .instrument(span),
        );
    }

    debug!("accept loop exited");
}
