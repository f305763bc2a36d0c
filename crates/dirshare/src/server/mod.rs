//! TCP server: the bounded acceptor and the per-connection request dispatcher.

pub mod acceptor;
pub mod dispatcher;

pub use acceptor::{
    AcceptorError, AcceptorState, BoundedAcceptor, ConnectionHandler, MAX_CONNECTIONS_LIMIT,
};
pub use dispatcher::{AcceptAll, RefusalList, RefusalPolicy, RequestDispatcher};
