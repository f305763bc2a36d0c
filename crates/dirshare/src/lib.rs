//! # dirshare Library
//!
//! Server and client for browsing a remote directory tree and moving files
//! to and from it over plain TCP.
//!
//! ## Overview
//!
//! - **Bounded Acceptor**: accepts connections and runs at most a fixed
//!   number of handlers at once
//! - **Request Dispatcher**: serves the single request of each connection
//!   (list a directory, pull a file, push a file) with an optional refusal
//!   policy
//! - **Client Operations**: one connection per operation, with progress
//!   reporting and cancellation
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    BoundedAcceptor                       │
//! │        (semaphore slots, task tracker, shutdown)         │
//! ├──────────────────────────────────────────────────────────┤
//! │                   RequestDispatcher                      │
//! │   RefusalPolicy │ DirectoryBrowser │ FileStore           │
//! ├──────────────────────────────────────────────────────────┤
//! │          protocol: channel, chunk, framing               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use dirshare::{BoundedAcceptor, ClientOutcome, Config, RemoteClient, RequestDispatcher};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let dispatcher = RequestDispatcher::from_config(&config);
//!
//!     let acceptor = BoundedAcceptor::start(
//!         "127.0.0.1:7005".parse()?,
//!         config.server.max_connections,
//!         Arc::new(dispatcher),
//!     )
//!     .await?;
//!
//!     let client = RemoteClient::new("127.0.0.1:7005");
//!     if let ClientOutcome::Success(listing) = client.list_directory(".").await {
//!         for entry in listing.entries() {
//!             println!("{}", entry.name);
//!         }
//!     }
//!
//!     acceptor.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`files`]: Directory listing and transfer endpoints
//! - [`server`]: Acceptor and dispatcher
//! - [`client`]: Client operations

pub mod client;
pub mod config;
pub mod files;
pub mod server;

// Re-export protocol for convenience
pub use protocol;

pub use client::{ClientOutcome, RemoteClient};
pub use config::Config;
pub use files::{DirectoryBrowser, DotPath, FileStore};
pub use server::{
    AcceptorError, AcceptorState, BoundedAcceptor, ConnectionHandler, RefusalList, RefusalPolicy,
    RequestDispatcher,
};
