//! File access for the server: directory listings and transfer endpoints.
//!
//! # Security
//!
//! All path operations are validated against allowed paths. Path traversal
//! is prevented by canonicalizing paths before they are checked, and pushed
//! file names are reduced to a single path component.

pub mod browser;
pub mod transfer;

pub use browser::{BrowserError, DirectoryBrowser, DotPath};
pub use transfer::{sanitize_file_name, DestinationFile, FileStore, SourceFile, TransferError};
