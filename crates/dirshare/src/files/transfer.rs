//! Opening files for pulls and pushes.
//!
//! The bytes themselves move through [`protocol::chunk`]; this module only
//! decides which file a request refers to and hands back an open handle.

use std::path::{Path, PathBuf};

use protocol::messages::FileHeader;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};

use super::browser::{BrowserError, DirectoryBrowser};

/// Errors that can occur when opening a transfer source or destination.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The requested path is outside allowed boundaries.
    #[error("path is outside allowed boundaries: {0}")]
    PathOutsideBoundary(PathBuf),

    /// The requested file does not exist.
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    /// The requested path is a directory, not a file.
    #[error("path is a directory: {0}")]
    IsADirectory(PathBuf),

    /// The push target is not a directory.
    #[error("target is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The file already exists and overwrite is not allowed.
    #[error("file already exists: {0}")]
    FileExists(PathBuf),

    /// The pushed file name cannot be used.
    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BrowserError> for TransferError {
    fn from(err: BrowserError) -> Self {
        match err {
            BrowserError::PathOutsideBoundary(path) => TransferError::PathOutsideBoundary(path),
            BrowserError::PathNotFound(path) => TransferError::FileNotFound(path),
            BrowserError::NotADirectory(path) => TransferError::NotADirectory(path),
            BrowserError::PermissionDenied(path) => TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("permission denied: {}", path.display()),
            )),
            BrowserError::Io(e) => TransferError::Io(e),
        }
    }
}

/// Reduce a received file name to its final path component.
///
/// Both `/` and `\` count as separators. Empty names, `.` and `..` are
/// rejected.
pub fn sanitize_file_name(name: &str) -> Result<&str, TransferError> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    match last {
        "" | "." | ".." => Err(TransferError::InvalidFileName(name.to_string())),
        valid => Ok(valid),
    }
}

/// An open file ready to be pulled.
#[derive(Debug)]
pub struct SourceFile {
    /// Canonical path of the file.
    pub path: PathBuf,
    /// Size and name to announce before the chunks.
    pub header: FileHeader,
    pub file: File,
}

/// An open file receiving a push.
#[derive(Debug)]
pub struct DestinationFile {
    /// Path the bytes are written to.
    pub path: PathBuf,
    pub file: File,
}

/// Resolves request paths to open files.
#[derive(Debug, Clone)]
pub struct FileStore {
    /// Browser for path resolution and validation.
    browser: DirectoryBrowser,
    /// Whether pushes may replace existing files.
    overwrite: bool,
}

impl FileStore {
    pub fn new(browser: DirectoryBrowser) -> Self {
        Self {
            browser,
            overwrite: true,
        }
    }

    /// Set whether pushes may replace existing files.
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn browser(&self) -> &DirectoryBrowser {
        &self.browser
    }

    /// Open the file a pull request names.
    pub async fn open_source(&self, requested: &str) -> Result<SourceFile, TransferError> {
        let canonical = self.browser.validate_path(&self.browser.resolve(requested)?)?;

        let metadata = tokio::fs::metadata(&canonical).await?;
        if metadata.is_dir() {
            return Err(TransferError::IsADirectory(canonical));
        }

        let name = file_name_of(&canonical);
        let file = File::open(&canonical).await?;

        Ok(SourceFile {
            header: FileHeader::new(metadata.len(), name),
            path: canonical,
            file,
        })
    }

    /// Create (or truncate) the file a push request names.
    pub async fn create_destination(
        &self,
        target_dir: &str,
        file_name: &str,
    ) -> Result<DestinationFile, TransferError> {
        let name = sanitize_file_name(file_name)?;
        let directory = self.browser.resolve_directory(target_dir)?;
        let path = directory.join(name);

        let mut options = OpenOptions::new();
        options.write(true);
        if self.overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }

        let file = options.open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                TransferError::FileExists(path.clone())
            } else {
                TransferError::Io(e)
            }
        })?;

        Ok(DestinationFile { path, file })
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
