//! Directory browsing with path validation.
//!
//! Request paths arrive as plain strings. They are resolved against the
//! process working directory, canonicalized, and checked against the
//! configured allowed paths before anything is read.

use std::fs;
use std::path::{Path, PathBuf};

use protocol::messages::{DirectoryListing, FileEntry};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during directory browsing.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The requested path is outside allowed boundaries.
    #[error("path is outside allowed boundaries: {0}")]
    PathOutsideBoundary(PathBuf),

    /// The requested path does not exist.
    #[error("path does not exist: {0}")]
    PathNotFound(PathBuf),

    /// The requested path is not a directory.
    #[error("path is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrowserError {
    /// Whether the path is simply not there (or not a listable directory),
    /// as opposed to a failure worth reporting.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BrowserError::PathNotFound(_) | BrowserError::NotADirectory(_)
        )
    }
}

/// Meaning of the literal request path `"."`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DotPath {
    /// The server's working directory.
    #[default]
    Current,
    /// The parent of the server's working directory.
    Parent,
}

/// Directory browser with path validation.
#[derive(Debug, Clone)]
pub struct DirectoryBrowser {
    /// Allowed paths for browsing. Empty means all paths allowed.
    allowed_paths: Vec<PathBuf>,
    /// How `"."` is resolved.
    dot_path: DotPath,
}

impl DirectoryBrowser {
    /// Create a new directory browser with the given allowed paths.
    ///
    /// If `allowed_paths` is empty, all paths are allowed.
    pub fn new(allowed_paths: Vec<PathBuf>) -> Self {
        Self {
            allowed_paths,
            dot_path: DotPath::default(),
        }
    }

    /// Create a browser that allows all paths.
    pub fn allow_all() -> Self {
        Self::new(Vec::new())
    }

    /// Set how the literal path `"."` is resolved.
    pub fn with_dot_path(mut self, dot_path: DotPath) -> Self {
        self.dot_path = dot_path;
        self
    }

    pub fn dot_path(&self) -> DotPath {
        self.dot_path
    }

    /// Turn a request path into a filesystem path, applying the `"."` rule.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, BrowserError> {
        if requested != "." {
            return Ok(PathBuf::from(requested));
        }

        let cwd = std::env::current_dir()?;
        match self.dot_path {
            DotPath::Current => Ok(cwd),
            DotPath::Parent => Ok(cwd.parent().map(Path::to_path_buf).unwrap_or(cwd)),
        }
    }

    /// Validate that a path is within allowed boundaries.
    ///
    /// Returns the canonicalized path if valid.
    pub fn validate_path(&self, path: &Path) -> Result<PathBuf, BrowserError> {
        let canonical = fs::canonicalize(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BrowserError::PathNotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => {
                BrowserError::PermissionDenied(path.to_path_buf())
            }
            _ => BrowserError::Io(e),
        })?;

        if self.is_allowed(&canonical) {
            Ok(canonical)
        } else {
            Err(BrowserError::PathOutsideBoundary(path.to_path_buf()))
        }
    }

    fn is_allowed(&self, canonical: &Path) -> bool {
        if self.allowed_paths.is_empty() {
            return true;
        }

        self.allowed_paths.iter().any(|allowed| {
            // Allowed paths that do not exist never match
            fs::canonicalize(allowed)
                .map(|allowed| canonical.starts_with(allowed))
                .unwrap_or(false)
        })
    }

    /// Resolve and validate a request path that must name a directory.
    pub fn resolve_directory(&self, requested: &str) -> Result<PathBuf, BrowserError> {
        let canonical = self.validate_path(&self.resolve(requested)?)?;
        if !canonical.is_dir() {
            return Err(BrowserError::NotADirectory(canonical));
        }
        Ok(canonical)
    }

    /// List a directory.
    ///
    /// The result starts with a `..` entry for the parent directory (absent
    /// at the filesystem root), followed by the directory's entries in the
    /// order the filesystem enumerates them. Hidden entries are included.
    pub fn list_directory(&self, requested: &str) -> Result<DirectoryListing, BrowserError> {
        let canonical = self.resolve_directory(requested)?;

        let parent = canonical
            .parent()
            .map(|parent| FileEntry::parent(parent.to_string_lossy()));

        let mut entries = Vec::new();
        for entry in fs::read_dir(&canonical)? {
            // Skip entries we can't read
            let Ok(entry) = entry else { continue };
            let Ok(file_type) = entry.file_type() else {
                continue;
            };

            // Symlinks are reported as what they point at
            let is_directory = if file_type.is_symlink() {
                entry.path().is_dir()
            } else {
                file_type.is_dir()
            };

            entries.push(FileEntry::new(
                is_directory,
                entry.path().to_string_lossy(),
                entry.file_name().to_string_lossy(),
            ));
        }

        tracing::debug!(path = %canonical.display(), entries = entries.len(), "listed directory");
        Ok(DirectoryListing::new(parent, entries))
    }
}

impl Default for DirectoryBrowser {
    fn default() -> Self {
        Self::allow_all()
    }
}
