//! Request and response types exchanged over a connection.
//!
//! A connection carries exactly one request: a 4-byte operation code
//! followed by the request's text fields, each sent as a message (see
//! [`crate::channel`]).
//!
//! | Operation       | Code | Request fields             | Reply                         |
//! |-----------------|------|----------------------------|-------------------------------|
//! | `ListDirectory` | 0    | path                       | listing message               |
//! | `PullFile`      | 1    | path                       | size, name, file chunks       |
//! | `PushFile`      | 2    | target directory, file name| (file chunks from the client) |

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::channel::{receive_message, receive_text, send_message};
use crate::error::{ProtocolError, Result};

/// Name given to the synthetic parent entry of a listing.
pub const PARENT_ENTRY_NAME: &str = "..";

/// Operation requested on a fresh connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// List the entries of a directory.
    ListDirectory,
    /// Download a file from the server.
    PullFile,
    /// Upload a file to the server.
    PushFile,
}

impl Operation {
    /// Wire code of the operation.
    pub fn code(self) -> i32 {
        match self {
            Operation::ListDirectory => 0,
            Operation::PullFile => 1,
            Operation::PushFile => 2,
        }
    }

    /// Parse a wire code.
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Operation::ListDirectory),
            1 => Ok(Operation::PullFile),
            2 => Ok(Operation::PushFile),
            other => Err(ProtocolError::ProtocolViolation(format!(
                "unknown operation code {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::ListDirectory => "list-directory",
            Operation::PullFile => "pull-file",
            Operation::PushFile => "push-file",
        };
        f.write_str(name)
    }
}

/// Write an operation code.
pub async fn write_operation<W>(writer: &mut W, operation: Operation) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_i32(operation.code()).await?;
    Ok(())
}

/// Read an operation code.
pub async fn read_operation<R>(reader: &mut R) -> Result<Operation>
where
    R: AsyncRead + Unpin,
{
    let code = reader.read_i32().await?;
    Operation::from_code(code)
}

/// A single request, as sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Requested operation.
    pub operation: Operation,
    /// Directory or file path on the server. For pushes, the target directory.
    pub path: String,
    /// Name of the pushed file. Only set for `PushFile`.
    pub file_name: Option<String>,
}

impl RequestEnvelope {
    pub fn list_directory(path: impl Into<String>) -> Self {
        Self {
            operation: Operation::ListDirectory,
            path: path.into(),
            file_name: None,
        }
    }

    pub fn pull_file(path: impl Into<String>) -> Self {
        Self {
            operation: Operation::PullFile,
            path: path.into(),
            file_name: None,
        }
    }

    pub fn push_file(target_dir: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            operation: Operation::PushFile,
            path: target_dir.into(),
            file_name: Some(file_name.into()),
        }
    }

    /// Write the operation code and the request fields.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        write_operation(writer, self.operation).await?;
        send_message(writer, &self.path).await?;
        if self.operation == Operation::PushFile {
            let name = self.file_name.as_deref().ok_or_else(|| {
                ProtocolError::Serialization("push request without a file name".to_string())
            })?;
            send_message(writer, name).await?;
        }
        Ok(())
    }

    /// Read a request from a fresh connection.
    ///
    /// An unknown operation code fails before any field is read.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let operation = read_operation(reader).await?;
        let path = receive_text(reader).await?;
        let file_name = match operation {
            Operation::PushFile => Some(receive_text(reader).await?),
            _ => None,
        };
        Ok(Self {
            operation,
            path,
            file_name,
        })
    }
}

impl fmt::Display for RequestEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file_name {
            Some(name) => write!(f, "{} {} {}", self.operation, self.path, name),
            None => write!(f, "{} {}", self.operation, self.path),
        }
    }
}

/// A file or directory in a listing.
///
/// Serialized as a JSON object with the short keys `"0"`, `"1"` and `"2"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Whether the entry is a directory.
    #[serde(rename = "0")]
    pub is_directory: bool,
    /// Absolute path of the entry on its host.
    #[serde(rename = "1")]
    pub absolute_path: String,
    /// Entry name (not full path).
    #[serde(rename = "2")]
    pub name: String,
}

impl FileEntry {
    pub fn new(is_directory: bool, absolute_path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            is_directory,
            absolute_path: absolute_path.into(),
            name: name.into(),
        }
    }

    /// The synthetic `..` entry pointing at a parent directory.
    pub fn parent(absolute_path: impl Into<String>) -> Self {
        Self::new(true, absolute_path, PARENT_ENTRY_NAME)
    }

    /// Whether this is the synthetic parent entry.
    pub fn is_parent(&self) -> bool {
        self.name == PARENT_ENTRY_NAME
    }
}

/// Ordered directory listing: the parent entry first, when there is one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryListing {
    entries: Vec<FileEntry>,
}

impl DirectoryListing {
    /// Build a listing from an optional parent and the directory's entries
    /// in enumeration order.
    pub fn new(parent: Option<FileEntry>, entries: Vec<FileEntry>) -> Self {
        let mut all = Vec::with_capacity(entries.len() + 1);
        all.extend(parent);
        all.extend(entries);
        Self { entries: all }
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<FileEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The parent entry, if the listed directory has one.
    pub fn parent(&self) -> Option<&FileEntry> {
        self.entries.first().filter(|entry| entry.is_parent())
    }

    /// Encode as a JSON array of strings, each string a JSON object.
    pub fn to_json(&self) -> Result<String> {
        let objects = self
            .entries
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(serde_json::to_string(&objects)?)
    }

    /// Decode the representation produced by [`DirectoryListing::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        let objects: Vec<String> = serde_json::from_str(json)?;
        let entries = objects
            .iter()
            .map(|object| serde_json::from_str(object))
            .collect::<std::result::Result<Vec<FileEntry>, _>>()?;
        Ok(Self { entries })
    }
}

/// Size and name of a pulled file, sent before its chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// File length in bytes.
    pub size: u64,
    /// File name without directories.
    pub name: String,
}

impl FileHeader {
    pub fn new(size: u64, name: impl Into<String>) -> Self {
        Self {
            size,
            name: name.into(),
        }
    }

    /// Send the size and the name as two messages.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        send_message(writer, &self.size.to_string()).await?;
        send_message(writer, &self.name).await
    }

    /// Read a header; `None` when the server answered with a null reply.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Self>>
    where
        R: AsyncRead + Unpin,
    {
        let Some(size) = receive_message(reader).await? else {
            return Ok(None);
        };
        let size = size.trim().parse::<u64>().map_err(|e| {
            ProtocolError::ProtocolViolation(format!("invalid file size {:?}: {}", size, e))
        })?;
        let name = receive_text(reader).await?;
        Ok(Some(Self { size, name }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::send_null;

    #[test]
    fn test_operation_codes() {
        assert_eq!(Operation::ListDirectory.code(), 0);
        assert_eq!(Operation::PullFile.code(), 1);
        assert_eq!(Operation::PushFile.code(), 2);
        for op in [
            Operation::ListDirectory,
            Operation::PullFile,
            Operation::PushFile,
        ] {
            assert_eq!(Operation::from_code(op.code()).unwrap(), op);
        }
    }

    #[test]
    fn test_unknown_operation_code() {
        assert!(matches!(
            Operation::from_code(99),
            Err(ProtocolError::ProtocolViolation(_))
        ));
        assert!(Operation::from_code(-1).is_err());
    }

    #[tokio::test]
    async fn test_operation_code_is_big_endian_i32() {
        let mut buffer = Vec::new();
        write_operation(&mut buffer, Operation::PushFile).await.unwrap();
        assert_eq!(buffer, vec![0, 0, 0, 2]);
    }

    #[test]
    fn test_file_entry_json_keys() {
        let entry = FileEntry::new(false, "/srv/b.txt", "b.txt");
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"0":false,"1":"/srv/b.txt","2":"b.txt"}"#);
    }

    #[test]
    fn test_parent_entry() {
        let parent = FileEntry::parent("/srv");
        assert!(parent.is_directory);
        assert!(parent.is_parent());
        assert_eq!(parent.name, "..");
    }

    #[test]
    fn test_listing_puts_parent_first() {
        let listing = DirectoryListing::new(
            Some(FileEntry::parent("/")),
            vec![
                FileEntry::new(false, "/srv/b.txt", "b.txt"),
                FileEntry::new(true, "/srv/a_dir", "a_dir"),
            ],
        );
        let names: Vec<_> = listing.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["..", "b.txt", "a_dir"]);
        assert_eq!(listing.parent().unwrap().absolute_path, "/");
    }

    #[test]
    fn test_listing_without_parent() {
        let listing = DirectoryListing::new(None, vec![FileEntry::new(true, "/srv", "srv")]);
        assert!(listing.parent().is_none());
        assert_eq!(listing.len(), 1);
    }

    #[test]
    fn test_listing_json_is_array_of_strings() {
        let listing = DirectoryListing::new(
            Some(FileEntry::parent("/")),
            vec![FileEntry::new(false, "/srv/b.txt", "b.txt")],
        );
        let json = listing.to_json().unwrap();

        let raw: Vec<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0], r#"{"0":true,"1":"/","2":".."}"#);

        assert_eq!(DirectoryListing::from_json(&json).unwrap(), listing);
    }

    #[test]
    fn test_listing_from_invalid_json() {
        assert!(matches!(
            DirectoryListing::from_json("[1, 2]"),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[tokio::test]
    async fn test_request_envelope_over_stream() {
        let request = RequestEnvelope::push_file("/srv/uploads", "report.pdf");
        let mut buffer = Vec::new();
        request.write_to(&mut buffer).await.unwrap();

        let mut reader = buffer.as_slice();
        let received = RequestEnvelope::read_from(&mut reader).await.unwrap();
        assert_eq!(received, request);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_request_envelope_unknown_operation() {
        let mut buffer = 99i32.to_be_bytes().to_vec();
        send_message(&mut buffer, "/tmp").await.unwrap();

        let mut reader = buffer.as_slice();
        assert!(matches!(
            RequestEnvelope::read_from(&mut reader).await,
            Err(ProtocolError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_request_display() {
        assert_eq!(
            RequestEnvelope::list_directory("/srv").to_string(),
            "list-directory /srv"
        );
        assert_eq!(
            RequestEnvelope::push_file("/srv", "a.txt").to_string(),
            "push-file /srv a.txt"
        );
    }

    #[tokio::test]
    async fn test_file_header_over_stream() {
        let header = FileHeader::new(5000, "data.bin");
        let mut buffer = Vec::new();
        header.write_to(&mut buffer).await.unwrap();

        let mut reader = buffer.as_slice();
        assert_eq!(FileHeader::read_from(&mut reader).await.unwrap(), Some(header));
    }

    #[tokio::test]
    async fn test_file_header_null_reply() {
        let mut buffer = Vec::new();
        send_null(&mut buffer).await.unwrap();

        let mut reader = buffer.as_slice();
        assert_eq!(FileHeader::read_from(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_header_invalid_size() {
        let mut buffer = Vec::new();
        send_message(&mut buffer, "lots").await.unwrap();
        send_message(&mut buffer, "x").await.unwrap();

        let mut reader = buffer.as_slice();
        assert!(matches!(
            FileHeader::read_from(&mut reader).await,
            Err(ProtocolError::ProtocolViolation(_))
        ));
    }
}
