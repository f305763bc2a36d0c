//! # dirshare Protocol Library
//!
//! Wire protocol for the dirshare remote file browser: clients list a
//! directory on a remote host, pull files from it and push files to it,
//! one request per TCP connection.
//!
//! ## Overview
//!
//! - **Frame Codec**: two length-prefixed UTF-8 fields per frame (tag, body)
//! - **Message Channel**: arbitrary-length text messages split into frames,
//!   plus the `NULL` and `REFUSE` control replies
//! - **File Chunk Stream**: raw file bytes as length-prefixed chunks with a
//!   terminator, cancellable from either side
//! - **Messages**: operation codes, request envelopes and directory listings
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Requests / Listings / FileHeader    │  JSON listings
//! ├──────────────────────┬──────────────────┤
//! │    Message Channel   │ File Chunk Stream│  CONTINUE/EOT, i32 chunks
//! ├──────────────────────┤                  │
//! │      Frame Codec     │                  │  u16 BE length fields
//! ├──────────────────────┴──────────────────┤
//! │                 TCP                     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{DirectoryListing, FileEntry, Frame, FrameCodec};
//!
//! let listing = DirectoryListing::new(
//!     Some(FileEntry::parent("/")),
//!     vec![FileEntry::new(false, "/srv/notes.txt", "notes.txt")],
//! );
//! let json = listing.to_json().unwrap();
//!
//! let codec = FrameCodec::new();
//! let bytes = codec.encode(&Frame::new("b", json)).unwrap();
//! let (frame, _) = codec.decode(&bytes).unwrap();
//! assert_eq!(DirectoryListing::from_json(&frame.body).unwrap(), listing);
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: Frame codec and stream helpers
//! - [`channel`]: Segmented text messages and control replies
//! - [`chunk`]: Chunked file streams with cancellation
//! - [`messages`]: Operations, requests and listings
//! - [`error`]: Error types

pub mod channel;
pub mod chunk;
pub mod error;
pub mod framing;
pub mod messages;

pub use channel::{
    receive_message, receive_reply, receive_text, send_message, send_null, send_refusal,
    wait_for_closure, ControlTag, SEGMENT_LENGTH,
};
pub use chunk::{
    receive_file, send_file, Direction, Progress, TransferSession, DEFAULT_CHUNK_SIZE,
    END_OF_TRANSMISSION, MAX_CHUNK_SIZE,
};
pub use error::{ProtocolError, Result};
pub use framing::{read_frame, write_frame, Frame, FrameCodec, MAX_FIELD_LEN, MAX_FRAME_SIZE};
pub use messages::{
    read_operation, write_operation, DirectoryListing, FileEntry, FileHeader, Operation,
    RequestEnvelope,
};
