//! Frame codec for length-delimited text frames.
//!
//! # Frame Format
//!
//! Every frame is two text fields back to back, a control tag and a body:
//!
//! ```text
//! +-----------+-----------+------------+------------+
//! | tag len   | tag bytes | body len   | body bytes |
//! | u16 BE    | UTF-8     | u16 BE     | UTF-8      |
//! +-----------+-----------+------------+------------+
//! ```
//!
//! A field can carry at most [`MAX_FIELD_LEN`] bytes. Longer text has to be
//! split by the caller; [`crate::channel`] does that for whole messages.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

/// Maximum number of encoded bytes in one field.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

/// Size of the length prefix in front of every field.
pub const FIELD_HEADER_SIZE: usize = 2;

/// Largest possible encoded frame: two full fields with their prefixes.
pub const MAX_FRAME_SIZE: usize = 2 * (FIELD_HEADER_SIZE + MAX_FIELD_LEN);

/// A single frame: a control tag and a text body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Control tag (see [`crate::channel::ControlTag`]).
    pub tag: String,
    /// Body text.
    pub body: String,
}

impl Frame {
    /// Create a new frame.
    pub fn new(tag: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            body: body.into(),
        }
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        2 * FIELD_HEADER_SIZE + self.tag.len() + self.body.len()
    }
}

/// Encoder and decoder for frames held in memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self
    }

    /// Encode a frame into bytes.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(frame.encoded_len());
        encode_field(&mut output, &frame.tag)?;
        encode_field(&mut output, &frame.body)?;
        Ok(output)
    }

    /// Decode a frame from bytes.
    ///
    /// Returns the decoded frame and the number of bytes consumed.
    pub fn decode(&self, data: &[u8]) -> Result<(Frame, usize)> {
        match self.try_decode(data)? {
            Some(decoded) => Ok(decoded),
            None => Err(ProtocolError::MalformedFrame(format!(
                "insufficient data for frame: have {} bytes",
                data.len()
            ))),
        }
    }

    /// Try to decode a frame from bytes, returning None if there isn't enough data.
    ///
    /// This is useful for streaming scenarios where you may receive partial frames.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        let Some((tag, tag_end)) = decode_field(data)? else {
            return Ok(None);
        };
        let Some((body, body_len)) = decode_field(&data[tag_end..])? else {
            return Ok(None);
        };
        Ok(Some((Frame { tag, body }, tag_end + body_len)))
    }
}

fn encode_field(output: &mut Vec<u8>, text: &str) -> Result<()> {
    if text.len() > MAX_FIELD_LEN {
        return Err(ProtocolError::FieldTooLarge {
            size: text.len(),
            max: MAX_FIELD_LEN,
        });
    }
    output.extend_from_slice(&(text.len() as u16).to_be_bytes());
    output.extend_from_slice(text.as_bytes());
    Ok(())
}

fn decode_field(data: &[u8]) -> Result<Option<(String, usize)>> {
    if data.len() < FIELD_HEADER_SIZE {
        return Ok(None);
    }
    let len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let end = FIELD_HEADER_SIZE + len;
    if data.len() < end {
        return Ok(None);
    }
    let text = decode_utf8(data[FIELD_HEADER_SIZE..end].to_vec())?;
    Ok(Some((text, end)))
}

fn decode_utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|e| ProtocolError::MalformedFrame(format!("field is not valid UTF-8: {}", e)))
}

/// Write one frame onto a stream.
pub async fn write_frame<W>(writer: &mut W, tag: &str, body: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = FrameCodec.encode(&Frame::new(tag, body))?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Read one frame from a stream.
///
/// Fails with [`ProtocolError::MalformedFrame`] when the stream ends before
/// a declared length is satisfied, including an end right at the start.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    read_frame_or_eof(reader).await?.ok_or_else(|| {
        ProtocolError::MalformedFrame("stream ended before frame header".to_string())
    })
}

/// Read one frame, returning `None` if the peer closed the stream cleanly
/// before sending any byte of it.
pub async fn read_frame_or_eof<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FIELD_HEADER_SIZE];
    let first = reader.read(&mut header).await?;
    if first == 0 {
        return Ok(None);
    }
    if first < FIELD_HEADER_SIZE {
        reader.read_exact(&mut header[first..]).await?;
    }
    let tag = read_field_body(reader, u16::from_be_bytes(header) as usize).await?;

    let body_len = reader.read_u16().await? as usize;
    let body = read_field_body(reader, body_len).await?;

    Ok(Some(Frame { tag, body }))
}

async fn read_field_body<R>(reader: &mut R, len: usize) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    decode_utf8(buf)
}
