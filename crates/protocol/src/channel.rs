//! Message channel: whole text messages carried as tagged frames.
//!
//! A message is split into segments of at most [`SEGMENT_LENGTH`] bytes.
//! Every segment but the last is sent with the [`ControlTag::Continue`] tag,
//! the last one with [`ControlTag::Eot`]. An empty message is a single empty
//! `Eot` frame.
//!
//! Control-plane replies may also be a lone [`ControlTag::Null`] frame
//! ("no result") or a lone [`ControlTag::Refuse`] frame (the request was
//! refused by the remote host).

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};
use crate::framing::{read_frame, read_frame_or_eof, write_frame, MAX_FIELD_LEN};

/// Bytes kept free below the field limit when segmenting a message.
pub const SEGMENT_MARGIN: usize = 100;

/// Maximum body length of one segment.
pub const SEGMENT_LENGTH: usize = MAX_FIELD_LEN - SEGMENT_MARGIN;

/// Control tags carried in the tag field of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlTag {
    /// More segments of the same message follow.
    Continue,
    /// Last segment of the message.
    Eot,
    /// No result.
    Null,
    /// The request was refused.
    Refuse,
}

impl ControlTag {
    /// Wire representation of the tag.
    pub fn as_str(self) -> &'static str {
        match self {
            ControlTag::Continue => "a",
            ControlTag::Eot => "b",
            ControlTag::Null => "c",
            ControlTag::Refuse => "d",
        }
    }

    /// Parse a tag received from the wire.
    pub fn parse(tag: &str) -> Result<Self> {
        match tag {
            "a" => Ok(ControlTag::Continue),
            "b" => Ok(ControlTag::Eot),
            "c" => Ok(ControlTag::Null),
            "d" => Ok(ControlTag::Refuse),
            other => Err(ProtocolError::ProtocolViolation(format!(
                "unknown control tag {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for ControlTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split `text` into segments of at most `max` bytes on character boundaries.
///
/// `max` must be at least 4 so that any character fits.
pub(crate) fn split_segments(text: &str, max: usize) -> Vec<&str> {
    if text.is_empty() {
        return vec![""];
    }

    let mut segments = Vec::with_capacity(text.len() / max + 1);
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = rest.len().min(max);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (segment, tail) = rest.split_at(end);
        segments.push(segment);
        rest = tail;
    }
    segments
}

/// Send a complete text message.
pub async fn send_message<W>(writer: &mut W, text: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let segments = split_segments(text, SEGMENT_LENGTH);
    let last = segments.len() - 1;
    for (index, segment) in segments.into_iter().enumerate() {
        let tag = if index < last {
            ControlTag::Continue
        } else {
            ControlTag::Eot
        };
        write_frame(writer, tag.as_str(), segment).await?;
    }
    writer.flush().await?;

    tracing::trace!(bytes = text.len(), "sent message");
    Ok(())
}

/// Send a "no result" reply.
pub async fn send_null<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, ControlTag::Null.as_str(), "").await?;
    writer.flush().await?;
    Ok(())
}

/// Send a refusal reply.
pub async fn send_refusal<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, ControlTag::Refuse.as_str(), "").await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a complete text message.
///
/// Returns `Ok(None)` on a `Null` reply and
/// [`ProtocolError::ConnectionRefused`] on a `Refuse` reply.
pub async fn receive_message<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut text = String::new();
    loop {
        let frame = read_frame(reader).await?;
        match ControlTag::parse(&frame.tag)? {
            ControlTag::Continue => text.push_str(&frame.body),
            ControlTag::Eot => {
                text.push_str(&frame.body);
                tracing::trace!(bytes = text.len(), "received message");
                return Ok(Some(text));
            }
            ControlTag::Null => return Ok(None),
            ControlTag::Refuse => return Err(ProtocolError::ConnectionRefused),
        }
    }
}

/// Receive a message that must carry text.
///
/// Used for request fields, where a `Null` reply has no meaning.
pub async fn receive_text<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    receive_message(reader).await?.ok_or_else(|| {
        ProtocolError::ProtocolViolation("expected a text message, got a null reply".to_string())
    })
}

/// Read the final reply of an exchange in which the peer normally answers
/// by closing the connection.
///
/// A clean close is success; a `Refuse` frame is
/// [`ProtocolError::ConnectionRefused`]; anything else is a violation.
pub async fn receive_reply<R>(reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(frame) = read_frame_or_eof(reader).await? else {
        return Ok(());
    };
    match ControlTag::parse(&frame.tag)? {
        ControlTag::Refuse => Err(ProtocolError::ConnectionRefused),
        other => Err(ProtocolError::ProtocolViolation(format!(
            "unexpected {:?} frame after transfer",
            other
        ))),
    }
}

/// Wait until the peer closes its side of the connection.
///
/// Any bytes still arriving are discarded.
pub async fn wait_for_closure<R>(reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut sink = [0u8; 256];
    loop {
        if reader.read(&mut sink).await? == 0 {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{Frame, FrameCodec};

    #[test]
    fn test_control_tag_wire_values() {
        assert_eq!(ControlTag::Continue.as_str(), "a");
        assert_eq!(ControlTag::Eot.as_str(), "b");
        assert_eq!(ControlTag::Null.as_str(), "c");
        assert_eq!(ControlTag::Refuse.as_str(), "d");
    }

    #[test]
    fn test_control_tag_parse() {
        for tag in [
            ControlTag::Continue,
            ControlTag::Eot,
            ControlTag::Null,
            ControlTag::Refuse,
        ] {
            assert_eq!(ControlTag::parse(tag.as_str()).unwrap(), tag);
        }
        assert!(matches!(
            ControlTag::parse("z"),
            Err(ProtocolError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_segment_length_below_field_limit() {
        assert!(SEGMENT_LENGTH < MAX_FIELD_LEN);
    }

    #[test]
    fn test_split_empty_text() {
        assert_eq!(split_segments("", 10), vec![""]);
    }

    #[test]
    fn test_split_exact_multiple() {
        assert_eq!(split_segments("abcdef", 3), vec!["abc", "def"]);
    }

    #[test]
    fn test_split_with_remainder() {
        assert_eq!(split_segments("abcdefg", 3), vec!["abc", "def", "g"]);
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        // Each 'é' is two bytes; a 5 byte limit must not cut one in half
        let text = "éééé";
        let segments = split_segments(text, 5);
        assert_eq!(segments, vec!["éé", "éé"]);
        assert_eq!(segments.concat(), text);
    }

    #[tokio::test]
    async fn test_empty_message_is_single_eot_frame() {
        let mut buffer = Vec::new();
        send_message(&mut buffer, "").await.unwrap();

        let (frame, consumed) = FrameCodec::new().decode(&buffer).unwrap();
        assert_eq!(frame, Frame::new("b", ""));
        assert_eq!(consumed, buffer.len());
    }

    #[tokio::test]
    async fn test_long_message_uses_continue_frames() {
        let text = "x".repeat(SEGMENT_LENGTH * 2 + 10);
        let mut buffer = Vec::new();
        send_message(&mut buffer, &text).await.unwrap();

        let codec = FrameCodec::new();
        let mut offset = 0;
        let mut tags = Vec::new();
        while offset < buffer.len() {
            let (frame, consumed) = codec.decode(&buffer[offset..]).unwrap();
            assert!(frame.body.len() <= SEGMENT_LENGTH);
            tags.push(frame.tag);
            offset += consumed;
        }
        assert_eq!(tags, vec!["a", "a", "b"]);
    }

    #[tokio::test]
    async fn test_message_roundtrip_lengths() {
        let lengths = [
            0,
            1,
            SEGMENT_LENGTH - 1,
            SEGMENT_LENGTH,
            SEGMENT_LENGTH + 1,
            MAX_FIELD_LEN * 3 + 17,
        ];
        for len in lengths {
            let text: String = (0..len)
                .map(|i| char::from(b'a' + (i % 26) as u8))
                .collect();
            let mut buffer = Vec::new();
            send_message(&mut buffer, &text).await.unwrap();

            let mut reader = buffer.as_slice();
            let received = receive_message(&mut reader).await.unwrap();
            assert_eq!(received.as_deref(), Some(text.as_str()), "length {}", len);
        }
    }

    #[tokio::test]
    async fn test_multibyte_message_roundtrip() {
        let text = "ファイル転送 ✓ ".repeat(20_000);
        let (mut client, mut server) = tokio::io::duplex(4096);

        let expected = text.clone();
        let reader = tokio::spawn(async move { receive_message(&mut server).await });
        send_message(&mut client, &text).await.unwrap();

        let received = reader.await.unwrap().unwrap();
        assert_eq!(received, Some(expected));
    }

    #[tokio::test]
    async fn test_receive_null_reply() {
        let mut buffer = Vec::new();
        send_null(&mut buffer).await.unwrap();

        let mut reader = buffer.as_slice();
        assert_eq!(receive_message(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_receive_refusal() {
        let mut buffer = Vec::new();
        send_refusal(&mut buffer).await.unwrap();

        let mut reader = buffer.as_slice();
        assert!(matches!(
            receive_message(&mut reader).await,
            Err(ProtocolError::ConnectionRefused)
        ));
    }

    #[tokio::test]
    async fn test_receive_unknown_tag() {
        let buffer = FrameCodec::new().encode(&Frame::new("q", "body")).unwrap();
        let mut reader = buffer.as_slice();
        assert!(matches!(
            receive_message(&mut reader).await,
            Err(ProtocolError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_receive_text_rejects_null() {
        let mut buffer = Vec::new();
        send_null(&mut buffer).await.unwrap();

        let mut reader = buffer.as_slice();
        assert!(matches!(
            receive_text(&mut reader).await,
            Err(ProtocolError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_receive_reply_clean_close() {
        let mut reader: &[u8] = &[];
        assert!(receive_reply(&mut reader).await.is_ok());
    }

    #[tokio::test]
    async fn test_receive_reply_refused() {
        let mut buffer = Vec::new();
        send_refusal(&mut buffer).await.unwrap();

        let mut reader = buffer.as_slice();
        assert!(matches!(
            receive_reply(&mut reader).await,
            Err(ProtocolError::ConnectionRefused)
        ));
    }

    #[tokio::test]
    async fn test_wait_for_closure_drains_input() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"leftover bytes").await.unwrap();
        drop(client);

        wait_for_closure(&mut server).await.unwrap();
    }
}
