//! Wire framing shared by every peer connection.
//!
//! Each frame starts with one tag byte:
//!
//! - [`CONTROL`]: a big-endian `u32` body length followed by a
//!   bincode-encoded [`ControlMessage`].
//! - [`STREAM`]: raw payload bytes. The length is not on the wire; it comes
//!   from the `StoreFile` message sent right before. Readers stop right
//!   after the tag and leave the body to whoever consumes the stream.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub const CONTROL: u8 = 1;
pub const STREAM: u8 = 2;

/// Upper bound on an encoded control message.
pub const MAX_CONTROL_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// `size` raw bytes for `key` follow in the next STREAM frame.
    StoreFile { key: String, size: u64 },
    /// Ask the receiver to push `key` back with a `StoreFile`.
    GetFile { key: String },
}

impl ControlMessage {
    pub fn key(&self) -> &str {
        match self {
            ControlMessage::StoreFile { key, .. } | ControlMessage::GetFile { key } => key,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// What the frame loop saw after reading one tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlMessage),
    /// The connection is now positioned at the start of a stream body.
    Stream,
}

/// Reads the next frame header.
///
/// Returns `Ok(None)` when the connection closes cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    match tag {
        STREAM => Ok(Some(Frame::Stream)),
        CONTROL => {
            let len = reader.read_u32().await? as usize;
            if len > MAX_CONTROL_LEN {
                return Err(Error::Decode(format!(
                    "control frame of {len} bytes exceeds {MAX_CONTROL_LEN}"
                )));
            }
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            Ok(Some(Frame::Control(ControlMessage::decode(&body)?)))
        }
        other => Err(Error::Decode(format!("unknown frame tag {other:#04x}"))),
    }
}

pub async fn write_control<W>(writer: &mut W, message: &ControlMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = message.encode()?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len as usize <= MAX_CONTROL_LEN)
        .ok_or_else(|| Error::Decode(format!("control message of {} bytes is too large", body.len())))?;

    // Tag, length and body go out in one write.
    let mut frame = Vec::with_capacity(5 + body.len());
    frame.push(CONTROL);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes the STREAM tag. The caller writes the body right after.
pub async fn write_stream_header<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u8(STREAM).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn control_frames_preserve_order() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        let store = ControlMessage::StoreFile {
            key: "doc".into(),
            size: 11,
        };
        let get = ControlMessage::GetFile { key: "doc".into() };

        write_control(&mut writer, &store).await.expect("write store");
        write_control(&mut writer, &get).await.expect("write get");

        let first = read_frame(&mut reader).await.expect("read").expect("frame");
        let second = read_frame(&mut reader).await.expect("read").expect("frame");
        assert_eq!(first, Frame::Control(store));
        assert_eq!(second, Frame::Control(get));
    }

    #[tokio::test]
    async fn stream_tag_leaves_body_unread() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        write_stream_header(&mut writer).await.unwrap();
        writer.write_all(b"payload").await.unwrap();

        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(Frame::Stream));

        let mut body = [0u8; 7];
        reader.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"payload");
    }

    #[tokio::test]
    async fn clean_close_between_frames_is_not_an_error() {
        let (writer, mut reader) = tokio::io::duplex(64);
        drop(writer);
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_tag_is_rejected() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_u8(0x7f).await.unwrap();
        assert!(matches!(read_frame(&mut reader).await, Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn oversized_control_frame_is_rejected() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_u8(CONTROL).await.unwrap();
        writer.write_u32(MAX_CONTROL_LEN as u32 + 1).await.unwrap();
        assert!(matches!(read_frame(&mut reader).await, Err(Error::Decode(_))));
    }

    #[test]
    fn garbage_body_fails_to_decode() {
        // Variant index 9 does not exist.
        let bytes = [9u8, 0, 0, 0];
        assert!(matches!(ControlMessage::decode(&bytes), Err(Error::Decode(_))));
    }
}
