//! Frame codec for the plugin connection.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ kind(1B) │   msgpack payload      │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! `len` counts the kind byte plus the payload, not the prefix itself.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length prefix plus kind byte.
pub const HEADER_LEN: usize = 5;

/// Call issued by either peer.
pub const MSG_REQUEST: u8 = 0x01;
/// Successful reply to a call.
pub const MSG_RESPONSE: u8 = 0x02;
/// Failed reply to a call.
pub const MSG_ERROR: u8 = 0xFF;

/// Decoded frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
    Error,
}

impl FrameKind {
    pub fn as_byte(self) -> u8 {
        match self {
            FrameKind::Request => MSG_REQUEST,
            FrameKind::Response => MSG_RESPONSE,
            FrameKind::Error => MSG_ERROR,
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            MSG_REQUEST => Ok(FrameKind::Request),
            MSG_RESPONSE => Ok(FrameKind::Response),
            MSG_ERROR => Ok(FrameKind::Error),
            other => Err(other),
        }
    }
}

/// One decoded frame. `kind` is the raw byte so unknown kinds can be
/// reported by the caller rather than failing the read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn kind(&self) -> Result<FrameKind, u8> {
        FrameKind::try_from(self.kind)
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Read one frame. `Ok(None)` means the peer closed between frames; EOF
/// inside a frame is an error. Frames longer than `max_frame_bytes`
/// (kind byte included) are refused before any payload is read.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> io::Result<Option<Frame>> {
    let frame_len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if frame_len == 0 {
        return Err(invalid("empty frame: kind byte missing".to_string()));
    }
    if frame_len > max_frame_bytes {
        return Err(invalid(format!(
            "frame of {} bytes exceeds limit of {}",
            frame_len, max_frame_bytes
        )));
    }

    let kind = reader.read_u8().await?;
    let mut payload = BytesMut::zeroed(frame_len as usize - 1);
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame {
        kind,
        payload: payload.freeze(),
    }))
}

/// Write one frame as a single buffered write, then flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: FrameKind,
    payload: &[u8],
) -> io::Result<()> {
    let frame_len = u32::try_from(payload.len() + 1).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload of {} bytes cannot be framed", payload.len()),
        )
    })?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(frame_len);
    buf.put_u8(kind.as_byte());
    buf.put_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_frame_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameKind::Response, b"abc").await.unwrap();
        assert_eq!(buf, vec![0, 0, 0, 4, MSG_RESPONSE, b'a', b'b', b'c']);

        let mut cursor = Cursor::new(buf);
        let frame = read_frame(&mut cursor, 1024).await.unwrap().unwrap();
        assert_eq!(frame.kind(), Ok(FrameKind::Response));
        assert_eq!(&frame.payload[..], b"abc");
        assert!(read_frame(&mut cursor, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameKind::Request, b"abcdef").await.unwrap();
        buf.truncate(buf.len() - 2);
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor, 1024).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameKind::Request, &[0u8; 64]).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor, 16).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let mut cursor = Cursor::new(vec![0u8, 0, 0, 0]);
        let err = read_frame(&mut cursor, 16).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_unknown_kind() {
        assert_eq!(FrameKind::try_from(0x03), Err(0x03));
        assert_eq!(FrameKind::Error.as_byte(), MSG_ERROR);
    }
}
