//! Length-prefixed frame codec.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! UTF-8 JSON (spec.md §4.7, §6). A frame whose declared length exceeds
//! [`MAX_FRAME_BYTES`] is discarded — the body bytes are still read and
//! thrown away so the stream resynchronizes on the next frame boundary
//! instead of desynchronizing for the rest of the connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::MAX_FRAME_BYTES;
use crate::error::NetShieldError;

/// Outcome of attempting to read one frame from a stream.
#[derive(Debug)]
pub enum FrameResult {
    /// A well-formed frame within the size bound.
    Data(Vec<u8>),
    /// An oversized frame was read and discarded; framing was preserved.
    Discarded { declared_len: u32 },
    /// The peer closed the connection cleanly at a frame boundary.
    Closed,
}

/// Writes `body` as one length-prefixed frame. Returns `InvalidFrame` if
/// `body` itself exceeds the maximum — callers on this side of the channel
/// must never attempt to emit an oversized frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> Result<(), NetShieldError> {
    if body.len() > MAX_FRAME_BYTES as usize {
        return Err(NetShieldError::InvalidFrame(format!(
            "refusing to send oversized frame: {} bytes",
            body.len()
        )));
    }
    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame, discarding (without propagating) any frame whose
/// declared length exceeds [`MAX_FRAME_BYTES`]. Returns `Closed` when the
/// peer disconnects cleanly at a frame boundary; any other I/O failure is
/// propagated as `PeerUnavailable`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<FrameResult, NetShieldError> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(reader, &mut len_buf).await? {
        None => return Ok(FrameResult::Closed),
        Some(()) => {}
    }
    let declared_len = u32::from_be_bytes(len_buf);

    if declared_len > MAX_FRAME_BYTES {
        discard_bytes(reader, declared_len as usize).await?;
        return Ok(FrameResult::Discarded { declared_len });
    }

    let mut body = vec![0u8; declared_len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| NetShieldError::PeerUnavailable(e.to_string()))?;
    Ok(FrameResult::Data(body))
}

/// Like `read_exact`, but treats a zero-byte read at the very start as a
/// clean peer close (`Ok(None)`) rather than an error.
async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<Option<()>, NetShieldError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|e| NetShieldError::PeerUnavailable(e.to_string()))?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(NetShieldError::PeerUnavailable(
                    "connection closed mid-frame".into(),
                ))
            };
        }
        filled += n;
    }
    Ok(Some(()))
}

/// Reads and discards exactly `n` bytes to resynchronize framing after
/// rejecting an oversized frame.
async fn discard_bytes<R: AsyncRead + Unpin>(
    reader: &mut R,
    mut n: usize,
) -> Result<(), NetShieldError> {
    let mut scratch = [0u8; 4096];
    while n > 0 {
        let take = n.min(scratch.len());
        reader
            .read_exact(&mut scratch[..take])
            .await
            .map_err(|e| NetShieldError::PeerUnavailable(e.to_string()))?;
        n -= take;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_write_then_read_round_trips_exact_bytes() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello world").await.unwrap();

        let mut cursor = Cursor::new(buf);
        match read_frame(&mut cursor).await.unwrap() {
            FrameResult::Data(body) => assert_eq!(body, b"hello world"),
            _ => panic!("expected Data"),
        }
    }

    #[tokio::test]
    async fn test_write_rejects_oversized_body() {
        let mut buf = Vec::new();
        let oversized = vec![0u8; MAX_FRAME_BYTES as usize + 1];
        let result = write_frame(&mut buf, &oversized).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_read_discards_oversized_frame_and_resyncs() {
        let mut buf = Vec::new();
        // Hand-craft a frame whose declared length exceeds the limit.
        let declared = MAX_FRAME_BYTES + 100;
        buf.extend_from_slice(&declared.to_be_bytes());
        buf.extend(std::iter::repeat(0xABu8).take(declared as usize));
        // Followed by a legitimate frame.
        write_frame(&mut buf, b"next frame").await.unwrap();

        let mut cursor = Cursor::new(buf);
        match read_frame(&mut cursor).await.unwrap() {
            FrameResult::Discarded { declared_len } => assert_eq!(declared_len, declared),
            _ => panic!("expected Discarded"),
        }
        match read_frame(&mut cursor).await.unwrap() {
            FrameResult::Data(body) => assert_eq!(body, b"next frame"),
            _ => panic!("expected Data after resync"),
        }
    }

    #[tokio::test]
    async fn test_read_returns_closed_on_clean_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        match read_frame(&mut cursor).await.unwrap() {
            FrameResult::Closed => {}
            _ => panic!("expected Closed"),
        }
    }

    #[tokio::test]
    async fn test_read_errors_on_truncated_length_prefix() {
        let mut cursor = Cursor::new(vec![0u8, 1u8]);
        assert!(read_frame(&mut cursor).await.is_err());
    }
}
