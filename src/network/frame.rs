//! Length-prefixed framing: a 4-byte big-endian length, then the payload.

use crate::utils::{NetworkError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload a reader accepts
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Write one frame and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| NetworkError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame
///
/// # Errors
///
/// An early close or short read is an I/O error; a length above `max_size`
/// is `NetworkError::FrameTooLarge` and nothing past the prefix is read.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_size: usize) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > max_size {
        return Err(NetworkError::FrameTooLarge {
            size: len,
            max: max_size,
        }
        .into());
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ErrorKind;

    #[tokio::test]
    async fn test_frame_layout() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"hello").await.unwrap();
        assert_eq!(buffer, [0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']);

        let mut reader = buffer.as_slice();
        assert_eq!(read_frame(&mut reader, MAX_FRAME_SIZE).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_short_read() {
        let mut reader: &[u8] = &[0, 0, 0, 10, 1, 2, 3];
        let err = read_frame(&mut reader, MAX_FRAME_SIZE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);

        let mut reader: &[u8] = &[0, 0];
        assert!(read_frame(&mut reader, MAX_FRAME_SIZE).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame() {
        let mut reader: &[u8] = &[0x00, 0x10, 0x00, 0x01];
        let err = read_frame(&mut reader, MAX_FRAME_SIZE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }
}
