//! Multipart frame codec
//!
//! Wire format of one transmission:
//!
//! ```text
//! [u32 frame count] ([u32 length][bytes]) * count
//! ```
//!
//! All integers are big-endian.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

use super::Frame;

/// 64 MB per frame, large enough for bulk result transfers
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

pub const MAX_FRAMES_PER_MESSAGE: usize = 1024;

fn check_limits(frames: &[Frame]) -> Result<()> {
    if frames.is_empty() || frames.len() > MAX_FRAMES_PER_MESSAGE {
        return Err(Error::malformed(format!(
            "frame count {} outside 1..={}",
            frames.len(),
            MAX_FRAMES_PER_MESSAGE
        )));
    }
    if let Some(frame) = frames.iter().find(|f| f.len() > MAX_FRAME_SIZE) {
        return Err(Error::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Write one frame set and flush it
pub async fn write_frames<W: AsyncWrite + Unpin>(writer: &mut W, frames: &[Frame]) -> Result<()> {
    check_limits(frames)?;

    let total: usize = frames.iter().map(|f| 4 + f.len()).sum();
    let mut buf = Vec::with_capacity(4 + total);
    buf.extend_from_slice(&(frames.len() as u32).to_be_bytes());
    for frame in frames {
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame set
pub async fn read_frames<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<Frame>> {
    let count = reader.read_u32().await? as usize;
    if count == 0 || count > MAX_FRAMES_PER_MESSAGE {
        return Err(Error::malformed(format!(
            "frame count {} outside 1..={}",
            count, MAX_FRAMES_PER_MESSAGE
        )));
    }

    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let len = reader.read_u32().await? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        frames.push(frame);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_survive_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let sent = vec![b"envelope".to_vec(), Vec::new(), vec![7u8; 300]];

        write_frames(&mut client, &sent).await.unwrap();
        write_frames(&mut client, &[b"second".to_vec()]).await.unwrap();

        assert_eq!(read_frames(&mut server).await.unwrap(), sent);
        assert_eq!(read_frames(&mut server).await.unwrap(), vec![b"second".to_vec()]);
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(1).await.unwrap();
        client.write_u32((MAX_FRAME_SIZE + 1) as u32).await.unwrap();

        match read_frames(&mut server).await {
            Err(Error::FrameTooLarge { size, .. }) => assert_eq!(size, MAX_FRAME_SIZE + 1),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_frame_count_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(0).await.unwrap();
        assert!(matches!(
            read_frames(&mut server).await,
            Err(Error::ProtocolMalformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_writer_refuses_empty_set() {
        let (mut client, _server) = tokio::io::duplex(64);
        assert!(write_frames(&mut client, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(1).await.unwrap();
        client.write_u32(10).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        assert!(matches!(read_frames(&mut server).await, Err(Error::Io(_))));
    }
}
