//! Length-prefixed JSON framing for [`SyncMessage`]s.
//!
//! A frame is a 4-byte big-endian body length followed by the JSON body.
//! Bodies above [`MAX_MESSAGE_SIZE`] are refused when encoding and when
//! reading.

use crate::error::{SyncError, SyncResult};
use crate::protocol::SyncMessage;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum body size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

fn frame_len(size: usize) -> SyncResult<u32> {
    u32::try_from(size)
        .ok()
        .filter(|_| size <= MAX_MESSAGE_SIZE)
        .ok_or(SyncError::FrameTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        })
}

/// Encodes one message as a complete frame, prefix included.
pub fn encode_frame(message: &SyncMessage) -> SyncResult<Vec<u8>> {
    let mut frame = vec![0u8; PREFIX_LEN];
    serde_json::to_writer(&mut frame, message)?;
    let len = frame_len(frame.len() - PREFIX_LEN)?;
    frame[..PREFIX_LEN].copy_from_slice(&len.to_be_bytes());
    Ok(frame)
}

/// Reads the next frame. Returns `None` when the stream ends cleanly between
/// frames; ending inside a frame is an `UnexpectedEof` error.
pub async fn read_message<T: AsyncRead + Unpin>(io: &mut T) -> SyncResult<Option<SyncMessage>> {
    let mut prefix = [0u8; PREFIX_LEN];
    let mut filled = 0;
    while filled < PREFIX_LEN {
        match io.read(&mut prefix[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            n => filled += n,
        }
    }
    let size = u32::from_be_bytes(prefix) as usize;
    frame_len(size)?;

    let mut body = vec![0u8; size];
    io.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Writes one message as a frame and flushes.
pub async fn write_message<T: AsyncWrite + Unpin>(
    io: &mut T,
    message: &SyncMessage,
) -> SyncResult<()> {
    let frame = encode_frame(message)?;
    io.write_all(&frame).await?;
    io.flush().await?;
    Ok(())
}
