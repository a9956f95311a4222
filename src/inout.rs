//! Length-delimited frame transport.
//!
//! Every frame travels behind a 16-bit big-endian length prefix, and the
//! reader hands back exactly one frame per call so the connection can keep
//! the stream in single-shot read-arm mode.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame the 2-byte length prefix can describe.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read one length-prefixed frame.
    pub async fn next_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut len = [0u8; 2];
        self.reader.read_exact(&mut len).await?;
        let mut frame = vec![0u8; u16::from_be_bytes(len) as usize];
        self.reader.read_exact(&mut frame).await?;
        Ok(frame)
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame exceeds 16-bit length prefix",
        ));
    }
    writer.write_all(&(frame.len() as u16).to_be_bytes()).await?;
    writer.write_all(frame).await
}
