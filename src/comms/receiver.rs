use std::io;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN};

/// The receiving end handle of the communication.
pub struct FrameReceiver<R: AsyncRead + Unpin> {
    rx: R,
}

impl<R: AsyncRead + Unpin> FrameReceiver<R> {
    /// Creates a new `FrameReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self { rx }
    }

    /// Waits to receive a new frame from the inner reader.
    ///
    /// # Arguments
    /// * `buf` - The buffer to read into, the returned frame borrows from it.
    ///
    /// # Returns
    /// The frame's body on success or `io::Error` on failure.
    pub async fn recv_into<'buf>(&mut self, buf: &'buf mut Vec<u8>) -> io::Result<&'buf [u8]> {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut size_buf).await?;
        let len = LenType::from_be_bytes(size_buf) as usize;

        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds the maximum of {MAX_FRAME_LEN}"),
            ));
        }

        buf.resize(len, 0);
        self.rx.read_exact(buf).await?;
        Ok(buf.as_slice())
    }

    /// Waits to receive a new frame and decodes it as JSON.
    ///
    /// # Arguments
    /// * `buf` - The buffer to use for reading.
    ///
    /// # Returns
    /// The decoded `T` on success or `io::Error` on failure.
    pub async fn recv_json<T: DeserializeOwned>(&mut self, buf: &mut Vec<u8>) -> io::Result<T> {
        let frame = self.recv_into(buf).await?;
        Ok(serde_json::from_slice(frame)?)
    }
}
