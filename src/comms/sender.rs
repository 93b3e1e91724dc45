//! The implementation of the sending end of the estimator channel.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{LEN_TYPE_SIZE, LenType};

/// The sending end handle of the communication.
pub struct FrameSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    /// Creates a new `FrameSender` instance.
    ///
    /// # Arguments
    /// * `tx` - The underlying writer.
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Sends an already encoded frame through the inner writer.
    ///
    /// # Arguments
    /// * `frame` - The frame's body.
    ///
    /// # Returns
    /// A result object that returns `io::Error` on failure.
    pub async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let header = (frame.len() as LenType).to_be_bytes();

        self.tx.write_all(&header).await?;
        self.tx.write_all(frame).await?;
        self.tx.flush().await
    }

    /// Encodes `msg` as JSON and sends it through the inner writer.
    ///
    /// # Arguments
    /// * `msg` - A serializable object.
    ///
    /// # Returns
    /// A result object that returns `io::Error` on failure.
    pub async fn send_json<T: Serialize>(&mut self, msg: &T) -> io::Result<()> {
        let Self { buf, tx } = self;

        buf.clear();
        buf.resize(LEN_TYPE_SIZE, 0);
        serde_json::to_writer(&mut *buf, msg)?;

        let len = buf.len() - LEN_TYPE_SIZE;
        let header = (len as LenType).to_be_bytes();
        buf[..header.len()].copy_from_slice(&header);

        tx.write_all(buf).await?;
        tx.flush().await
    }

    /// Shuts down the writing half, the peer will read an end of stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.tx.shutdown().await
    }
}
