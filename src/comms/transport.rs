use std::io;

use tokio::sync::mpsc;

use crate::msg::Outbound;

/// The capability of handing a message to the estimator channel.
///
/// Sending is fire-and-forget: implementations must not block waiting for the
/// peer, the reply (if any) arrives later through the delivery path.
pub trait Transport {
    fn send(&mut self, msg: &Outbound<'_>) -> io::Result<()>;
}

/// A `Transport` that queues encoded messages for a writer task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelTransport {
    /// Creates a new `ChannelTransport`.
    ///
    /// # Arguments
    /// * `tx` - The queue drained by the writer task.
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { tx }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, msg: &Outbound<'_>) -> io::Result<()> {
        let frame = serde_json::to_vec(msg)?;
        self.tx.send(frame).map_err(|_| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                "the estimator writer task has stopped",
            )
        })
    }
}
