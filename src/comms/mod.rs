//! The estimator channel: length-prefixed JSON frames over any async byte stream.

mod receiver;
mod sender;
mod transport;

use log::{debug, info, warn};
use tokio::{
    io::{self, AsyncRead, AsyncWrite},
    net::{TcpStream, ToSocketAddrs},
    sync::mpsc,
};

pub use receiver::FrameReceiver;
pub use sender::FrameSender;
pub use transport::{ChannelTransport, Transport};

#[cfg(test)]
pub(crate) use transport::testing;

type LenType = u64;
const LEN_TYPE_SIZE: usize = std::mem::size_of::<LenType>();

/// Frames larger than this are treated as a corrupted stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Creates both `FrameReceiver` and `FrameSender` network channel parts.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of a frame receiver and sender.
pub fn channel<R, W>(rx: R, tx: W) -> (FrameReceiver<R>, FrameSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (FrameReceiver::new(rx), FrameSender::new(tx))
}

/// Connects to the estimator.
///
/// Once this returns the channel is open and submissions may be made.
///
/// # Arguments
/// * `addr` - The estimator's network address.
///
/// # Returns
/// The outbound transport and the queue of inbound frames, or an io error if failed to connect.
pub async fn connect<A: ToSocketAddrs>(
    addr: A,
) -> io::Result<(ChannelTransport, mpsc::UnboundedReceiver<Vec<u8>>)> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    info!("connected to estimator at {}", stream.peer_addr()?);

    let (rx, tx) = stream.into_split();
    Ok(spawn_io(rx, tx))
}

/// Spawns the reading and writing tasks of a channel.
///
/// The writer drains everything sent through the returned `ChannelTransport`,
/// the reader forwards every received frame, in order, to the returned queue.
/// Both tasks stop when their side of the stream or queue closes.
///
/// # Arguments
/// * `rx` - The reading half of the stream.
/// * `tx` - The writing half of the stream.
///
/// # Returns
/// The outbound transport and the queue of inbound frames.
pub fn spawn_io<R, W>(rx: R, tx: W) -> (ChannelTransport, mpsc::UnboundedReceiver<Vec<u8>>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (mut receiver, mut sender) = channel(rx, tx);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = sender.send(&frame).await {
                warn!("failed to write frame to estimator: {e}");
                return;
            }
        }

        if let Err(e) = sender.shutdown().await {
            debug!("failed to shut down estimator writer: {e}");
        }
    });

    tokio::spawn(async move {
        let mut buf = Vec::new();

        loop {
            match receiver.recv_into(&mut buf).await {
                Ok(frame) => {
                    if in_tx.send(frame.to_vec()).is_err() {
                        debug!("inbound queue closed, stopping reader");
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    info!("estimator closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("failed to read frame from estimator: {e}");
                    break;
                }
            }
        }
    });

    (ChannelTransport::new(out_tx), in_rx)
}
