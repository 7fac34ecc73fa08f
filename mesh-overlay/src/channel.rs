//! Point-to-point channel abstraction.
//!
//! The reliability layer needs very little from the transport underneath it:
//! a way to hand off one [`SequencedMessage`] ([`Channel::send`]) and a
//! stream of inbound [`ChannelEvent`]s.  The channel may drop, duplicate or
//! reorder messages; [`crate::connection::ReliableConnection`] compensates.
//!
//! Two implementations live here:
//! - [`MemoryChannel`]: in-process, backed by a tokio mpsc channel.
//! - [`UdpChannel`]: JSON datagrams over a tokio `UdpSocket`, one peer.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::message::{MessageError, SequencedMessage};

/// Largest datagram [`UdpChannel`] will read.
const MAX_DATAGRAM: usize = 65_535;

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// Outbound half of a peer channel.
///
/// `send` is fire-and-forget: success means the message was handed to the
/// transport, not that it arrived.
pub trait Channel {
    fn send(&self, message: &SequencedMessage) -> Result<(), ChannelError>;
}

impl<C: Channel + ?Sized> Channel for Arc<C> {
    fn send(&self, message: &SequencedMessage) -> Result<(), ChannelError> {
        (**self).send(message)
    }
}

/// Inbound events produced by a peer channel.
#[derive(Debug)]
pub enum ChannelEvent {
    Data(SequencedMessage),
    Close,
    Error(ChannelError),
}

/// Receiving end of a channel's event stream.
pub type EventStream = mpsc::UnboundedReceiver<ChannelEvent>;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("channel closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

/// In-process channel: everything sent shows up as [`ChannelEvent::Data`]
/// on the paired [`EventStream`].
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl MemoryChannel {
    /// A channel whose sends appear on the returned stream.
    pub fn new() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Two cross-wired endpoints: what one side sends, the other receives.
    pub fn pair() -> ((Self, EventStream), (Self, EventStream)) {
        let (to_b, b_events) = Self::new();
        let (to_a, a_events) = Self::new();
        ((to_b, a_events), (to_a, b_events))
    }

    /// Signal [`ChannelEvent::Close`] to the receiving side.
    pub fn close(&self) {
        let _ = self.tx.send(ChannelEvent::Close);
    }

    /// Inject an error event on the receiving side.
    pub fn fail(&self, error: ChannelError) {
        let _ = self.tx.send(ChannelEvent::Error(error));
    }
}

impl Channel for MemoryChannel {
    fn send(&self, message: &SequencedMessage) -> Result<(), ChannelError> {
        self.tx
            .send(ChannelEvent::Data(message.clone()))
            .map_err(|_| ChannelError::Closed)
    }
}

// ---------------------------------------------------------------------------
// UdpChannel
// ---------------------------------------------------------------------------

/// A datagram channel to one fixed peer.
///
/// Two background tasks own the socket.  The reader turns datagrams into
/// events: datagrams from other addresses are ignored; undecodable ones are
/// reported as [`ChannelEvent::Error`] and reading continues.  The writer
/// awaits `send_to` for each queued datagram, so [`Channel::send`] never
/// races the socket becoming writable.  Both tasks are aborted when the
/// channel is dropped.
#[derive(Debug)]
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl UdpChannel {
    /// Bind `local_addr` and talk to `peer`.
    ///
    /// Passing port 0 lets the OS choose an ephemeral port.
    pub async fn bind(
        local_addr: SocketAddr,
        peer: SocketAddr,
    ) -> Result<(Self, EventStream), ChannelError> {
        let socket = Arc::new(UdpSocket::bind(local_addr).await?);
        let (tx, rx) = mpsc::unbounded_channel();
        let (outbound, queued) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(Arc::clone(&socket), peer, tx));
        let writer = tokio::spawn(write_loop(Arc::clone(&socket), peer, queued));
        log::debug!("[udp] bound {} → {}", socket.local_addr()?, peer);
        Ok((
            Self {
                socket,
                peer,
                outbound,
                reader,
                writer,
            },
            rx,
        ))
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        Ok(self.socket.local_addr()?)
    }

    /// The one peer this channel talks to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Stop both tasks; the event stream ends after any buffered events.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Channel for UdpChannel {
    fn send(&self, message: &SequencedMessage) -> Result<(), ChannelError> {
        let bytes = message.encode()?;
        self.outbound.send(bytes).map_err(|_| ChannelError::Closed)
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn write_loop(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut queued: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(bytes) = queued.recv().await {
        // A failed send is just another lost datagram; the retransmission
        // timer covers it.
        if let Err(e) = socket.send_to(&bytes, peer).await {
            log::warn!("[udp] send to {peer} failed: {e}");
        }
    }
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("[udp] receive failed: {e}");
                let _ = events.send(ChannelEvent::Error(e.into()));
                let _ = events.send(ChannelEvent::Close);
                return;
            }
        };
        if from != peer {
            log::debug!("[udp] ignoring datagram from {from}");
            continue;
        }
        let event = match SequencedMessage::decode(&buf[..n]) {
            Ok(message) => ChannelEvent::Data(message),
            Err(e) => ChannelEvent::Error(e.into()),
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
