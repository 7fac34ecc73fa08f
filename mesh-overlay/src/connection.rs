//! Reliable, in-order delivery over one unreliable peer channel.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │  send_message / receive           ConnectionSession (concurrent mode)
//!      │                                    ┌──────────────────────┐
//!      │  ─── or ───────────────────────▶   │ commands (mpsc)      │
//!      │                                    │ delivered (mpsc)     │
//!      ▼                                    └──────────┬───────────┘
//!  ReliableConnection                                  │ event_loop task
//!    ├── SendWindow   (acks, retransmit timers)        │
//!    ├── WindowBuffer (out-of-order arrivals)          │
//!    ├── UidGenerator (per-connection indices)         │
//!    └── Channel      (fire-and-forget send)  ◀────────┘ ChannelEvents
//! ```
//!
//! # Two usage modes
//!
//! **Direct**: drive the state machine yourself:
//! ```ignore
//! let mut conn = ReliableConnection::new("me", "peer", channel, ConnectionConfig::default())?;
//! conn.send_data(json!("hello"))?;              // Ok(false) = window full, retry later
//! for msg in conn.receive(inbound) { ... }       // released in order
//! conn.retransmit_due(Instant::now());           // when next_retransmit_at() passes
//! ```
//!
//! **Concurrent**: spawn a background event loop via `run()`:
//! ```ignore
//! let mut session = ReliableConnection::new(..)?.run(events);
//! session.send_data(json!("hello")).await?;
//! let msg = session.recv().await?;
//! session.close().await;
//! ```
//!
//! Either way exactly one execution context touches a connection's state.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::channel::{Channel, ChannelError, ChannelEvent, EventStream};
use crate::config::{ConfigError, ConnectionConfig};
use crate::message::{MessageHeader, MessageType, SequencedMessage, UidGenerator};
use crate::send_window::{SendWindow, WindowError};
use crate::state::ConnectionState;
use crate::window::WindowBuffer;

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("connection closed")]
    Closed,
    #[error("send window contract violated: {0}")]
    Window(#[from] WindowError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// ReliableConnection
// ---------------------------------------------------------------------------

/// Protocol state for one peer channel.
pub struct ReliableConnection<C> {
    local: String,
    peer: String,
    channel: C,
    config: ConnectionConfig,
    state: ConnectionState,
    send_window: SendWindow,
    receive_window: WindowBuffer,
    uids: UidGenerator,
}

impl<C: Channel> ReliableConnection<C> {
    /// Wrap an already-established channel between `local` and `peer`.
    pub fn new(
        local: impl Into<String>,
        peer: impl Into<String>,
        channel: C,
        config: ConnectionConfig,
    ) -> Result<Self, ConnError> {
        config.validate()?;
        let local = local.into();
        let space = config.sequence_space();
        Ok(Self {
            uids: UidGenerator::new(local.clone(), config.max_message_index),
            send_window: SendWindow::new(config.window_size, space, config.retransmit_interval),
            receive_window: WindowBuffer::new(config.window_size, space),
            state: ConnectionState::Open,
            peer: peer.into(),
            local,
            channel,
            config,
        })
    }

    /// Node id stamped on outgoing messages.
    pub fn local(&self) -> &str {
        &self.local
    }

    /// Id of the peer at the other end of the channel.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Settings this connection was built with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Send-side window state.
    pub fn send_window(&self) -> &SendWindow {
        &self.send_window
    }

    /// Receive-side window state.
    pub fn receive_window(&self) -> &WindowBuffer {
        &self.receive_window
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Stamp `body` with the next uid and send it reliably.
    ///
    /// Returns `Ok(false)` when the index falls outside the current window;
    /// that is backpressure, not an error, and the index is not consumed, so
    /// the caller may simply retry once acknowledgements arrive.
    pub fn send_message(&mut self, header: MessageHeader, body: Value) -> Result<bool, ConnError> {
        if !self.state.is_open() {
            return Err(ConnError::Closed);
        }
        let message = SequencedMessage {
            uid: self.uids.peek(),
            header,
            body,
        };
        let accepted = self.send(message)?;
        if accepted {
            self.uids.generate();
        }
        Ok(accepted)
    }

    /// [`send_message`](Self::send_message) with a plain `msg` header.
    pub fn send_data(&mut self, body: Value) -> Result<bool, ConnError> {
        self.send_message(MessageHeader::new(MessageType::Msg), body)
    }

    fn send(&mut self, message: SequencedMessage) -> Result<bool, ConnError> {
        if self.send_window.can_reset() {
            self.send_window.reset()?;
            log::debug!(
                "[conn {}→{}] send window → epoch {}",
                self.local,
                self.peer,
                self.send_window.epoch()
            );
        }

        let Some(index) = message.uid.sequence() else {
            return Ok(false);
        };
        if !self.send_window.admits(index) {
            log::debug!(
                "[conn {}→{}] index {index} beyond window (upper bound {})",
                self.local,
                self.peer,
                self.send_window.upper_bound()
            );
            return Ok(false);
        }

        self.transmit(&message);
        self.send_window.record_sent(message, Instant::now());
        log::debug!(
            "[conn {}→{}] → DATA index={index} in_flight={}",
            self.local,
            self.peer,
            self.send_window.in_flight()
        );
        Ok(true)
    }

    fn transmit(&self, message: &SequencedMessage) {
        if let Err(e) = self.channel.send(message) {
            // Treated like any lost message: the timer (or the peer's
            // retransmission, for acks) recovers it.
            log::warn!("[conn {}→{}] channel send failed: {e}", self.local, self.peer);
        }
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Handle one inbound message from the channel.
    ///
    /// Returns the application messages this call released, in order.
    /// Acknowledgements and malformed or out-of-window messages release
    /// nothing.
    pub fn receive(&mut self, message: SequencedMessage) -> Vec<SequencedMessage> {
        if !self.state.is_open() {
            return Vec::new();
        }

        if message.is_ack() {
            match message.acked_uid().and_then(|uid| uid.sequence()) {
                Some(index) => {
                    let cancelled = self.send_window.on_ack(index);
                    log::debug!(
                        "[conn {}→{}] ← ACK index={index} timer_cancelled={cancelled}",
                        self.local,
                        self.peer
                    );
                }
                None => log::debug!("[conn {}→{}] ignoring malformed ack", self.local, self.peer),
            }
            return Vec::new();
        }

        let Some(index) = message.uid.sequence() else {
            log::debug!(
                "[conn {}→{}] ignoring data with index {}",
                self.local,
                self.peer,
                message.uid.index
            );
            return Vec::new();
        };

        // Every data message is acknowledged, duplicates included.
        match SequencedMessage::ack(self.local.clone(), &message.uid) {
            Ok(ack) => self.transmit(&ack),
            Err(e) => log::warn!("[conn {}→{}] cannot build ack: {e}", self.local, self.peer),
        }

        if !self.receive_window.accept(index, message) {
            log::debug!(
                "[conn {}→{}] ← DATA index={index} outside window (epoch {}, expected slot {})",
                self.local,
                self.peer,
                self.receive_window.epoch(),
                self.receive_window.expected_index()
            );
            return Vec::new();
        }

        let released = self.receive_window.drain_in_order();
        log::debug!(
            "[conn {}→{}] ← DATA index={index} released={}",
            self.local,
            self.peer,
            released.len()
        );
        released
    }

    // -----------------------------------------------------------------------
    // Timers and teardown
    // -----------------------------------------------------------------------

    /// When the earliest outstanding retransmission is due.
    pub fn next_retransmit_at(&self) -> Option<Instant> {
        self.send_window.next_deadline()
    }

    /// Retransmit every message whose timer is due at `now`.
    ///
    /// Returns how many messages were resent.
    pub fn retransmit_due(&mut self, now: Instant) -> usize {
        if !self.state.is_open() {
            return 0;
        }
        let due = self.send_window.due_for_retransmit(now);
        for message in &due {
            log::debug!(
                "[conn {}→{}] timeout, retransmit index={}",
                self.local,
                self.peer,
                message.uid.index
            );
            self.transmit(message);
        }
        due.len()
    }

    /// Tear down: cancel every retransmission timer and drop buffered
    /// messages.  Returns how many timers were still armed.
    pub fn close(&mut self) -> usize {
        if !self.state.is_open() {
            return 0;
        }
        self.state = ConnectionState::Closed;
        let cancelled = self.send_window.clear();
        self.receive_window = WindowBuffer::new(
            self.config.window_size,
            self.config.sequence_space(),
        );
        log::info!(
            "[conn {}→{}] closed ({cancelled} retransmission timer(s) cancelled)",
            self.local,
            self.peer
        );
        cancelled
    }
}

impl<C: Channel + Send + 'static> ReliableConnection<C> {
    /// Spawn a background event loop and return a [`ConnectionSession`].
    ///
    /// The loop multiplexes application sends, channel events and the
    /// earliest retransmission deadline with `tokio::select!`.
    ///
    /// # Shutdown
    ///
    /// The loop stops, cancelling all timers, when the channel reports
    /// [`ChannelEvent::Close`], when its event stream ends, or when the
    /// session is closed or dropped.
    pub fn run(self, events: EventStream) -> ConnectionSession {
        let (send_tx, send_rx) = mpsc::channel::<Outbound>(64);
        let (recv_tx, recv_rx) = mpsc::unbounded_channel();
        let peer = self.peer.clone();

        let handle = tokio::spawn(event_loop(self, events, send_rx, recv_tx));

        ConnectionSession {
            peer,
            send_tx,
            recv_rx,
            handle,
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionSession
// ---------------------------------------------------------------------------

struct Outbound {
    header: MessageHeader,
    body: Value,
    reply: oneshot::Sender<Result<bool, ConnError>>,
}

type Delivery = Result<SequencedMessage, ConnError>;

/// Handle returned by [`ReliableConnection::run`].
pub struct ConnectionSession {
    peer: String,
    send_tx: mpsc::Sender<Outbound>,
    recv_rx: mpsc::UnboundedReceiver<Delivery>,
    handle: JoinHandle<()>,
}

impl ConnectionSession {
    /// Id of the peer this session talks to.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send one message; `Ok(false)` means the window is full, retry later.
    pub async fn send(&self, header: MessageHeader, body: Value) -> Result<bool, ConnError> {
        let (reply, accepted) = oneshot::channel();
        self.send_tx
            .send(Outbound {
                header,
                body,
                reply,
            })
            .await
            .map_err(|_| ConnError::Closed)?; // event loop has exited
        accepted.await.map_err(|_| ConnError::Closed)?
    }

    pub async fn send_data(&self, body: Value) -> Result<bool, ConnError> {
        self.send(MessageHeader::new(MessageType::Msg), body).await
    }

    /// Next message released in order by the peer.
    ///
    /// Channel errors surface as `Err(ConnError::Channel)` and the session
    /// keeps running; `Err(ConnError::Closed)` means it has ended.
    pub async fn recv(&mut self) -> Result<SequencedMessage, ConnError> {
        self.recv_rx.recv().await.unwrap_or(Err(ConnError::Closed))
    }

    /// Stop the event loop and wait for it to finish.
    pub async fn close(self) {
        let Self {
            send_tx, handle, ..
        } = self;
        drop(send_tx);
        let _ = handle.await;
    }
}

// ---------------------------------------------------------------------------
// Background event loop (concurrent mode)
// ---------------------------------------------------------------------------

async fn event_loop<C: Channel>(
    mut conn: ReliableConnection<C>,
    mut events: EventStream,
    mut app_rx: mpsc::Receiver<Outbound>,
    app_tx: mpsc::UnboundedSender<Delivery>,
) {
    // A "disarmed" timer fires very far in the future; the guard in select!
    // keeps it from being polled when nothing is in flight.
    let far_future = Duration::from_secs(365 * 24 * 3600);

    loop {
        let deadline = conn.next_retransmit_at();

        tokio::select! {
            // ── Branch 1: message from the application ──────────────────
            command = app_rx.recv() => {
                match command {
                    None => {
                        log::debug!("[conn {}→{}] session closed by application", conn.local, conn.peer);
                        break;
                    }
                    Some(Outbound { header, body, reply }) => {
                        let _ = reply.send(conn.send_message(header, body));
                    }
                }
            }

            // ── Branch 2: channel event ─────────────────────────────────
            event = events.recv() => {
                match event {
                    Some(ChannelEvent::Data(message)) => {
                        for released in conn.receive(message) {
                            let _ = app_tx.send(Ok(released));
                        }
                    }
                    Some(ChannelEvent::Error(e)) => {
                        log::warn!("[conn {}→{}] channel error: {e}", conn.local, conn.peer);
                        let _ = app_tx.send(Err(ConnError::Channel(e)));
                    }
                    Some(ChannelEvent::Close) | None => {
                        log::info!("[conn {}→{}] channel closed", conn.local, conn.peer);
                        let _ = app_tx.send(Err(ConnError::Closed));
                        break;
                    }
                }
            }

            // ── Branch 3: retransmission timeout ────────────────────────
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(|| Instant::now() + far_future)),
                if deadline.is_some() =>
            {
                conn.retransmit_due(Instant::now());
            }
        }
    }

    conn.close();
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::message::{MessageUid, ACK_INDEX};
    use serde_json::json;

    const TICK: Duration = Duration::from_secs(10);

    /// Connection whose outbound traffic is observable on the returned stream.
    fn conn(config: ConnectionConfig) -> (ReliableConnection<MemoryChannel>, EventStream) {
        let (chan, out) = MemoryChannel::new();
        let conn = ReliableConnection::new("me", "peer", chan, config).unwrap();
        (conn, out)
    }

    fn small() -> ConnectionConfig {
        ConnectionConfig::default()
            .with_window_size(2)
            .with_retransmit_interval(TICK)
    }

    fn outbound(out: &mut EventStream) -> Vec<SequencedMessage> {
        let mut sent = Vec::new();
        while let Ok(ChannelEvent::Data(m)) = out.try_recv() {
            sent.push(m);
        }
        sent
    }

    fn data_from_peer(index: i64) -> SequencedMessage {
        SequencedMessage {
            uid: MessageUid::new("peer", index),
            header: MessageHeader::new(MessageType::Msg),
            body: json!(index),
        }
    }

    fn ack_for(index: i64) -> SequencedMessage {
        SequencedMessage::ack("peer", &MessageUid::new("me", index)).unwrap()
    }

    fn indices(messages: &[SequencedMessage]) -> Vec<i64> {
        messages.iter().map(|m| m.uid.index).collect()
    }

    #[test]
    fn send_stamps_uid_and_transmits() {
        let (mut c, mut out) = conn(ConnectionConfig::default());
        assert!(c.send_data(json!("hello")).unwrap());
        assert!(c.send_data(json!("again")).unwrap());

        let sent = outbound(&mut out);
        assert_eq!(indices(&sent), vec![0, 1]);
        assert_eq!(sent[0].uid.source_node_uuid, "me");
        assert_eq!(sent[0].body, json!("hello"));
        assert_eq!(c.send_window().in_flight(), 2);
    }

    #[test]
    fn full_window_rejects_without_consuming_index() {
        let (mut c, mut out) = conn(small());
        assert!(c.send_data(json!(0)).unwrap());
        assert!(c.send_data(json!(1)).unwrap());
        assert!(!c.send_data(json!(2)).unwrap());
        assert!(!c.send_data(json!(2)).unwrap());
        assert_eq!(indices(&outbound(&mut out)), vec![0, 1]);

        c.receive(ack_for(0));
        c.receive(ack_for(1));
        assert!(c.send_data(json!(2)).unwrap());
        assert_eq!(indices(&outbound(&mut out)), vec![2]);
        assert_eq!(c.send_window().epoch(), 1);
    }

    #[test]
    fn window_resets_after_each_message_acked() {
        let (mut c, _out) = conn(ConnectionConfig::default());
        for i in 0..10 {
            assert!(c.send_data(json!(i)).unwrap());
            assert!(!c.send_window().can_reset());
            c.receive(ack_for(i));
        }
        assert!(c.send_window().can_reset());
    }

    #[test]
    fn out_of_order_arrivals_released_in_order() {
        let (mut c, mut out) = conn(ConnectionConfig::default());
        assert!(c.receive(data_from_peer(2)).is_empty());
        assert_eq!(c.receive(data_from_peer(0)).len(), 1);
        let released = c.receive(data_from_peer(1));
        assert_eq!(indices(&released), vec![1, 2]);

        let acks = outbound(&mut out);
        assert_eq!(acks.len(), 3);
        assert!(acks.iter().all(|a| a.is_ack() && a.uid.index == ACK_INDEX));
        let acked: Vec<i64> = acks.iter().map(|a| a.acked_uid().unwrap().index).collect();
        assert_eq!(acked, vec![2, 0, 1]);
    }

    #[test]
    fn duplicate_is_acked_but_not_redelivered() {
        let (mut c, mut out) = conn(ConnectionConfig::default());
        assert_eq!(c.receive(data_from_peer(0)).len(), 1);
        assert!(c.receive(data_from_peer(0)).is_empty());
        assert_eq!(outbound(&mut out).len(), 2);

        // duplicate of a buffered, not yet released message
        assert!(c.receive(data_from_peer(3)).is_empty());
        assert!(c.receive(data_from_peer(3)).is_empty());
        c.receive(data_from_peer(1));
        assert_eq!(indices(&c.receive(data_from_peer(2))), vec![2, 3]);
    }

    #[test]
    fn out_of_window_data_dropped_but_acked() {
        let (mut c, mut out) = conn(small());
        assert!(c.receive(data_from_peer(5)).is_empty());
        assert_eq!(outbound(&mut out).len(), 1);
        assert_eq!(c.receive_window().occupied(), 0);
    }

    #[test]
    fn unacked_message_retransmitted_every_interval() {
        let (mut c, mut out) = conn(small());
        c.send_data(json!("x")).unwrap();
        let first = outbound(&mut out);

        let later = Instant::now() + TICK;
        assert_eq!(c.retransmit_due(later), 1);
        assert_eq!(outbound(&mut out), first);
        assert_eq!(c.retransmit_due(later + TICK), 1);
        assert_eq!(outbound(&mut out), first);
    }

    #[test]
    fn ack_stops_retransmission() {
        let (mut c, mut out) = conn(small());
        c.send_data(json!("x")).unwrap();
        outbound(&mut out);

        c.receive(ack_for(0));
        assert_eq!(c.next_retransmit_at(), None);
        assert_eq!(c.retransmit_due(Instant::now() + TICK * 5), 0);
        assert!(outbound(&mut out).is_empty());
    }

    #[test]
    fn malformed_inputs_are_ignored() {
        let (mut c, mut out) = conn(ConnectionConfig::default());
        let mut bad_ack = ack_for(0);
        bad_ack.body = json!({ "nope": true });
        assert!(c.receive(bad_ack).is_empty());
        assert!(c.receive(data_from_peer(-4)).is_empty());
        assert!(outbound(&mut out).is_empty());

        // ack for a message never sent is only a flag write
        assert!(c.receive(ack_for(1)).is_empty());
        assert_eq!(c.send_window().in_flight(), 0);
    }

    #[test]
    fn close_cancels_timers_and_rejects_sends() {
        let (mut c, mut out) = conn(ConnectionConfig::default());
        for i in 0..3 {
            c.send_data(json!(i)).unwrap();
        }
        outbound(&mut out);

        assert_eq!(c.close(), 3);
        assert_eq!(c.state(), ConnectionState::Closed);
        assert_eq!(c.next_retransmit_at(), None);
        assert_eq!(c.retransmit_due(Instant::now() + TICK * 2), 0);
        assert!(matches!(c.send_data(json!(9)), Err(ConnError::Closed)));
        assert!(c.receive(data_from_peer(0)).is_empty());
        assert!(outbound(&mut out).is_empty());
        assert_eq!(c.close(), 0);
    }

    #[test]
    fn invalid_config_rejected() {
        let (chan, _out) = MemoryChannel::new();
        let cfg = ConnectionConfig::default().with_window_size(0);
        assert!(matches!(
            ReliableConnection::new("me", "peer", chan, cfg),
            Err(ConnError::Config(ConfigError::ZeroWindow))
        ));
    }

    /// Shuttle every pending message between two directly wired connections.
    fn pump(
        a: &mut ReliableConnection<MemoryChannel>,
        a_in: &mut EventStream,
        b: &mut ReliableConnection<MemoryChannel>,
        b_in: &mut EventStream,
    ) -> Vec<SequencedMessage> {
        let mut at_b = Vec::new();
        loop {
            let mut moved = false;
            while let Ok(ChannelEvent::Data(m)) = b_in.try_recv() {
                at_b.extend(b.receive(m));
                moved = true;
            }
            while let Ok(ChannelEvent::Data(m)) = a_in.try_recv() {
                a.receive(m);
                moved = true;
            }
            if !moved {
                return at_b;
            }
        }
    }

    #[test]
    fn sequence_space_wraps_across_epochs() {
        // indices 0..=4 with window 2 → epochs [0,1] [2,3] [4], then back to 0
        let cfg = small().with_max_message_index(4);
        let ((to_b, mut a_in), (to_a, mut b_in)) = MemoryChannel::pair();
        let mut a = ReliableConnection::new("a", "b", to_b, cfg.clone()).unwrap();
        let mut b = ReliableConnection::new("b", "a", to_a, cfg).unwrap();

        let mut delivered = Vec::new();
        for n in 0..13 {
            assert!(a.send_data(json!(n)).unwrap(), "message {n} rejected");
            delivered.extend(pump(&mut a, &mut a_in, &mut b, &mut b_in));
        }

        let bodies: Vec<Value> = delivered.iter().map(|m| m.body.clone()).collect();
        assert_eq!(bodies, (0..13).map(|n| json!(n)).collect::<Vec<_>>());
        let wire: Vec<i64> = delivered.iter().map(|m| m.uid.index).collect();
        assert_eq!(wire, vec![0, 1, 2, 3, 4, 0, 1, 2, 3, 4, 0, 1, 2]);
        assert_eq!(a.send_window().in_flight(), 0);
    }
}
