//! Integration tests for reliable delivery over faulty channels.
//!
//! Each test wires two sessions together with an in-process
//! [`MemoryChannel`] pair, optionally wrapped in a seeded [`LossyChannel`].
//! Time is paused, so ten-second retransmission intervals cost nothing:
//! tokio advances the clock whenever every task is waiting on a timer.
//! The last test runs over real UDP sockets on the real clock.

use std::time::Duration;

use mesh_overlay::{
    ChannelError, ChannelEvent, ConnError, ConnectionConfig, ConnectionSession, LossyChannel,
    MemoryChannel, MessageHeader, MessageType, MessageUid, ReliableConnection, SequencedMessage,
    SimulatorConfig, UdpChannel,
};
use serde_json::{json, Value};
use tokio::sync::mpsc::error::TryRecvError;

/// Two running sessions joined by lossy channels, one fault seed per direction.
fn lossy_pair(config: ConnectionConfig, faults: SimulatorConfig) -> (ConnectionSession, ConnectionSession) {
    let ((to_b, a_events), (to_a, b_events)) = MemoryChannel::pair();
    let to_b = LossyChannel::new(to_b, faults.clone());
    let to_a = LossyChannel::new(
        to_a,
        SimulatorConfig {
            seed: faults.seed.wrapping_add(1),
            ..faults
        },
    );

    let a = ReliableConnection::new("a", "b", to_b, config.clone())
        .expect("config")
        .run(a_events);
    let b = ReliableConnection::new("b", "a", to_a, config)
        .expect("config")
        .run(b_events);
    (a, b)
}

/// Send `body`, backing off while the window is full.
async fn send_blocking(session: &ConnectionSession, body: Value) {
    loop {
        match session.send_data(body.clone()).await {
            Ok(true) => return,
            Ok(false) => tokio::time::sleep(Duration::from_millis(100)).await,
            Err(e) => panic!("send failed: {e}"),
        }
    }
}

async fn transfer(config: ConnectionConfig, faults: SimulatorConfig, count: u64) {
    let (a, mut b) = lossy_pair(config, faults);

    let receiver = tokio::spawn(async move {
        let mut bodies = Vec::new();
        while bodies.len() < count as usize {
            match b.recv().await {
                Ok(message) => bodies.push(message.body),
                Err(ConnError::Channel(_)) => continue,
                Err(e) => panic!("receiver failed: {e}"),
            }
        }
        b.close().await;
        bodies
    });

    for n in 0..count {
        send_blocking(&a, json!(n)).await;
    }

    let bodies = tokio::time::timeout(Duration::from_secs(24 * 3600), receiver)
        .await
        .expect("transfer stalled")
        .expect("receiver task");
    a.close().await;

    let expected: Vec<Value> = (0..count).map(|n| json!(n)).collect();
    assert_eq!(bodies, expected);
}

// ---------------------------------------------------------------------------
// Test 1: clean channel, several window epochs
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_in_order_over_clean_channel() {
    transfer(ConnectionConfig::default(), SimulatorConfig::default(), 35).await;
}

// ---------------------------------------------------------------------------
// Test 2: loss, duplication and reordering in both directions
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_in_order_over_faulty_channel() {
    let faults = SimulatorConfig {
        loss_rate: 0.2,
        duplicate_rate: 0.1,
        reorder_rate: 0.2,
        seed: 42,
    };
    transfer(ConnectionConfig::default(), faults, 30).await;
}

// ---------------------------------------------------------------------------
// Test 3: sequence space wraps several times under faults
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_wraparound_under_faults() {
    let config = ConnectionConfig::default()
        .with_window_size(3)
        .with_max_message_index(6)
        .with_retransmit_interval(Duration::from_secs(1));
    let faults = SimulatorConfig {
        loss_rate: 0.25,
        duplicate_rate: 0.2,
        reorder_rate: 0.25,
        seed: 7,
    };
    transfer(config, faults, 40).await;
}

// ---------------------------------------------------------------------------
// Test 4: both directions at once
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_bidirectional_exchange() {
    let faults = SimulatorConfig {
        loss_rate: 0.1,
        seed: 3,
        ..Default::default()
    };
    let (mut a, mut b) = lossy_pair(ConnectionConfig::default().with_window_size(4), faults);

    async fn exchange(session: &mut ConnectionSession, tag: &str) -> Vec<Value> {
        let mut got = Vec::new();
        for n in 0..12 {
            send_blocking(session, json!(format!("{tag}{n}"))).await;
        }
        while got.len() < 12 {
            if let Ok(message) = session.recv().await {
                got.push(message.body);
            }
        }
        got
    }

    let (from_b, from_a) = tokio::join!(exchange(&mut a, "a"), exchange(&mut b, "b"));
    assert_eq!(from_b, (0..12).map(|n| json!(format!("b{n}"))).collect::<Vec<_>>());
    assert_eq!(from_a, (0..12).map(|n| json!(format!("a{n}"))).collect::<Vec<_>>());

    a.close().await;
    b.close().await;
}

// ---------------------------------------------------------------------------
// Test 5: channel events reach the application
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_channel_error_then_close() {
    let ((to_b, a_events), (to_a, _b_events)) = MemoryChannel::pair();
    let mut a = ReliableConnection::new("a", "b", to_b, ConnectionConfig::default())
        .expect("config")
        .run(a_events);

    to_a.fail(ChannelError::Closed);
    assert!(matches!(a.recv().await, Err(ConnError::Channel(_))));

    // the session keeps running after an error event
    let raw = SequencedMessage {
        uid: MessageUid::new("b", 0),
        header: MessageHeader::new(MessageType::Msg),
        body: json!("still here"),
    };
    mesh_overlay::Channel::send(&to_a, &raw).expect("raw send");
    assert_eq!(a.recv().await.expect("delivery").body, json!("still here"));

    to_a.close();
    assert!(matches!(a.recv().await, Err(ConnError::Closed)));
    assert!(matches!(a.send_data(json!(1)).await, Err(ConnError::Closed)));
    assert!(matches!(a.recv().await, Err(ConnError::Closed)));
}

// ---------------------------------------------------------------------------
// Test 6: closing a session stops retransmission
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_close_stops_retransmission() {
    let ((to_b, a_events), (_to_a, mut b_events)) = MemoryChannel::pair();
    // keeps b's stream open after the connection drops its own sender
    let _still_wired = to_b.clone();
    let a = ReliableConnection::new("a", "b", to_b, ConnectionConfig::default())
        .expect("config")
        .run(a_events);

    for n in 0..3 {
        assert!(a.send_data(json!(n)).await.expect("send"));
    }
    for _ in 0..3 {
        assert!(matches!(b_events.recv().await, Some(ChannelEvent::Data(_))));
    }

    a.close().await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(matches!(b_events.try_recv(), Err(TryRecvError::Empty)));
}

// ---------------------------------------------------------------------------
// Test 7: unacknowledged data is resent on schedule
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_retransmits_until_acknowledged() {
    let interval = Duration::from_secs(10);
    let ((to_b, a_events), (to_a, mut b_events)) = MemoryChannel::pair();
    let a = ReliableConnection::new(
        "a",
        "b",
        to_b,
        ConnectionConfig::default().with_retransmit_interval(interval),
    )
    .expect("config")
    .run(a_events);

    assert!(a.send_data(json!("x")).await.expect("send"));
    let start = tokio::time::Instant::now();

    let mut copies = Vec::new();
    for _ in 0..3 {
        match b_events.recv().await {
            Some(ChannelEvent::Data(m)) => copies.push((m, start.elapsed())),
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(copies.iter().all(|(m, _)| m.uid == copies[0].0.uid));
    assert_eq!(copies[1].1, interval);
    assert_eq!(copies[2].1, interval * 2);

    let ack = SequencedMessage::ack("b", &copies[0].0.uid).expect("ack");
    mesh_overlay::Channel::send(&to_a, &ack).expect("ack send");
    tokio::time::sleep(interval * 5).await;
    assert!(b_events.try_recv().is_err());

    a.close().await;
}

// ---------------------------------------------------------------------------
// Test 8: a fresh UDP session delivers its first message without a retransmit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_udp_first_message_needs_no_retransmission() {
    let interval = Duration::from_secs(2);
    let config = ConnectionConfig::default().with_retransmit_interval(interval);

    let any: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    let probe = tokio::net::UdpSocket::bind(any).await.expect("probe bind");
    let a_addr = probe.local_addr().expect("probe addr");
    drop(probe);

    let (udp_b, b_events) = UdpChannel::bind(any, a_addr).await.expect("bind b");
    let b_addr = udp_b.local_addr().expect("b addr");
    let (udp_a, a_events) = UdpChannel::bind(a_addr, b_addr).await.expect("bind a");

    let a = ReliableConnection::new("a", "b", udp_a, config.clone())
        .expect("config")
        .run(a_events);
    let mut b = ReliableConnection::new("b", "a", udp_b, config)
        .expect("config")
        .run(b_events);

    let start = tokio::time::Instant::now();
    assert!(a.send_data(json!("hello")).await.expect("send"));
    let delivered = tokio::time::timeout(interval / 4, b.recv())
        .await
        .expect("first message waited for a retransmission")
        .expect("delivery");
    assert_eq!(delivered.body, json!("hello"));
    assert!(start.elapsed() < interval / 4);

    a.close().await;
    b.close().await;
}
