//! `mesh-overlay`: reliable peer channels and next-hop routing for a
//! peer-to-peer overlay mesh.
//!
//! # Architecture
//!
//! ```text
//!  ┌────────────┐  SequencedMessage  ┌────────────┐
//!  │ SendWindow │───────────────────▶│ WindowBuf  │  (peer's receive side)
//!  └────┬───────┘                    └─────┬──────┘
//!       │            ACKs                  │
//!       │◀─────────────────────────────────┘
//!       │
//!  ┌────▼───────────────────────────────┐
//!  │        ReliableConnection          │
//!  │  (uids, windows, retransmission)   │
//!  └────┬───────────────────────────────┘
//!       │ send / ChannelEvent stream
//!  ┌────▼──────┐
//!  │  Channel  │  (memory, UDP, or lossy wrapper; may drop/reorder/dup)
//!  └───────────┘
//!
//!  ConnectionGraph ── BFS tree ──▶ RoutingTable (destination → next hop)
//! ```
//!
//! Each module has a single responsibility:
//! - [`message`]: uids, headers, JSON wire format
//! - [`config`]: per-connection tuning
//! - [`window`]: epoch-based sliding window buffer
//! - [`send_window`]: acknowledgement tracking on top of the window
//! - [`timer`]: slot-indexed retransmission timers
//! - [`connection`]: the reliable-delivery state machine and its session task
//! - [`state`]: connection lifecycle
//! - [`channel`]: transport capability plus memory and UDP channels
//! - [`simulator`]: lossy/reordering channel wrapper for testing
//! - [`graph`]: adjacency, spanning tree and routing table

pub mod channel;
pub mod config;
pub mod connection;
pub mod graph;
pub mod message;
pub mod send_window;
pub mod simulator;
pub mod state;
pub mod timer;
pub mod window;

pub use channel::{Channel, ChannelError, ChannelEvent, EventStream, MemoryChannel, UdpChannel};
pub use config::{ConfigError, ConnectionConfig};
pub use connection::{ConnError, ConnectionSession, ReliableConnection};
pub use graph::{ConnectionGraph, RoutingTable, RoutingTreeNode};
pub use message::{
    MessageError, MessageHeader, MessageType, MessageUid, SequencedMessage, UidGenerator,
    ACK_INDEX,
};
pub use simulator::{LossyChannel, SimulatorConfig};
pub use state::ConnectionState;
