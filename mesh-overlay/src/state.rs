//! Connection lifecycle states.
//!
//! The underlying channel is already established when a
//! [`crate::connection::ReliableConnection`] is created, so there is no
//! handshake to model:
//!
//! ```text
//!  OPEN ──close() / channel Close / session dropped──▶ CLOSED
//! ```
//!
//! Entering `Closed` cancels every retransmission timer and clears both
//! windows.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Sending and receiving.
    #[default]
    Open,
    /// Torn down; sends fail and inbound messages are ignored.
    Closed,
}

impl ConnectionState {
    /// Whether sends and receives are still processed.
    pub fn is_open(self) -> bool {
        self == Self::Open
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
