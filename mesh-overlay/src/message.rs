//! Wire envelope exchanged between two directly connected peers.
//!
//! Every unit that crosses a peer channel is a [`SequencedMessage`]:
//!
//! ```text
//!  {
//!    "uid":    { "sourceNodeUuid": "<peer id>", "index": 42 },
//!    "header": { "type": "msg", "targetPeer": "<peer id>" },   // targetPeer optional
//!    "body":   <any JSON value>
//!  }
//! ```
//!
//! Acknowledgements reuse the same envelope: `header.type = "ack"`, the
//! `uid.index` is the sentinel [`ACK_INDEX`] and the body is the
//! [`MessageUid`] being acknowledged.
//!
//! No I/O happens here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sequence index carried by acknowledgements, which are not themselves
/// subject to the reliability protocol.
pub const ACK_INDEX: i64 = -1;

// ---------------------------------------------------------------------------
// Envelope types
// ---------------------------------------------------------------------------

/// Identifies a message within the sequence space of one node-channel pair.
///
/// The pair `(source_node_uuid, index)` is unique; `index` alone is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUid {
    /// Id of the node that sent the message.
    pub source_node_uuid: String,
    /// Sequence index; [`ACK_INDEX`] for acknowledgements.
    pub index: i64,
}

impl MessageUid {
    /// Build a uid from its parts.
    pub fn new(source_node_uuid: impl Into<String>, index: i64) -> Self {
        Self {
            source_node_uuid: source_node_uuid.into(),
            index,
        }
    }

    /// The index as a position in the sequence space, or `None` for the ack
    /// sentinel and any other negative value.
    pub fn sequence(&self) -> Option<u64> {
        u64::try_from(self.index).ok()
    }
}

/// Message kinds carried in [`MessageHeader::kind`].
///
/// Only [`MessageType::Ack`] is interpreted by the reliability layer; the
/// rest belong to the dispatch layer and travel as ordinary data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ack,
    Msg,
    MsgBroadcast,
    NewEdge,
    DestroyEdge,
    NetworkStateRequest,
    NetworkState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer: Option<String>,
}

impl MessageHeader {
    /// Header without a target peer.
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            target_peer: None,
        }
    }

    /// Header for a message addressed to one specific peer.
    pub fn targeted(kind: MessageType, target_peer: impl Into<String>) -> Self {
        Self {
            kind,
            target_peer: Some(target_peer.into()),
        }
    }
}

/// A complete envelope: uid + header + body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedMessage {
    /// Sender id and sequence index.
    pub uid: MessageUid,
    /// Message kind and optional target.
    pub header: MessageHeader,
    /// Application payload, or the acked uid for an ack.
    pub body: Value,
}

impl SequencedMessage {
    /// Build an acknowledgement for `acked`, sent by `local`.
    pub fn ack(local: impl Into<String>, acked: &MessageUid) -> Result<Self, MessageError> {
        Ok(Self {
            uid: MessageUid::new(local, ACK_INDEX),
            header: MessageHeader::new(MessageType::Ack),
            body: serde_json::to_value(acked)?,
        })
    }

    /// Whether this is an acknowledgement.
    pub fn is_ack(&self) -> bool {
        self.header.kind == MessageType::Ack
    }

    /// The uid an acknowledgement refers to.
    ///
    /// Returns `None` for data messages and for acks whose body is not a
    /// well-formed [`MessageUid`].
    pub fn acked_uid(&self) -> Option<MessageUid> {
        if !self.is_ack() {
            return None;
        }
        MessageUid::deserialize(&self.body).ok()
    }

    /// Serialise this message for a datagram transport.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a message from raw datagram bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        if buf.is_empty() {
            return Err(MessageError::Empty);
        }
        Ok(serde_json::from_slice(buf)?)
    }
}

/// Errors that can arise when encoding or parsing an envelope.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("empty datagram")]
    Empty,
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// UidGenerator
// ---------------------------------------------------------------------------

/// Per-connection sequence index generator.
///
/// Yields `0, 1, …, max_message_index` and then wraps back to `0`.
#[derive(Debug, Clone)]
pub struct UidGenerator {
    source: String,
    next: u64,
    max_message_index: u64,
}

impl UidGenerator {
    /// Generator for `source` starting at index 0.
    pub fn new(source: impl Into<String>, max_message_index: u64) -> Self {
        Self {
            source: source.into(),
            next: 0,
            max_message_index,
        }
    }

    /// The uid [`generate`](Self::generate) would return, without consuming it.
    pub fn peek(&self) -> MessageUid {
        MessageUid::new(self.source.clone(), self.next as i64)
    }

    /// Consume and return the next uid.
    pub fn generate(&mut self) -> MessageUid {
        let uid = self.peek();
        self.next = if self.next >= self.max_message_index {
            0
        } else {
            self.next + 1
        };
        uid
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
