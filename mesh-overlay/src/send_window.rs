//! Send-side window state.
//!
//! [`SendWindow`] wraps a [`WindowBuffer`] with one acknowledgement flag per
//! slot and the retransmission timers of the messages in flight.
//!
//! # Protocol contract
//!
//! - A message is admitted iff its absolute index is below
//!   [`WindowBuffer::upper_bound`].  The send side never advances
//!   `expected_index`, so the receive side's `slot >= expected_index` test
//!   would be vacuous here and is not applied.
//! - The window rolls over to the next epoch only after every slot of the
//!   current epoch has been acknowledged; resetting earlier is a
//!   [`WindowError::NotFullyAcknowledged`] contract violation.
//! - Hence a sender is never more than one window ahead of the
//!   acknowledgements it has received.
//!
//! This module only manages state; all channel I/O is the caller's
//! responsibility.

use std::time::Duration;

use tokio::time::Instant;

use crate::message::SequencedMessage;
use crate::timer::RetransmitTimers;
use crate::window::WindowBuffer;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error(
        "send window cannot reset in epoch {epoch}: \
         only {acknowledged} of {span} messages acknowledged"
    )]
    NotFullyAcknowledged {
        epoch: u64,
        acknowledged: usize,
        span: usize,
    },
}

// ---------------------------------------------------------------------------
// SendWindow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SendWindow {
    buffer: WindowBuffer,
    acknowledged: Vec<bool>,
    timers: RetransmitTimers,
}

impl SendWindow {
    /// Empty window in epoch 0 with all timers disarmed.
    pub fn new(window_size: usize, sequence_space: u64, retransmit_interval: Duration) -> Self {
        Self {
            buffer: WindowBuffer::new(window_size, sequence_space),
            acknowledged: vec![false; window_size],
            timers: RetransmitTimers::new(window_size, retransmit_interval),
        }
    }

    /// The slots holding messages in flight.
    pub fn buffer(&self) -> &WindowBuffer {
        &self.buffer
    }

    /// Retransmission timers of the messages in flight.
    pub fn timers(&self) -> &RetransmitTimers {
        &self.timers
    }

    /// Exclusive ceiling of the indices sendable this epoch.
    pub fn upper_bound(&self) -> u64 {
        self.buffer.upper_bound()
    }

    /// Current epoch number.
    pub fn epoch(&self) -> u64 {
        self.buffer.epoch()
    }

    /// Whether a message with absolute `index` may be sent now.
    pub fn admits(&self, index: u64) -> bool {
        index < self.buffer.upper_bound()
    }

    /// Number of slots of the current epoch that have been acknowledged.
    pub fn acknowledged_count(&self) -> usize {
        self.acknowledged[..self.buffer.span()]
            .iter()
            .filter(|&&a| a)
            .count()
    }

    /// Whether `index` belongs to this epoch and has been acknowledged.
    pub fn is_acknowledged(&self, index: u64) -> bool {
        self.buffer.contains(index) && self.acknowledged[self.buffer.slot_of(index)]
    }

    /// `true` once every slot of the current epoch has been acknowledged.
    pub fn can_reset(&self) -> bool {
        self.acknowledged_count() == self.buffer.span()
    }

    /// Advance to the next epoch, clearing every acknowledgement flag.
    pub fn reset(&mut self) -> Result<(), WindowError> {
        if !self.can_reset() {
            return Err(WindowError::NotFullyAcknowledged {
                epoch: self.buffer.epoch(),
                acknowledged: self.acknowledged_count(),
                span: self.buffer.span(),
            });
        }
        self.buffer.reset();
        self.acknowledged.iter_mut().for_each(|a| *a = false);
        Ok(())
    }

    /// Store an admitted message and arm its retransmission timer.
    ///
    /// Returns `false`, without side effects, when the index is not
    /// admitted.  Data messages always carry a non-negative index.
    pub fn record_sent(&mut self, message: SequencedMessage, now: Instant) -> bool {
        let Some(index) = message.uid.sequence() else {
            return false;
        };
        if !self.admits(index) {
            return false;
        }
        self.buffer.put(index, message);
        self.timers.arm(index, now);
        true
    }

    /// Process an acknowledgement for absolute `index`.
    ///
    /// Sets the slot's flag and cancels the matching timer.  Repeated acks
    /// are harmless.  An index outside the current epoch is ignored so a
    /// late duplicate ack cannot mark a live slot.  Returns whether a timer
    /// was cancelled.
    pub fn on_ack(&mut self, index: u64) -> bool {
        if !self.buffer.contains(index) {
            return false;
        }
        let slot = self.buffer.slot_of(index);
        self.acknowledged[slot] = true;
        self.timers.cancel(index)
    }

    /// Earliest retransmission deadline, if any message is in flight.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Messages whose retransmission timer is due at `now`, exactly as they
    /// were first sent.  Their timers are re-armed for another interval.
    pub fn due_for_retransmit(&mut self, now: Instant) -> Vec<SequencedMessage> {
        let mut due = Vec::new();
        for index in self.timers.expire(now) {
            match self.buffer.message(index) {
                Some(message) => due.push(message.clone()),
                None => {
                    // nothing left to resend for this index
                    self.timers.cancel(index);
                }
            }
        }
        due
    }

    /// Messages sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.timers.armed()
    }

    /// Drop every stored message and cancel every timer.
    ///
    /// Returns how many timers were still armed.
    pub fn clear(&mut self) -> usize {
        let cancelled = self.timers.cancel_all();
        self.buffer = WindowBuffer::new(self.buffer.window_size(), self.buffer.sequence_space());
        self.acknowledged.iter_mut().for_each(|a| *a = false);
        cancelled
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
