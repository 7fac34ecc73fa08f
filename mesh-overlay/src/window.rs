//! Fixed-capacity sliding window over sequence indices.
//!
//! [`WindowBuffer`] is the receive-side state of a
//! [`crate::connection::ReliableConnection`] and the shared core of
//! [`crate::send_window::SendWindow`].
//!
//! # Epochs
//!
//! The window only ever holds `window_size` slots, addressed by
//! `index % window_size`.  An epoch counter says which block of absolute
//! indices those slots currently stand for:
//!
//! ```text
//!  epoch 0          epoch 1          epoch 2
//!  [0 .. W)         [W .. 2W)        [2W .. 3W)   ...   [k·W .. space)
//!  ▲ base  ▲ upper_bound                                 last epoch may be short
//! ```
//!
//! Once the final index of the sequence space has been processed the next
//! reset returns to epoch 0, matching the uid generator's wrap to index 0.
//!
//! This module only manages state; all channel I/O is the caller's
//! responsibility.

use crate::message::SequencedMessage;

// ---------------------------------------------------------------------------
// WindowBuffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WindowBuffer {
    window_size: usize,
    /// Number of distinct indices (`max_message_index + 1`).
    sequence_space: u64,
    /// Next slot to release to the application; always `< window_size`.
    expected_index: usize,
    epoch: u64,
    slots: Vec<Option<SequencedMessage>>,
}

impl WindowBuffer {
    /// Create a window in epoch 0.
    ///
    /// `window_size` must be at least 1 and no larger than `sequence_space`
    /// (see [`crate::config::ConnectionConfig::validate`]).
    pub fn new(window_size: usize, sequence_space: u64) -> Self {
        assert!(window_size >= 1, "window_size must be at least 1");
        Self {
            window_size,
            sequence_space,
            expected_index: 0,
            epoch: 0,
            slots: vec![None; window_size],
        }
    }

    /// Number of slots.
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Number of distinct indices before wrapping.
    pub fn sequence_space(&self) -> u64 {
        self.sequence_space
    }

    /// Next slot to release to the application.
    pub fn expected_index(&self) -> usize {
        self.expected_index
    }

    /// Current epoch number.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// First absolute index of the current epoch.
    pub fn base(&self) -> u64 {
        self.epoch * self.window_size as u64
    }

    /// Slots in use this epoch: `window_size`, except for a short final
    /// epoch at the end of the sequence space.
    pub fn span(&self) -> usize {
        let remaining = self.sequence_space.saturating_sub(self.base());
        remaining.min(self.window_size as u64) as usize
    }

    /// Exclusive ceiling of the absolute indices acceptable this epoch.
    pub fn upper_bound(&self) -> u64 {
        self.base() + self.span() as u64
    }

    /// Slot that holds absolute `index`.
    pub fn slot_of(&self, index: u64) -> usize {
        (index % self.window_size as u64) as usize
    }

    /// `true` when `index` belongs to the current epoch.
    pub fn contains(&self, index: u64) -> bool {
        index >= self.base() && index < self.upper_bound()
    }

    /// `true` when `index` belongs to the current epoch and has not been
    /// released yet.
    pub fn admits(&self, index: u64) -> bool {
        self.contains(index) && self.slot_of(index) >= self.expected_index
    }

    /// Buffer `message` under `index` if the window admits it.
    ///
    /// Re-buffering an index that is already held but not yet released
    /// simply overwrites the slot with the identical message.
    pub fn accept(&mut self, index: u64, message: SequencedMessage) -> bool {
        if !self.admits(index) {
            return false;
        }
        let slot = self.slot_of(index);
        self.slots[slot] = Some(message);
        true
    }

    /// Release every contiguous buffered message starting at
    /// `expected_index`, in order.
    ///
    /// Stops at the first gap.  When the final slot of the epoch is
    /// released the window resets and draining stops for this call.
    pub fn drain_in_order(&mut self) -> Vec<SequencedMessage> {
        let mut released = Vec::new();
        while self.expected_index < self.span() {
            let Some(message) = self.slots[self.expected_index].take() else {
                break;
            };
            released.push(message);
            if self.expected_index == self.span() - 1 {
                self.reset();
                break;
            }
            self.expected_index += 1;
        }
        released
    }

    /// Store `message` in the slot for `index` without any admission check.
    pub(crate) fn put(&mut self, index: u64, message: SequencedMessage) {
        let slot = self.slot_of(index);
        self.slots[slot] = Some(message);
    }

    /// The buffered message whose uid is exactly `index`.
    pub fn message(&self, index: u64) -> Option<&SequencedMessage> {
        self.slots[self.slot_of(index)]
            .as_ref()
            .filter(|m| m.uid.sequence() == Some(index))
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Advance to the next epoch, clearing `expected_index` and every slot.
    pub fn reset(&mut self) {
        self.epoch = if self.upper_bound() >= self.sequence_space {
            0
        } else {
            self.epoch + 1
        };
        self.expected_index = 0;
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
