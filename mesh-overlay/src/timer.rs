//! Per-message retransmission timers.
//!
//! Every message accepted into the send window gets its own recurring timer.
//! While the timer is armed the stored message is retransmitted once per
//! interval, unmodified; the timer is cancelled only by an acknowledgement for
//! that exact absolute index, or by connection teardown.
//!
//! At most `window_size` messages are in flight, so timers live in a
//! slot-indexed arena (`index % window_size`) instead of an open-ended map.
//! The arena holds deadlines only; the owning connection's event loop sleeps
//! until [`RetransmitTimers::next_deadline`] and then calls
//! [`RetransmitTimers::expire`].

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerEntry {
    /// Absolute sequence index this timer belongs to.
    index: u64,
    deadline: Instant,
}

/// Fixed-size arena of recurring retransmission timers.
#[derive(Debug, Clone)]
pub struct RetransmitTimers {
    interval: Duration,
    entries: Vec<Option<TimerEntry>>,
}

impl RetransmitTimers {
    /// Arena with one disarmed slot per window position.
    pub fn new(window_size: usize, interval: Duration) -> Self {
        Self {
            interval,
            entries: vec![None; window_size],
        }
    }

    /// Fixed period between retransmissions.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn slot_of(&self, index: u64) -> usize {
        (index % self.entries.len() as u64) as usize
    }

    /// Arm the timer for `index`; first firing is one interval after `now`.
    ///
    /// Replaces whatever timer occupied the same slot.
    pub fn arm(&mut self, index: u64, now: Instant) {
        let slot = self.slot_of(index);
        if let Some(old) = self.entries[slot] {
            if old.index != index {
                log::debug!("[timer] slot {slot}: replacing timer {} with {index}", old.index);
            }
        }
        self.entries[slot] = Some(TimerEntry {
            index,
            deadline: now + self.interval,
        });
    }

    /// Cancel the timer for exactly `index`.
    ///
    /// Returns `false` when no such timer is armed; that is not an error.
    pub fn cancel(&mut self, index: u64) -> bool {
        let slot = self.slot_of(index);
        match self.entries[slot] {
            Some(entry) if entry.index == index => {
                self.entries[slot] = None;
                true
            }
            _ => false,
        }
    }

    /// Cancel every timer.  Returns how many were armed.
    pub fn cancel_all(&mut self) -> usize {
        let armed = self.armed();
        self.entries.iter_mut().for_each(|e| *e = None);
        armed
    }

    /// Whether a timer for exactly `index` is armed.
    pub fn is_armed(&self, index: u64) -> bool {
        matches!(self.entries[self.slot_of(index)], Some(e) if e.index == index)
    }

    /// Number of armed timers.
    pub fn armed(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    /// Earliest deadline among armed timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().flatten().map(|e| e.deadline).min()
    }

    /// Collect the indices whose deadline is at or before `now` and re-arm
    /// each of them for another interval.
    ///
    /// A timer that fell several intervals behind fires once, not once per
    /// missed interval.
    pub fn expire(&mut self, now: Instant) -> Vec<u64> {
        let interval = self.interval;
        let mut due = Vec::new();
        for entry in self.entries.iter_mut().flatten() {
            if entry.deadline <= now {
                due.push(entry.index);
                entry.deadline += interval;
                if entry.deadline <= now {
                    entry.deadline = now + interval;
                }
            }
        }
        due.sort_unstable();
        due
    }
}
