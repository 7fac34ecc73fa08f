//! Fault-injecting channel for deterministic testing.
//!
//! Real networks drop, reorder, and duplicate messages.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! [`LossyChannel`] wraps any [`Channel`] and applies a configurable fault
//! model to every send:
//!
//! | Fault       | Description                                             |
//! |-------------|---------------------------------------------------------|
//! | Loss        | Drop a message with probability `loss_rate`.            |
//! | Reordering  | Hold a message back until the next send overtakes it.   |
//! | Duplication | Deliver a message twice.                                |
//!
//! Faults are drawn from a seeded RNG, so a failing run can be replayed.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::channel::{Channel, ChannelError};
use crate::message::SequencedMessage;

/// Configuration for the fault model.
///
/// Probabilities are clamped into `[0.0, 1.0]` by [`LossyChannel::new`].
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that a message is silently dropped.
    pub loss_rate: f64,
    /// Probability that a message is delivered twice.
    pub duplicate_rate: f64,
    /// Probability that a message is held back behind the next one.
    pub reorder_rate: f64,
    /// Seed for the fault RNG; the same seed replays the same faults.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: a transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            seed: 0,
        }
    }
}

impl SimulatorConfig {
    fn clamped(mut self) -> Self {
        self.loss_rate = self.loss_rate.clamp(0.0, 1.0);
        self.duplicate_rate = self.duplicate_rate.clamp(0.0, 1.0);
        self.reorder_rate = self.reorder_rate.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug)]
struct FaultState {
    rng: StdRng,
    held: Option<SequencedMessage>,
}

/// Counters for what the fault model did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    /// Messages dropped.
    pub dropped: u64,
    /// Messages delivered twice.
    pub duplicated: u64,
    /// Messages held back and delivered late.
    pub reordered: u64,
}

/// A fault-injecting wrapper around another channel.
#[derive(Debug)]
pub struct LossyChannel<C> {
    inner: C,
    config: SimulatorConfig,
    state: Mutex<FaultState>,
    stats: Mutex<FaultStats>,
}

impl<C: Channel> LossyChannel<C> {
    /// Wrap `inner`, clamping every rate into `[0.0, 1.0]`.
    pub fn new(inner: C, config: SimulatorConfig) -> Self {
        let config = config.clamped();
        Self {
            state: Mutex::new(FaultState {
                rng: StdRng::seed_from_u64(config.seed),
                held: None,
            }),
            stats: Mutex::new(FaultStats::default()),
            inner,
            config,
        }
    }

    /// The clamped fault configuration.
    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Snapshot of the fault counters.
    pub fn stats(&self) -> FaultStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver a held-back message, if any.
    pub fn flush(&self) -> Result<(), ChannelError> {
        let held = self.lock_state().held.take();
        match held {
            Some(message) => self.inner.send(&message),
            None => Ok(()),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn count(&self, f: impl FnOnce(&mut FaultStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

impl<C: Channel> Channel for LossyChannel<C> {
    fn send(&self, message: &SequencedMessage) -> Result<(), ChannelError> {
        let mut state = self.lock_state();

        if state.rng.random_bool(self.config.loss_rate) {
            log::trace!("[sim] drop index={}", message.uid.index);
            self.count(|s| s.dropped += 1);
            return Ok(());
        }

        if state.held.is_none() && state.rng.random_bool(self.config.reorder_rate) {
            log::trace!("[sim] hold index={}", message.uid.index);
            self.count(|s| s.reordered += 1);
            state.held = Some(message.clone());
            return Ok(());
        }

        self.inner.send(message)?;
        if state.rng.random_bool(self.config.duplicate_rate) {
            log::trace!("[sim] duplicate index={}", message.uid.index);
            self.count(|s| s.duplicated += 1);
            self.inner.send(message)?;
        }

        // the held message arrives after the one that overtook it
        if let Some(held) = state.held.take() {
            self.inner.send(&held)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
