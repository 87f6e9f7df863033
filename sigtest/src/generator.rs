//! Outbound signal production.
//!
//! [`SignalGenerator`] owns the sender-side counters and decides the payload
//! length and TTL of every signal.  It does **not** touch the transport; the
//! delivery loop pulls signals from it and hands them on.
//!
//! # Numbering contract
//! - `seq` starts at 1 and grows by one per signal.  Values are never reused;
//!   wrapping past `u32::MAX` is accepted.
//! - Every signal embeds the current infinite-TTL counter.  The counter only
//!   advances after a signal with TTL 0 has been produced, so the infinite-TTL
//!   stream carries 1, 2, 3, ... regardless of how many finite-TTL signals are
//!   interleaved between them.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::Clock;
use crate::signal::{Signal, INFINITE_TTL, MIN_PAYLOAD};

/// Payload and TTL policy for generated signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Fixed payload length, or the exclusive upper bound when randomized.
    pub payload_size: usize,
    /// Draw each payload length uniformly from `[MIN_PAYLOAD, payload_size)`.
    pub randomize_payload: bool,
    /// Flip a fair coin per signal between infinite and `ttl_secs`.
    pub interleave_ttl: bool,
    /// TTL used for finite-TTL signals.
    pub ttl_secs: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            payload_size: MIN_PAYLOAD,
            randomize_payload: false,
            interleave_ttl: false,
            ttl_secs: 30,
        }
    }
}

/// Sender-side counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationState {
    /// Sequence number the next signal will carry.
    pub next_seq: u32,
    /// Infinite-TTL counter the next signal will carry.
    pub next_infinite_ttl_seq: u32,
}

impl Default for GenerationState {
    fn default() -> Self {
        Self {
            next_seq: 1,
            next_infinite_ttl_seq: 1,
        }
    }
}

/// Produces the next outgoing [`Signal`].
pub struct SignalGenerator<R = StdRng> {
    config: GeneratorConfig,
    state: GenerationState,
    clock: Arc<dyn Clock>,
    rng: R,
}

impl SignalGenerator<StdRng> {
    /// Generator seeded from OS entropy.
    pub fn new(config: GeneratorConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_rng(config, clock, StdRng::from_entropy())
    }

    /// Generator with a fixed seed, for reproducible runs.
    pub fn seeded(config: GeneratorConfig, clock: Arc<dyn Clock>, seed: u64) -> Self {
        Self::with_rng(config, clock, StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> SignalGenerator<R> {
    pub fn with_rng(config: GeneratorConfig, clock: Arc<dyn Clock>, rng: R) -> Self {
        Self {
            config,
            state: GenerationState::default(),
            clock,
            rng,
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    /// Build the next signal and advance the counters.
    pub fn next_signal(&mut self) -> Signal {
        let now = self.clock.now();
        let payload_len = self.draw_payload_len();
        let ttl_secs = self.draw_ttl();

        let signal = Signal {
            seq: self.state.next_seq,
            send_seconds: now.seconds,
            send_millis: now.millis,
            payload: vec![0u8; payload_len],
            ttl_secs,
            infinite_ttl_seq: self.state.next_infinite_ttl_seq,
        };

        self.state.next_seq = self.state.next_seq.wrapping_add(1);
        if ttl_secs == INFINITE_TTL {
            self.state.next_infinite_ttl_seq = self.state.next_infinite_ttl_seq.wrapping_add(1);
        }
        signal
    }

    fn draw_payload_len(&mut self) -> usize {
        // An empty range (ceiling at the minimum) degrades to the fixed size.
        if self.config.randomize_payload && self.config.payload_size > MIN_PAYLOAD {
            self.rng.gen_range(MIN_PAYLOAD..self.config.payload_size)
        } else {
            self.config.payload_size
        }
    }

    fn draw_ttl(&mut self) -> u32 {
        if self.config.interleave_ttl && self.rng.gen_bool(0.5) {
            INFINITE_TTL
        } else {
            self.config.ttl_secs
        }
    }
}
