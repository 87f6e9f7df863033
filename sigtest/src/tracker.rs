//! Receive-side accounting: per-sender sequence tracking and the
//! infinite-TTL stream check.
//!
//! [`LossTracker`] sees every decoded signal and keeps, per remote sender:
//! - how many signals arrived (`total_received`), and
//! - the sequence number of the **most recent** arrival (`last_seq`).
//!
//! Missed signals are inferred as `last_seq - total_received`.  Note that
//! `last_seq` is last-write, not max: a late arrival rewinds it, so reordering
//! can hide (or, with later arrivals, re-reveal) losses.  `out_of_order`
//! counts the arrivals that moved it backwards so the effect is visible in
//! reports.
//!
//! A single counter, shared by all senders, tracks the next expected value of
//! the infinite-TTL stream.  It is only meaningful with exactly two peers.
//!
//! All mutation happens under one lock: the read-increment-compare-write
//! sequence for a sender and the shared counter must not interleave.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::clock::Timestamp;
use crate::signal::{DecodeError, Signal};

/// Counters kept for one remote sender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderState {
    /// Signals received from this sender.
    pub total_received: u32,
    /// Sequence number carried by the latest arrival.
    pub last_seq: u32,
    /// Arrivals whose sequence number did not exceed the previous one.
    pub out_of_order: u32,
}

impl SenderState {
    /// Inferred losses, clamped at zero.
    pub fn missed(&self) -> u32 {
        self.last_seq.saturating_sub(self.total_received)
    }
}

/// The infinite-TTL stream skipped or repeated a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapDetected {
    pub expected: u32,
    pub received: u32,
}

/// What the tracker concluded about one arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sender: String,
    pub seq: u32,
    pub payload_len: usize,
    pub ttl_secs: u32,
    /// Receiver clock minus sender clock, in milliseconds.
    pub latency_ms: i64,
    /// Missed-so-far for this sender after applying the arrival.
    pub missed: u32,
    /// Set when this arrival broke the infinite-TTL sequence.
    pub gap: Option<GapDetected>,
}

/// One row of [`Summary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderSummary {
    pub sender: String,
    pub total_received: u32,
    pub last_seq: u32,
    pub missed: u32,
    pub out_of_order: u32,
}

/// Snapshot of every sender, ordered by sender id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub senders: Vec<SenderSummary>,
    /// Sum of the per-sender `missed` values.
    pub total_missed: u64,
}

#[derive(Debug)]
struct TrackerInner {
    senders: BTreeMap<String, SenderState>,
    expected_infinite_ttl: u32,
}

/// Thread-safe receive-side accounting.
#[derive(Debug)]
pub struct LossTracker {
    inner: Mutex<TrackerInner>,
}

impl Default for LossTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LossTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                senders: BTreeMap::new(),
                expected_infinite_ttl: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decode a signal body and account for it.
    ///
    /// A body that fails to decode is dropped without touching any state.
    pub fn on_wire_signal(
        &self,
        sender: &str,
        bytes: &[u8],
        now: Timestamp,
    ) -> Result<DeliveryReport, DecodeError> {
        let signal = Signal::decode(bytes)?;
        Ok(self.on_signal_received(sender, &signal, now))
    }

    /// Account for one arrival from `sender`.
    pub fn on_signal_received(&self, sender: &str, signal: &Signal, now: Timestamp) -> DeliveryReport {
        let mut inner = self.lock();

        let state = inner.senders.entry(sender.to_string()).or_default();
        if state.total_received > 0 && signal.seq <= state.last_seq {
            state.out_of_order += 1;
            log::debug!(
                "[tracker] {} went backwards: #{} after #{}",
                sender,
                signal.seq,
                state.last_seq
            );
        }
        state.total_received += 1;
        state.last_seq = signal.seq;
        let missed = state.missed();

        let mut gap = None;
        if signal.is_infinite_ttl() {
            let expected = inner.expected_infinite_ttl;
            if signal.infinite_ttl_seq != expected {
                log::warn!(
                    "[tracker] Missed infinite ttl signal. Expected {}, received {}",
                    expected,
                    signal.infinite_ttl_seq
                );
                gap = Some(GapDetected {
                    expected,
                    received: signal.infinite_ttl_seq,
                });
            }
            inner.expected_infinite_ttl = expected.wrapping_add(1);
        }
        drop(inner);

        DeliveryReport {
            sender: sender.to_string(),
            seq: signal.seq,
            payload_len: signal.payload.len(),
            ttl_secs: signal.ttl_secs,
            latency_ms: now.millis_since(signal.sent_at()),
            missed,
            gap,
        }
    }

    /// Next infinite-TTL value the tracker expects to see.
    pub fn expected_infinite_ttl(&self) -> u32 {
        self.lock().expected_infinite_ttl
    }

    /// Counters for one sender, if it has been heard from.
    pub fn sender(&self, sender: &str) -> Option<SenderState> {
        self.lock().senders.get(sender).copied()
    }

    /// Per-sender rows in lexicographic sender order plus the missed total.
    pub fn summary(&self) -> Summary {
        let inner = self.lock();
        let senders: Vec<SenderSummary> = inner
            .senders
            .iter()
            .map(|(id, s)| SenderSummary {
                sender: id.clone(),
                total_received: s.total_received,
                last_seq: s.last_seq,
                missed: s.missed(),
                out_of_order: s.out_of_order,
            })
            .collect();
        let total_missed = senders.iter().map(|s| u64::from(s.missed)).sum();
        Summary {
            senders,
            total_missed,
        }
    }
}
