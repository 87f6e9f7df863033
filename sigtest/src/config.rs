//! Validated test configuration.
//!
//! `main.rs` turns command-line flags into a [`TestConfig`]; everything
//! below the binary only ever sees a config that passed [`TestConfig::validate`].

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::generator::GeneratorConfig;
use crate::signal::{MAX_PAYLOAD, MIN_PAYLOAD};

/// Default session host address when none is given.
pub const DEFAULT_BUS_ADDRESS: &str = "127.0.0.1:9545";

/// Invalid or contradictory test configuration.  Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("In the random payload mode, you cannot have more than 2 participants (got {0}).")]
    RandomPayloadParticipants(u32),
    #[error("In the interleaved mode, you cannot have more than 2 participants (got {0}).")]
    InterleavedTtlParticipants(u32),
    #[error("Payload cannot be less than {min} or greater than {max}: {0}", min = MIN_PAYLOAD, max = MAX_PAYLOAD)]
    PayloadOutOfRange(usize),
    #[error("Total participants not set")]
    ParticipantsNotSet,
}

/// Which side of session setup this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Binds the session, advertises the well-known name, relays signals.
    Host,
    /// Discovers the host by prefix and joins its session.
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Network link carrying session frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// Length-prefixed frames over a stream.
    #[default]
    Tcp,
    /// One frame per datagram.
    Udp,
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "udp" => Ok(TransportKind::Udp),
            _ => Err(format!("Unknown transport: {s} (expected tcp or udp)")),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
        }
    }
}

/// Everything one peer needs to run a test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestConfig {
    /// Pause between consecutive sends; zero sends back-to-back.
    pub signal_delay: Duration,
    /// TTL for finite-TTL signals, in seconds.
    pub ttl_secs: u32,
    /// Payload size, or the ceiling when randomized.
    pub payload_size: usize,
    /// Name the host advertises.
    pub well_known_name: String,
    /// Prefix clients discover.
    pub prefix: String,
    pub randomize_payload: bool,
    pub interleave_ttl: bool,
    /// How long the send loop runs once the session is complete.
    pub run_duration: Duration,
    /// Session size to wait for, including this peer.
    pub participants: u32,
    pub role: Role,
    pub transport: TransportKind,
    /// Where the host listens / where clients connect.
    pub bus_address: SocketAddr,
    /// Extra timing detail in the signal trace.
    pub debug: bool,
    /// Mark outgoing signals as compressed.
    pub compress: bool,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            signal_delay: Duration::ZERO,
            ttl_secs: 30,
            payload_size: MIN_PAYLOAD,
            well_known_name: "org.alljoyn.signaltest".to_string(),
            prefix: "sigtest".to_string(),
            randomize_payload: false,
            interleave_ttl: false,
            run_duration: Duration::from_secs(60),
            participants: 0,
            role: Role::Client,
            transport: TransportKind::Tcp,
            bus_address: SocketAddr::from(([127, 0, 0, 1], 9545)),
            debug: false,
            compress: false,
        }
    }
}

impl TestConfig {
    /// Check every cross-field constraint, first failure wins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.randomize_payload && self.participants > 2 {
            return Err(ConfigError::RandomPayloadParticipants(self.participants));
        }
        if self.interleave_ttl && self.participants > 2 {
            return Err(ConfigError::InterleavedTtlParticipants(self.participants));
        }
        if !(MIN_PAYLOAD..=MAX_PAYLOAD).contains(&self.payload_size) {
            return Err(ConfigError::PayloadOutOfRange(self.payload_size));
        }
        if self.participants == 0 {
            return Err(ConfigError::ParticipantsNotSet);
        }
        Ok(())
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            payload_size: self.payload_size,
            randomize_payload: self.randomize_payload,
            interleave_ttl: self.interleave_ttl,
            ttl_secs: self.ttl_secs,
        }
    }
}
