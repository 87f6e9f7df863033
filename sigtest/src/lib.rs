//! `sigtest`: a signal-delivery test harness.
//!
//! Peers join one session, then each sends sequence-numbered, timestamped,
//! TTL-tagged signals for a fixed time while counting what arrives from
//! everyone else.  At the end each peer prints how many signals it got per
//! sender and how many it missed.
//!
//! # Architecture
//!
//! ```text
//!                 ┌───────────────┐
//!                 │  DeliveryLoop │◀── interrupt token
//!                 └──┬─────────▲──┘
//!     next_signal()  │         │ is_ready() / lost()
//!  ┌─────────────────▼┐   ┌────┴──────────────┐
//!  │ SignalGenerator  │   │ SessionMembership │◀── membership events
//!  └─────────────────┬┘   └───────────────────┘          │
//!          encode()  │                                   │
//!  ┌─────────────────▼───────────────────────────────────┴──┐
//!  │  SignalTransport  (local bus │ tcp/udp host │ client)  │
//!  └─────────────────────────────┬──────────────────────────┘
//!                                │ inbound bodies
//!                     decode ┌───▼─────────┐  summary  ┌──────────────┐
//!                            │ LossTracker │──────────▶│ ReportPrinter│
//!                            └─────────────┘           └──────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`clock`]: wall-clock samples and uptime
//! - [`signal`]: the signal and its byte encoding
//! - [`generator`]: next outgoing signal (payload and TTL policy)
//! - [`tracker`]: per-sender loss accounting and the infinite-TTL check
//! - [`membership`]: participant count, readiness, session loss
//! - [`listener`]: discovery, admission, membership and signal callbacks
//! - [`delivery`]: the wait-then-send loop
//! - [`report`]: the once-only final summary
//! - [`config`]: validated run configuration
//! - [`wire`]: host/client frame codec
//! - [`transport`]: session transports (in-process, TCP, UDP)
//! - [`harness`]: one peer's run from setup to summary

pub mod clock;
pub mod config;
pub mod delivery;
pub mod generator;
pub mod harness;
pub mod listener;
pub mod membership;
pub mod report;
pub mod signal;
pub mod tracker;
pub mod transport;
pub mod wire;
