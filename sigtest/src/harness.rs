//! One peer's test run, from session setup to the final summary.
//!
//! ```text
//!  TestConfig ──▶ Harness::run
//!                   ├── attach: host listens / client finds + joins
//!                   ├── DeliveryLoop::run  (sends)
//!                   │        ▲ membership events, inbound signals
//!                   │        └── TrackingReceiver ──▶ LossTracker
//!                   ├── leave
//!                   └── ReportPrinter::print_once (stdout or a chosen writer)
//! ```
//!
//! Every way out of [`Harness::run`] goes through the same teardown, so the
//! summary is printed exactly once whether the run finished, was
//! interrupted, lost its session, or never got a session at all.

use std::io::Write;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, Role, TestConfig};
use crate::delivery::{DeliveryLoop, LoopConfig, LoopOutcome};
use crate::generator::SignalGenerator;
use crate::listener::{AcceptAll, DiscoveryLog, Listeners, MembershipListener, SignalHandler};
use crate::membership::SessionMembership;
use crate::report::ReportPrinter;
use crate::tracker::{LossTracker, Summary};
use crate::transport::host::SessionHost;
use crate::transport::local::LocalBus;
use crate::transport::peer::{SessionPeer, DISCOVERY_TIMEOUT};
use crate::transport::{SignalTransport, TransportError};

/// Retry interval for finding a host on the in-process bus.
const LOCAL_FIND_INTERVAL: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// TrackingReceiver
// ---------------------------------------------------------------------------

/// Feeds inbound signal bodies into a [`LossTracker`] and logs the trace.
pub struct TrackingReceiver {
    tracker: Arc<LossTracker>,
    clock: Arc<dyn Clock>,
    me: OnceLock<String>,
}

impl TrackingReceiver {
    pub fn new(tracker: Arc<LossTracker>, clock: Arc<dyn Clock>) -> Self {
        Self {
            tracker,
            clock,
            me: OnceLock::new(),
        }
    }

    /// Name shown as `me:` in the receive trace.  First call wins.
    pub fn set_name(&self, name: String) {
        let _ = self.me.set(name);
    }
}

impl SignalHandler for TrackingReceiver {
    fn on_signal(&self, sender: &str, body: &[u8]) {
        match self.tracker.on_wire_signal(sender, body, self.clock.now()) {
            Ok(r) => log::info!(
                "[{}] RxSignal: me: {}, ttl={}, length={} from: {} - {} {:x} in {} ms",
                self.clock.uptime_ms(),
                self.me.get().map(String::as_str).unwrap_or("?"),
                r.ttl_secs,
                r.payload_len,
                r.sender,
                r.seq,
                r.seq,
                r.latency_ms
            ),
            Err(e) => log::warn!("[tracker] dropping malformed signal from {sender}: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

enum Attachment {
    Network,
    Local(LocalBus),
}

/// Everything one peer needs for a run.
pub struct Harness {
    config: TestConfig,
    attachment: Attachment,
    interrupt: CancellationToken,
    clock: Arc<dyn Clock>,
    tracker: Arc<LossTracker>,
    membership: Arc<SessionMembership>,
    printer: ReportPrinter,
}

impl Harness {
    /// Peer that reaches the session over the network.
    pub fn new(config: TestConfig) -> Result<Self, ConfigError> {
        Self::build(config, Attachment::Network)
    }

    /// Peer that reaches the session through an in-process bus.
    pub fn with_local_bus(config: TestConfig, bus: LocalBus) -> Result<Self, ConfigError> {
        Self::build(config, Attachment::Local(bus))
    }

    fn build(config: TestConfig, attachment: Attachment) -> Result<Self, ConfigError> {
        config.validate()?;
        let membership = SessionMembership::new(
            config.participants,
            config.randomize_payload,
            config.interleave_ttl,
        )?;
        Ok(Self {
            config,
            attachment,
            interrupt: CancellationToken::new(),
            clock: Arc::new(SystemClock::new()),
            tracker: Arc::new(LossTracker::new()),
            membership: Arc::new(membership),
            printer: ReportPrinter::new(),
        })
    }

    /// Cancelling this token aborts the run.
    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    pub fn tracker(&self) -> &Arc<LossTracker> {
        &self.tracker
    }

    pub fn summary(&self) -> Summary {
        self.tracker.summary()
    }

    pub fn membership(&self) -> &Arc<SessionMembership> {
        &self.membership
    }

    /// Send the final summary to `out` instead of stdout.
    pub fn with_report_writer(mut self, out: impl Write + Send + 'static) -> Self {
        self.printer = ReportPrinter::to_writer(out);
        self
    }

    /// Print the summary unless some other path already has.
    ///
    /// Returns `true` for the call that printed.
    pub fn print_summary(&self) -> bool {
        self.printer.print_once(&self.tracker)
    }

    pub fn summary_printed(&self) -> bool {
        self.printer.has_printed()
    }

    /// Run the test once and print the summary.
    pub async fn run(&self) -> Result<LoopOutcome, TransportError> {
        let receiver = Arc::new(TrackingReceiver::new(
            self.tracker.clone(),
            self.clock.clone(),
        ));
        let listeners = Listeners {
            discovery: Arc::new(DiscoveryLog),
            accept: Arc::new(AcceptAll),
            membership: Arc::new(MembershipListener::new(self.membership.clone())),
            signals: receiver.clone(),
        };

        let transport = match self.attach(listeners).await {
            Ok(t) => t,
            Err(e) => {
                log::error!("session setup failed: {e}");
                self.print_summary();
                return Err(e);
            }
        };
        receiver.set_name(transport.unique_name());

        let generator = SignalGenerator::new(self.config.generator_config(), self.clock.clone());
        let mut delivery = DeliveryLoop::new(
            LoopConfig::from_test_config(&self.config),
            generator,
            transport.clone(),
            self.membership.clone(),
            self.interrupt.clone(),
        );
        let outcome = delivery.run().await;

        transport.leave().await;
        self.print_summary();
        Ok(outcome)
    }

    async fn attach(&self, listeners: Listeners) -> Result<Arc<dyn SignalTransport>, TransportError> {
        let c = &self.config;
        log::info!(
            "[harness] {} for {} participants ({} over {})",
            c.role,
            c.participants,
            c.bus_address,
            c.transport
        );
        match (&self.attachment, c.role) {
            (Attachment::Network, Role::Host) => {
                let host =
                    SessionHost::listen(c.transport, c.bus_address, &c.well_known_name, listeners)
                        .await?;
                self.membership.set_session_id(host.session_id());
                Ok(Arc::new(host))
            }
            (Attachment::Network, Role::Client) => {
                let peer =
                    SessionPeer::join(c.transport, c.bus_address, &c.prefix, listeners, &self.interrupt)
                        .await?;
                self.membership.set_session_id(peer.session_id());
                Ok(Arc::new(peer))
            }
            (Attachment::Local(bus), Role::Host) => {
                let peer = bus.attach(listeners);
                let id = peer.advertise(&c.well_known_name)?;
                self.membership.set_session_id(id);
                Ok(Arc::new(peer))
            }
            (Attachment::Local(bus), Role::Client) => {
                let peer = bus.attach(listeners);
                let deadline = Instant::now() + DISCOVERY_TIMEOUT;
                let id = loop {
                    match peer.find_and_join(&c.prefix) {
                        Ok(id) => break id,
                        Err(TransportError::NotFound { .. }) if Instant::now() < deadline => {
                            tokio::select! {
                                _ = self.interrupt.cancelled() => return Err(TransportError::Interrupted),
                                _ = sleep(LOCAL_FIND_INTERVAL) => {}
                            }
                        }
                        Err(e) => return Err(e),
                    }
                };
                self.membership.set_session_id(id);
                Ok(Arc::new(peer))
            }
        }
    }
}
