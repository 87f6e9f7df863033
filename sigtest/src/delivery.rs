//! The send loop.
//!
//! ```text
//!  WaitingForMembers ──ready──▶ Running ──deadline──▶ Finished
//!         │                        │
//!         └──interrupt / lost──────┴──────────────────▶ Aborted
//! ```
//!
//! While waiting, readiness is polled every [`MEMBER_POLL_INTERVAL`]; the
//! interrupt token and session loss wake the loop immediately.  While
//! running, the deadline is soft: it is checked once per iteration, so one
//! in-flight send may overrun it.  Send failures are logged and counted,
//! never fatal.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{Role, TestConfig};
use crate::generator::SignalGenerator;
use crate::membership::SessionMembership;
use crate::transport::{flags, SendError, SignalTransport};

/// How often readiness is re-checked while waiting for members.
pub const MEMBER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pause between readiness and the host's first send, so the last joiner
/// has its signal handler in place.
pub const HOST_SETTLE_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    WaitingForMembers,
    Running,
    Finished,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The interrupt token fired.
    Interrupted,
    /// The session went away.
    SessionLost,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Interrupted => write!(f, "interrupted"),
            AbortReason::SessionLost => write!(f, "session lost"),
        }
    }
}

/// Loop timing and send flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    /// Pause between sends; zero yields instead of sleeping.
    pub signal_delay: Duration,
    /// Soft deadline measured from entering `Running`.
    pub run_duration: Duration,
    /// Passed unchanged to every `send_signal`.
    pub flags: u8,
    /// Pause between readiness and the first send.
    pub settle_delay: Duration,
}

impl LoopConfig {
    pub fn from_test_config(config: &TestConfig) -> Self {
        Self {
            signal_delay: config.signal_delay,
            run_duration: config.run_duration,
            flags: if config.compress { flags::COMPRESSED } else { 0 },
            settle_delay: match config.role {
                Role::Host => HOST_SETTLE_DELAY,
                Role::Client => Duration::ZERO,
            },
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOutcome {
    /// `Finished` or `Aborted`.
    pub state: LoopState,
    pub abort_reason: Option<AbortReason>,
    /// Signals handed to the transport successfully.
    pub sent: u64,
    pub send_failures: u64,
}

impl LoopOutcome {
    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self.state {
            LoopState::Finished => 0,
            _ => 2,
        }
    }
}

/// Drives one peer's side of a test.
pub struct DeliveryLoop {
    config: LoopConfig,
    generator: SignalGenerator,
    transport: Arc<dyn SignalTransport>,
    membership: Arc<SessionMembership>,
    interrupt: CancellationToken,
    state: LoopState,
    sent: u64,
    send_failures: u64,
}

impl DeliveryLoop {
    pub fn new(
        config: LoopConfig,
        generator: SignalGenerator,
        transport: Arc<dyn SignalTransport>,
        membership: Arc<SessionMembership>,
        interrupt: CancellationToken,
    ) -> Self {
        Self {
            config,
            generator,
            transport,
            membership,
            interrupt,
            state: LoopState::WaitingForMembers,
            sent: 0,
            send_failures: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run to a terminal state.
    pub async fn run(&mut self) -> LoopOutcome {
        let reason = match self.wait_for_members().await {
            Err(reason) => Some(reason),
            Ok(()) => self.send_until_deadline().await.err(),
        };
        self.state = match reason {
            Some(reason) => {
                log::warn!("[loop] aborted: {reason}");
                LoopState::Aborted
            }
            None => LoopState::Finished,
        };
        LoopOutcome {
            state: self.state,
            abort_reason: reason,
            sent: self.sent,
            send_failures: self.send_failures,
        }
    }

    fn abort_reason(&self) -> Option<AbortReason> {
        if self.interrupt.is_cancelled() {
            Some(AbortReason::Interrupted)
        } else if self.membership.is_aborted() {
            Some(AbortReason::SessionLost)
        } else {
            None
        }
    }

    /// Sleep for `duration` unless an abort arrives first.
    async fn pause(&self, duration: Duration) -> Result<(), AbortReason> {
        tokio::select! {
            _ = self.interrupt.cancelled() => Err(AbortReason::Interrupted),
            _ = self.membership.lost() => Err(AbortReason::SessionLost),
            _ = sleep(duration) => Ok(()),
        }
    }

    async fn wait_for_members(&mut self) -> Result<(), AbortReason> {
        self.state = LoopState::WaitingForMembers;
        loop {
            if let Some(reason) = self.abort_reason() {
                return Err(reason);
            }
            if self.membership.is_ready() {
                break;
            }
            log::debug!(
                "[loop] waiting for members: {}/{}",
                self.membership.member_count() + 1,
                self.membership.target()
            );
            self.pause(MEMBER_POLL_INTERVAL).await?;
        }

        log::info!(
            "[loop] {} participants present, starting",
            self.membership.target()
        );
        if !self.config.settle_delay.is_zero() {
            self.pause(self.config.settle_delay).await?;
        }
        Ok(())
    }

    async fn send_until_deadline(&mut self) -> Result<(), AbortReason> {
        self.state = LoopState::Running;
        let started = Instant::now();
        loop {
            if let Some(reason) = self.abort_reason() {
                return Err(reason);
            }
            let elapsed = started.elapsed();
            if elapsed >= self.config.run_duration {
                log::info!(
                    "Time {} exceeds {} specified. program exits",
                    elapsed.as_millis(),
                    self.config.run_duration.as_millis()
                );
                return Ok(());
            }

            self.send_one().await;

            if self.config.signal_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                self.pause(self.config.signal_delay).await?;
            }
        }
    }

    async fn send_one(&mut self) {
        let signal = self.generator.next_signal();
        let seq = signal.seq;
        log::info!("SendSignal #: {seq} {seq:x}");
        log::debug!(
            "[loop] #{seq} at {}.{:03} len={} ttl={} inf={}",
            signal.send_seconds,
            signal.send_millis,
            signal.payload.len(),
            signal.ttl_secs,
            signal.infinite_ttl_seq
        );

        let result = match self.membership.session_id() {
            None => Err(SendError::NotJoined),
            Some(session) => {
                self.transport
                    .send_signal(session, signal.encode(), signal.ttl_secs, self.config.flags)
                    .await
            }
        };
        match result {
            Ok(()) => self.sent += 1,
            Err(e) => {
                self.send_failures += 1;
                log::error!("[loop] SendSignal #{seq} failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::clock::{ManualClock, Timestamp};
    use crate::generator::GeneratorConfig;
    use crate::signal::Signal;
    use crate::transport::SessionId;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(SessionId, Signal, u32, u8)>>,
        fail: bool,
    }

    #[async_trait]
    impl SignalTransport for RecordingTransport {
        async fn send_signal(
            &self,
            session: SessionId,
            body: Vec<u8>,
            ttl_secs: u32,
            flags: u8,
        ) -> Result<(), SendError> {
            if self.fail {
                return Err(SendError::LinkClosed);
            }
            let signal = Signal::decode(&body).unwrap();
            self.sent.lock().unwrap().push((session, signal, ttl_secs, flags));
            Ok(())
        }

        fn unique_name(&self) -> String {
            ":test.1".into()
        }

        async fn leave(&self) {}
    }

    fn ready_membership() -> Arc<SessionMembership> {
        let m = Arc::new(SessionMembership::new(2, false, false).unwrap());
        m.set_session_id(42);
        m.on_member_joined();
        m
    }

    fn generator() -> SignalGenerator {
        let clock = Arc::new(ManualClock::new(Timestamp::new(1_000, 0)));
        SignalGenerator::seeded(GeneratorConfig::default(), clock, 7)
    }

    fn config(delay_ms: u64, run_ms: u64) -> LoopConfig {
        LoopConfig {
            signal_delay: Duration::from_millis(delay_ms),
            run_duration: Duration::from_millis(run_ms),
            flags: 0,
            settle_delay: Duration::ZERO,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sends_consecutive_sequence_numbers_until_deadline() {
        let transport = Arc::new(RecordingTransport::default());
        let mut dl = DeliveryLoop::new(
            LoopConfig {
                flags: flags::COMPRESSED,
                ..config(10, 100)
            },
            generator(),
            transport.clone(),
            ready_membership(),
            CancellationToken::new(),
        );

        let outcome = dl.run().await;
        assert_eq!(outcome.state, LoopState::Finished);
        assert_eq!(outcome.abort_reason, None);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(dl.state(), LoopState::Finished);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 10);
        assert_eq!(outcome.sent, 10);
        for (i, (session, signal, ttl, sent_flags)) in sent.iter().enumerate() {
            assert_eq!(*session, 42);
            assert_eq!(signal.seq, i as u32 + 1);
            assert_eq!(*ttl, 30);
            assert_eq!(*sent_flags, flags::COMPRESSED);
        }
    }

    #[tokio::test]
    async fn back_to_back_sends_stop_at_deadline() {
        let transport = Arc::new(RecordingTransport::default());
        let mut dl = DeliveryLoop::new(
            config(0, 50),
            generator(),
            transport.clone(),
            ready_membership(),
            CancellationToken::new(),
        );
        let outcome = dl.run().await;
        assert_eq!(outcome.state, LoopState::Finished);
        assert!(outcome.sent > 0);
        assert_eq!(outcome.sent as usize, transport.sent.lock().unwrap().len());
    }

    #[tokio::test(start_paused = true)]
    async fn send_failures_do_not_stop_the_loop() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let mut dl = DeliveryLoop::new(
            config(10, 50),
            generator(),
            transport,
            ready_membership(),
            CancellationToken::new(),
        );
        let outcome = dl.run().await;
        assert_eq!(outcome.state, LoopState::Finished);
        assert_eq!(outcome.sent, 0);
        assert_eq!(outcome.send_failures, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn unjoined_session_counts_as_send_failure() {
        let membership = Arc::new(SessionMembership::new(1, false, false).unwrap());
        let mut dl = DeliveryLoop::new(
            config(10, 30),
            generator(),
            Arc::new(RecordingTransport::default()),
            membership,
            CancellationToken::new(),
        );
        let outcome = dl.run().await;
        assert_eq!(outcome.state, LoopState::Finished);
        assert_eq!(outcome.send_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_while_waiting_aborts_promptly() {
        let membership = Arc::new(SessionMembership::new(3, false, false).unwrap());
        let interrupt = CancellationToken::new();
        let transport = Arc::new(RecordingTransport::default());
        let mut dl = DeliveryLoop::new(
            config(0, 60_000),
            generator(),
            transport.clone(),
            membership,
            interrupt.clone(),
        );

        let trigger = interrupt.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(2_500)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = dl.run().await;
        assert_eq!(outcome.state, LoopState::Aborted);
        assert_eq!(outcome.abort_reason, Some(AbortReason::Interrupted));
        assert_eq!(outcome.exit_code(), 2);
        assert!(started.elapsed() < Duration::from_millis(2_600));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_loop_starts_once_members_arrive() {
        let membership = Arc::new(SessionMembership::new(2, false, false).unwrap());
        membership.set_session_id(5);
        let transport = Arc::new(RecordingTransport::default());
        let mut dl = DeliveryLoop::new(
            config(10, 20),
            generator(),
            transport.clone(),
            membership.clone(),
            CancellationToken::new(),
        );

        tokio::spawn(async move {
            sleep(Duration::from_millis(1_500)).await;
            membership.on_member_joined();
        });

        let outcome = dl.run().await;
        assert_eq!(outcome.state, LoopState::Finished);
        assert_eq!(outcome.sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn session_loss_mid_run_aborts() {
        let membership = ready_membership();
        let transport = Arc::new(RecordingTransport::default());
        let mut dl = DeliveryLoop::new(
            config(10, 60_000),
            generator(),
            transport.clone(),
            membership.clone(),
            CancellationToken::new(),
        );

        tokio::spawn(async move {
            sleep(Duration::from_millis(55)).await;
            membership.on_session_lost();
        });

        let outcome = dl.run().await;
        assert_eq!(outcome.state, LoopState::Aborted);
        assert_eq!(outcome.abort_reason, Some(AbortReason::SessionLost));
        assert_eq!(outcome.sent, 6);
    }

    #[test]
    fn host_role_gets_settle_delay_and_compress_flag() {
        let host = TestConfig {
            role: Role::Host,
            compress: true,
            participants: 2,
            ..TestConfig::default()
        };
        let c = LoopConfig::from_test_config(&host);
        assert_eq!(c.settle_delay, HOST_SETTLE_DELAY);
        assert_eq!(c.flags, flags::COMPRESSED);

        let client = LoopConfig::from_test_config(&TestConfig::default());
        assert_eq!(c.run_duration, client.run_duration);
        assert_eq!(client.settle_delay, Duration::ZERO);
        assert_eq!(client.flags, 0);
    }
}
