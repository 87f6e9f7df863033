//! Session membership: how many peers have joined, and whether the session
//! is still alive.
//!
//! The count excludes this peer, so a session of `target` participants is
//! ready once `members + 1 == target`.  Losing the session is terminal:
//! [`SessionMembership::lost`] resolves and stays resolved.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio_util::sync::CancellationToken;

use crate::config::ConfigError;
use crate::transport::SessionId;

/// Shared membership state for one test run.
#[derive(Debug)]
pub struct SessionMembership {
    target: u32,
    members: AtomicU32,
    /// Zero until a session has been joined.
    session_id: AtomicU32,
    lost: CancellationToken,
}

impl SessionMembership {
    /// Build membership tracking for a session of `target` participants.
    ///
    /// Random payloads and interleaved TTLs are only defined for a
    /// two-peer session.
    pub fn new(
        target: u32,
        randomize_payload: bool,
        interleave_ttl: bool,
    ) -> Result<Self, ConfigError> {
        if target == 0 {
            return Err(ConfigError::ParticipantsNotSet);
        }
        if randomize_payload && target > 2 {
            return Err(ConfigError::RandomPayloadParticipants(target));
        }
        if interleave_ttl && target > 2 {
            return Err(ConfigError::InterleavedTtlParticipants(target));
        }
        Ok(Self {
            target,
            members: AtomicU32::new(0),
            session_id: AtomicU32::new(0),
            lost: CancellationToken::new(),
        })
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Peers other than this one observed joining.
    pub fn member_count(&self) -> u32 {
        self.members.load(Ordering::SeqCst)
    }

    /// Record a peer joining; returns the new count.
    pub fn on_member_joined(&self) -> u32 {
        let count = self.members.fetch_add(1, Ordering::SeqCst) + 1;
        if count + 1 > self.target {
            log::warn!(
                "[membership] {} peers in session, more than the {} expected",
                count + 1,
                self.target
            );
        }
        count
    }

    /// `true` exactly when the session holds `target` participants.
    pub fn is_ready(&self) -> bool {
        self.member_count().checked_add(1) == Some(self.target)
    }

    /// Mark the session as gone.  Idempotent.
    pub fn on_session_lost(&self) {
        self.lost.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Resolves once the session has been lost.
    pub async fn lost(&self) {
        self.lost.cancelled().await
    }

    pub fn set_session_id(&self, id: SessionId) {
        self.session_id.store(id, Ordering::SeqCst);
    }

    pub fn session_id(&self) -> Option<SessionId> {
        match self.session_id.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn readiness_flips_exactly_at_target() {
        for target in 2..=6 {
            let m = SessionMembership::new(target, false, false).unwrap();
            for joined in 0..target - 1 {
                assert_eq!(m.member_count(), joined);
                assert!(!m.is_ready(), "target {target}, {joined} joined");
                m.on_member_joined();
            }
            assert!(m.is_ready(), "target {target} never became ready");
        }
    }

    #[test]
    fn single_participant_is_ready_immediately() {
        let m = SessionMembership::new(1, false, false).unwrap();
        assert!(m.is_ready());
    }

    #[test]
    fn overshooting_target_is_not_ready() {
        let m = SessionMembership::new(2, false, false).unwrap();
        m.on_member_joined();
        m.on_member_joined();
        assert!(!m.is_ready());
    }

    #[test]
    fn zero_target_rejected() {
        assert_eq!(
            SessionMembership::new(0, false, false).unwrap_err(),
            ConfigError::ParticipantsNotSet
        );
    }

    #[test]
    fn two_peer_modes_rejected_for_larger_sessions() {
        assert_eq!(
            SessionMembership::new(3, true, false).unwrap_err(),
            ConfigError::RandomPayloadParticipants(3)
        );
        assert_eq!(
            SessionMembership::new(3, false, true).unwrap_err(),
            ConfigError::InterleavedTtlParticipants(3)
        );
        assert!(SessionMembership::new(2, true, true).is_ok());
    }

    #[test]
    fn session_id_unset_until_joined() {
        let m = SessionMembership::new(2, false, false).unwrap();
        assert_eq!(m.session_id(), None);
        m.set_session_id(77);
        assert_eq!(m.session_id(), Some(77));
    }

    #[tokio::test]
    async fn session_lost_is_terminal_and_wakes_waiters() {
        let m = std::sync::Arc::new(SessionMembership::new(2, false, false).unwrap());
        let waiter = {
            let m = m.clone();
            tokio::spawn(async move { m.lost().await })
        };

        assert!(!m.is_aborted());
        m.on_session_lost();
        m.on_session_lost();
        assert!(m.is_aborted());

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
    }
}
