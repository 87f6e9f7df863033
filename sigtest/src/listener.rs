//! Narrow callback capabilities a transport drives during a test.
//!
//! Discovery, session admission, membership changes and signal arrival are
//! separate traits so each can be replaced independently in tests.  A
//! transport receives them bundled as [`Listeners`].
//!
//! Callbacks may run on transport tasks concurrently with the delivery loop;
//! implementations must not block.

use std::sync::Arc;

use crate::membership::SessionMembership;
use crate::transport::SessionId;

/// Advertised names coming and going.
pub trait DiscoveryEvents: Send + Sync {
    fn found_advertised_name(&self, name: &str, prefix: &str);

    fn lost_advertised_name(&self, name: &str, prefix: &str) {
        let _ = (name, prefix);
    }
}

/// Decides whether a host admits a joiner.
pub trait SessionAcceptPolicy: Send + Sync {
    fn accept_session_joiner(&self, joiner: &str) -> bool;
}

/// Session lifecycle as seen by one peer.
pub trait MembershipEvents: Send + Sync {
    /// Host side: `joiner` completed joining `session`.
    fn session_joined(&self, session: SessionId, joiner: &str);

    /// Another peer is now part of `session`.
    fn member_added(&self, session: SessionId, name: &str);

    fn member_removed(&self, session: SessionId, name: &str) {
        let _ = (session, name);
    }

    /// This peer is no longer part of `session`.
    fn session_lost(&self, session: SessionId);
}

/// Receives raw signal bodies.
pub trait SignalHandler: Send + Sync {
    fn on_signal(&self, sender: &str, body: &[u8]);
}

/// The set of callbacks handed to a transport.
#[derive(Clone)]
pub struct Listeners {
    pub discovery: Arc<dyn DiscoveryEvents>,
    pub accept: Arc<dyn SessionAcceptPolicy>,
    pub membership: Arc<dyn MembershipEvents>,
    pub signals: Arc<dyn SignalHandler>,
}

/// Admits every joiner.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl SessionAcceptPolicy for AcceptAll {
    fn accept_session_joiner(&self, _joiner: &str) -> bool {
        true
    }
}

/// Logs discovery activity; joining is driven by the transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscoveryLog;

impl DiscoveryEvents for DiscoveryLog {
    fn found_advertised_name(&self, name: &str, prefix: &str) {
        log::info!("FoundAdvertisedName(name={name}, prefix={prefix})");
    }

    fn lost_advertised_name(&self, name: &str, prefix: &str) {
        log::info!("LostAdvertisedName(name={name}, prefix={prefix})");
    }
}

/// Feeds membership events into [`SessionMembership`].
#[derive(Debug, Clone)]
pub struct MembershipListener {
    membership: Arc<SessionMembership>,
}

impl MembershipListener {
    pub fn new(membership: Arc<SessionMembership>) -> Self {
        Self { membership }
    }
}

impl MembershipEvents for MembershipListener {
    fn session_joined(&self, session: SessionId, joiner: &str) {
        log::info!("=============> Session Established: joiner={joiner}, sessionId={session}");
        self.membership.set_session_id(session);
    }

    fn member_added(&self, session: SessionId, name: &str) {
        let count = self.membership.on_member_joined();
        log::info!(
            "{name} was added to session {session} ({}/{} participants)",
            count + 1,
            self.membership.target()
        );
    }

    fn member_removed(&self, session: SessionId, name: &str) {
        log::info!("{name} was removed from session {session}");
    }

    fn session_lost(&self, session: SessionId) {
        log::warn!("Session Lost  {session}");
        self.membership.on_session_lost();
    }
}
