//! In-process session bus.
//!
//! [`LocalBus`] lets several peers inside one process advertise, discover,
//! join and exchange signals without any sockets.  Delivery is synchronous:
//! `send_signal` returns after every other member's [`SignalHandler`] ran.
//!
//! Listener callbacks are never invoked while the bus lock is held, so a
//! callback may call back into the bus.
//!
//! [`SignalHandler`]: crate::listener::SignalHandler

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{SendError, SessionId, SignalTransport, TransportError};
use crate::listener::Listeners;

enum Notice {
    Joined(SessionId, String),
    Added(SessionId, String),
    Removed(SessionId, String),
    Lost(SessionId),
}

struct LocalSession {
    host: String,
    /// Every participant, host first.
    members: Vec<String>,
}

#[derive(Default)]
struct BusInner {
    next_peer: u32,
    next_session: SessionId,
    peers: HashMap<String, Listeners>,
    /// Well-known name -> (host unique name, session).
    advertised: BTreeMap<String, (String, SessionId)>,
    sessions: HashMap<SessionId, LocalSession>,
}

impl BusInner {
    fn listeners(&self, name: &str) -> Option<Listeners> {
        self.peers.get(name).cloned()
    }
}

/// A shared in-process bus.  Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<Mutex<BusInner>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a new peer with its callbacks and give it a unique name.
    pub fn attach(&self, listeners: Listeners) -> LocalPeer {
        let mut inner = self.lock();
        inner.next_peer += 1;
        let name = format!(":local.{}", inner.next_peer);
        inner.peers.insert(name.clone(), listeners);
        LocalPeer {
            bus: self.clone(),
            name,
            session: Mutex::new(None),
        }
    }
}

fn dispatch(pending: Vec<(Listeners, Notice)>) {
    for (listeners, notice) in pending {
        match notice {
            Notice::Joined(id, joiner) => listeners.membership.session_joined(id, &joiner),
            Notice::Added(id, name) => listeners.membership.member_added(id, &name),
            Notice::Removed(id, name) => listeners.membership.member_removed(id, &name),
            Notice::Lost(id) => listeners.membership.session_lost(id),
        }
    }
}

/// One peer attached to a [`LocalBus`].
pub struct LocalPeer {
    bus: LocalBus,
    name: String,
    session: Mutex<Option<SessionId>>,
}

impl LocalPeer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> Option<SessionId> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_session(&self, id: Option<SessionId>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }

    /// Host a session under `name`.
    pub fn advertise(&self, name: &str) -> Result<SessionId, TransportError> {
        let mut inner = self.bus.lock();
        if inner.advertised.contains_key(name) {
            return Err(TransportError::NameTaken(name.to_string()));
        }
        inner.next_session += 1;
        let id = inner.next_session;
        inner.sessions.insert(
            id,
            LocalSession {
                host: self.name.clone(),
                members: vec![self.name.clone()],
            },
        );
        inner
            .advertised
            .insert(name.to_string(), (self.name.clone(), id));
        drop(inner);

        self.set_session(Some(id));
        log::info!("[local] {} advertising {} (session {})", self.name, name, id);
        Ok(id)
    }

    /// Join the first advertised session whose name starts with `prefix`.
    pub fn find_and_join(&self, prefix: &str) -> Result<SessionId, TransportError> {
        let (found, host, id, host_listeners, own) = {
            let inner = self.bus.lock();
            let (found, (host, id)) = inner
                .advertised
                .iter()
                .find(|(name, (host, _))| name.starts_with(prefix) && *host != self.name)
                .map(|(name, entry)| (name.clone(), entry.clone()))
                .ok_or_else(|| TransportError::NotFound {
                    prefix: prefix.to_string(),
                })?;
            let host_listeners = inner.listeners(&host);
            let own = inner.listeners(&self.name);
            (found, host, id, host_listeners, own)
        };

        if let Some(own) = &own {
            own.discovery.found_advertised_name(&found, prefix);
        }
        if let Some(h) = &host_listeners {
            if !h.accept.accept_session_joiner(&self.name) {
                return Err(TransportError::JoinRejected {
                    name: found,
                    reason: format!("{host} refused {}", self.name),
                });
            }
        }

        let mut pending = Vec::new();
        {
            let mut inner = self.bus.lock();
            let existing = match inner.sessions.get_mut(&id) {
                Some(session) => {
                    let existing = session.members.clone();
                    session.members.push(self.name.clone());
                    existing
                }
                None => {
                    return Err(TransportError::JoinRejected {
                        name: found,
                        reason: "session no longer exists".to_string(),
                    })
                }
            };

            if let Some(h) = inner.listeners(&host) {
                pending.push((h, Notice::Joined(id, self.name.clone())));
            }
            for member in &existing {
                if let Some(l) = inner.listeners(member) {
                    pending.push((l, Notice::Added(id, self.name.clone())));
                }
                if let Some(own) = &own {
                    pending.push((own.clone(), Notice::Added(id, member.clone())));
                }
            }
        }

        self.set_session(Some(id));
        dispatch(pending);
        Ok(id)
    }
}

#[async_trait]
impl SignalTransport for LocalPeer {
    async fn send_signal(
        &self,
        session: SessionId,
        body: Vec<u8>,
        _ttl_secs: u32,
        _flags: u8,
    ) -> Result<(), SendError> {
        match self.session() {
            None => return Err(SendError::NotJoined),
            Some(joined) if joined != session => return Err(SendError::UnknownSession(session)),
            Some(_) => {}
        }

        let handlers: Vec<_> = {
            let inner = self.bus.lock();
            let Some(s) = inner.sessions.get(&session) else {
                return Err(SendError::LinkClosed);
            };
            s.members
                .iter()
                .filter(|m| **m != self.name)
                .filter_map(|m| inner.listeners(m))
                .map(|l| l.signals)
                .collect()
        };

        for handler in handlers {
            handler.on_signal(&self.name, &body);
        }
        Ok(())
    }

    fn unique_name(&self) -> String {
        self.name.clone()
    }

    async fn leave(&self) {
        let Some(id) = self.session.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };

        let mut pending = Vec::new();
        {
            let mut inner = self.bus.lock();
            let Some(session) = inner.sessions.get_mut(&id) else {
                return;
            };
            session.members.retain(|m| *m != self.name);

            if session.host == self.name {
                let others = std::mem::take(&mut session.members);
                inner.sessions.remove(&id);
                inner.advertised.retain(|_, (_, s)| *s != id);
                for m in others {
                    if let Some(l) = inner.listeners(&m) {
                        pending.push((l, Notice::Lost(id)));
                    }
                }
            } else {
                let others = session.members.clone();
                let host_alone = others.len() == 1 && others[0] == session.host;
                for m in &others {
                    if let Some(l) = inner.listeners(m) {
                        pending.push((l, Notice::Removed(id, self.name.clone())));
                    }
                }
                // Last member gone: the host has nobody left to talk to.
                if host_alone {
                    if let Some(l) = inner.listeners(&others[0]) {
                        pending.push((l, Notice::Lost(id)));
                    }
                }
            }
        }
        log::info!("[local] {} left session {}", self.name, id);
        dispatch(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{
        AcceptAll, DiscoveryEvents, MembershipEvents, SessionAcceptPolicy, SignalHandler,
    };

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        signals: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl Recorder {
        fn push(&self, e: String) {
            self.events.lock().unwrap().push(e);
        }
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl DiscoveryEvents for Recorder {
        fn found_advertised_name(&self, name: &str, prefix: &str) {
            self.push(format!("found {name} {prefix}"));
        }
    }

    impl MembershipEvents for Recorder {
        fn session_joined(&self, session: SessionId, joiner: &str) {
            self.push(format!("joined {session} {joiner}"));
        }
        fn member_added(&self, session: SessionId, name: &str) {
            self.push(format!("added {session} {name}"));
        }
        fn member_removed(&self, session: SessionId, name: &str) {
            self.push(format!("removed {session} {name}"));
        }
        fn session_lost(&self, session: SessionId) {
            self.push(format!("lost {session}"));
        }
    }

    impl SignalHandler for Recorder {
        fn on_signal(&self, sender: &str, body: &[u8]) {
            self.signals
                .lock()
                .unwrap()
                .push((sender.to_string(), body.to_vec()));
        }
    }

    struct RejectAll;

    impl SessionAcceptPolicy for RejectAll {
        fn accept_session_joiner(&self, _joiner: &str) -> bool {
            false
        }
    }

    fn listeners(r: &Arc<Recorder>) -> Listeners {
        Listeners {
            discovery: r.clone(),
            accept: Arc::new(AcceptAll),
            membership: r.clone(),
            signals: r.clone(),
        }
    }

    #[test]
    fn join_notifies_host_and_joiner() {
        let bus = LocalBus::new();
        let (h, c) = (Arc::new(Recorder::default()), Arc::new(Recorder::default()));
        let host = bus.attach(listeners(&h));
        let client = bus.attach(listeners(&c));

        let id = host.advertise("sigtest.one").unwrap();
        assert_eq!(client.find_and_join("sigtest").unwrap(), id);

        assert_eq!(
            h.events(),
            vec![
                format!("joined {id} {}", client.name()),
                format!("added {id} {}", client.name()),
            ]
        );
        assert_eq!(
            c.events(),
            vec![
                format!("found sigtest.one sigtest"),
                format!("added {id} {}", host.name()),
            ]
        );
    }

    #[test]
    fn third_member_is_announced_to_everyone() {
        let bus = LocalBus::new();
        let recs: Vec<Arc<Recorder>> = (0..3).map(|_| Arc::new(Recorder::default())).collect();
        let peers: Vec<LocalPeer> = recs.iter().map(|r| bus.attach(listeners(r))).collect();

        let id = peers[0].advertise("sigtest.one").unwrap();
        peers[1].find_and_join("sigtest").unwrap();
        peers[2].find_and_join("sigtest").unwrap();

        let added = |r: &Recorder| r.events().iter().filter(|e| e.starts_with("added")).count();
        assert_eq!(added(&recs[0]), 2);
        assert_eq!(added(&recs[1]), 2);
        assert_eq!(added(&recs[2]), 2);
        assert!(recs[1]
            .events()
            .contains(&format!("added {id} {}", peers[2].name())));
    }

    #[test]
    fn unknown_prefix_not_found() {
        let bus = LocalBus::new();
        let r = Arc::new(Recorder::default());
        let peer = bus.attach(listeners(&r));
        assert!(matches!(
            peer.find_and_join("nothing"),
            Err(TransportError::NotFound { .. })
        ));
    }

    #[test]
    fn duplicate_advertise_rejected() {
        let bus = LocalBus::new();
        let r = Arc::new(Recorder::default());
        let a = bus.attach(listeners(&r));
        let b = bus.attach(listeners(&r));
        a.advertise("sigtest.one").unwrap();
        assert!(matches!(
            b.advertise("sigtest.one"),
            Err(TransportError::NameTaken(_))
        ));
    }

    #[test]
    fn accept_policy_can_refuse() {
        let bus = LocalBus::new();
        let r = Arc::new(Recorder::default());
        let host = bus.attach(Listeners {
            accept: Arc::new(RejectAll),
            ..listeners(&r)
        });
        let client = bus.attach(listeners(&r));
        host.advertise("sigtest.one").unwrap();
        assert!(matches!(
            client.find_and_join("sigtest"),
            Err(TransportError::JoinRejected { .. })
        ));
        assert_eq!(client.session(), None);
    }

    #[tokio::test]
    async fn signals_reach_every_other_member() {
        let bus = LocalBus::new();
        let recs: Vec<Arc<Recorder>> = (0..3).map(|_| Arc::new(Recorder::default())).collect();
        let peers: Vec<LocalPeer> = recs.iter().map(|r| bus.attach(listeners(r))).collect();
        let id = peers[0].advertise("sigtest.one").unwrap();
        peers[1].find_and_join("sigtest").unwrap();
        peers[2].find_and_join("sigtest").unwrap();

        peers[1].send_signal(id, vec![1, 2, 3], 30, 0).await.unwrap();

        assert!(recs[1].signals.lock().unwrap().is_empty());
        for r in [&recs[0], &recs[2]] {
            let got = r.signals.lock().unwrap().clone();
            assert_eq!(got, vec![(peers[1].name().to_string(), vec![1, 2, 3])]);
        }
    }

    #[tokio::test]
    async fn send_requires_joined_session() {
        let bus = LocalBus::new();
        let r = Arc::new(Recorder::default());
        let lonely = bus.attach(listeners(&r));
        assert!(matches!(
            lonely.send_signal(1, vec![], 30, 0).await,
            Err(SendError::NotJoined)
        ));

        let id = lonely.advertise("sigtest.one").unwrap();
        assert!(matches!(
            lonely.send_signal(id + 1, vec![], 30, 0).await,
            Err(SendError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn host_leaving_loses_session_for_members() {
        let bus = LocalBus::new();
        let (h, c) = (Arc::new(Recorder::default()), Arc::new(Recorder::default()));
        let host = bus.attach(listeners(&h));
        let client = bus.attach(listeners(&c));
        let id = host.advertise("sigtest.one").unwrap();
        client.find_and_join("sigtest").unwrap();

        host.leave().await;
        host.leave().await;

        assert_eq!(c.events().last(), Some(&format!("lost {id}")));
        assert!(matches!(
            client.find_and_join("sigtest"),
            Err(TransportError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn member_leaving_is_announced() {
        let bus = LocalBus::new();
        let (h, c) = (Arc::new(Recorder::default()), Arc::new(Recorder::default()));
        let host = bus.attach(listeners(&h));
        let client = bus.attach(listeners(&c));
        let id = host.advertise("sigtest.one").unwrap();
        client.find_and_join("sigtest").unwrap();

        client.leave().await;
        let events = h.events();
        assert_eq!(
            events[events.len() - 2..],
            [format!("removed {id} {}", client.name()), format!("lost {id}")]
        );
    }

    #[tokio::test]
    async fn host_loses_session_only_when_last_member_leaves() {
        let bus = LocalBus::new();
        let recs: Vec<Arc<Recorder>> = (0..3).map(|_| Arc::new(Recorder::default())).collect();
        let peers: Vec<LocalPeer> = recs.iter().map(|r| bus.attach(listeners(r))).collect();
        let id = peers[0].advertise("sigtest.one").unwrap();
        peers[1].find_and_join("sigtest").unwrap();
        peers[2].find_and_join("sigtest").unwrap();

        let lost = format!("lost {id}");
        peers[1].leave().await;
        assert!(!recs[0].events().contains(&lost));
        assert!(!recs[2].events().contains(&lost));

        peers[2].leave().await;
        assert_eq!(recs[0].events().last(), Some(&lost));
        assert!(!recs[1].events().contains(&lost));
    }
}
