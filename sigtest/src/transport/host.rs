//! Network session host.
//!
//! The host binds the bus address, advertises its well-known name, admits
//! joiners, and relays every signal to all other members.  It is itself a
//! session member: its own signals go out through [`SignalTransport`] and
//! relayed signals reach its [`Listeners`].
//!
//! ```text
//!   client A ──┐                ┌──▶ client B
//!              ├──▶  host  ─────┤
//!   client C ──┘     │          └──▶ client C / A ...
//!                    └──▶ local SignalHandler
//! ```
//!
//! State lives behind a std mutex that is never held across an await or
//! while a listener callback runs.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::link::{self, LinkEvent, LinkHandle, LinkId, LEAVE_FLUSH};
use super::{SendError, SessionId, SignalTransport, TransportError};
use crate::config::TransportKind;
use crate::listener::Listeners;
use crate::wire::Frame;

struct Member {
    name: String,
    link: LinkHandle,
}

struct HostState {
    /// Links that have not joined (yet).
    links: HashMap<LinkId, LinkHandle>,
    /// Joined members in join order.
    members: BTreeMap<LinkId, Member>,
    next_member: u32,
    closed: bool,
}

struct HostShared {
    well_known_name: String,
    unique_name: String,
    tag: String,
    session: SessionId,
    listeners: Listeners,
    state: Mutex<HostState>,
}

impl HostShared {
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A listening session host.
pub struct SessionHost {
    shared: Arc<HostShared>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl SessionHost {
    /// Bind `addr`, advertise `well_known_name` and start admitting joiners.
    pub async fn listen(
        kind: TransportKind,
        addr: SocketAddr,
        well_known_name: &str,
        listeners: Listeners,
    ) -> Result<Self, TransportError> {
        let shutdown = CancellationToken::new();
        let (local_addr, events) = link::listen(kind, addr, shutdown.clone()).await?;

        let mut rng = rand::thread_rng();
        let tag: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let session: SessionId = rng.gen_range(1..=u32::MAX);
        let unique_name = format!(":{tag}.1");

        let shared = Arc::new(HostShared {
            well_known_name: well_known_name.to_string(),
            unique_name,
            tag,
            session,
            listeners,
            state: Mutex::new(HostState {
                links: HashMap::new(),
                members: BTreeMap::new(),
                next_member: 1,
                closed: false,
            }),
        });

        log::info!(
            "[host] advertising {} on {}://{} as {} (session {})",
            shared.well_known_name,
            kind,
            local_addr,
            shared.unique_name,
            session
        );
        tokio::spawn(event_loop(shared.clone(), events, shutdown.clone()));

        Ok(Self {
            shared,
            local_addr,
            shutdown,
        })
    }

    /// Address the host is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session_id(&self) -> SessionId {
        self.shared.session
    }

    pub fn well_known_name(&self) -> &str {
        &self.shared.well_known_name
    }

    /// Unique names of the joined members, excluding the host.
    pub fn members(&self) -> Vec<String> {
        self.shared
            .lock()
            .members
            .values()
            .map(|m| m.name.clone())
            .collect()
    }
}

impl Drop for SessionHost {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

async fn event_loop(
    shared: Arc<HostShared>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            LinkEvent::Opened(handle) => {
                log::debug!("[host] link {} opened from {}", handle.id(), handle.remote());
                shared.lock().links.insert(handle.id(), handle);
            }
            LinkEvent::Frame(id, frame) => on_frame(&shared, id, frame),
            LinkEvent::Closed(id) => on_departure(&shared, id),
        }
    }
    log::debug!("[host] event loop stopped");
}

fn on_frame(shared: &HostShared, id: LinkId, frame: Frame) {
    match frame {
        Frame::Find { prefix } => on_find(shared, id, prefix),
        Frame::Join { name } => on_join(shared, id, name),
        Frame::Signal {
            session,
            ttl_secs,
            flags,
            body,
            ..
        } => on_signal(shared, id, session, ttl_secs, flags, body),
        Frame::Leave => on_departure(shared, id),
        other => log::debug!("[host] ignoring {} from link {}", other.kind(), id),
    }
}

fn reply(shared: &HostShared, id: LinkId, frame: &Frame) {
    let state = shared.lock();
    let link = state
        .links
        .get(&id)
        .or_else(|| state.members.get(&id).map(|m| &m.link));
    if let Some(link) = link {
        if let Err(e) = link.send(frame) {
            log::debug!("[host] {} to link {} failed: {}", frame.kind(), id, e);
        }
    }
}

fn on_find(shared: &HostShared, id: LinkId, prefix: String) {
    if !shared.well_known_name.starts_with(&prefix) {
        log::debug!("[host] find for {prefix:?} does not match");
        return;
    }
    log::debug!("[host] answering find for {prefix:?} from link {id}");
    reply(
        shared,
        id,
        &Frame::Advertise {
            name: shared.well_known_name.clone(),
            prefix,
        },
    );
}

fn on_join(shared: &HostShared, id: LinkId, name: String) {
    if name != shared.well_known_name {
        reply(
            shared,
            id,
            &Frame::Rejected {
                reason: format!("{name} is not advertised here"),
            },
        );
        return;
    }

    let joiner = {
        let mut state = shared.lock();
        if state.closed || state.members.contains_key(&id) || !state.links.contains_key(&id) {
            return;
        }
        state.next_member += 1;
        format!(":{}.{}", shared.tag, state.next_member)
    };

    if !shared.listeners.accept.accept_session_joiner(&joiner) {
        log::info!("[host] refused {joiner}");
        reply(
            shared,
            id,
            &Frame::Rejected {
                reason: format!("{joiner} refused"),
            },
        );
        return;
    }

    {
        let mut state = shared.lock();
        let Some(link) = state.links.remove(&id) else {
            return;
        };
        let mut existing = vec![shared.unique_name.clone()];
        for m in state.members.values() {
            existing.push(m.name.clone());
            let _ = m.link.send(&Frame::MemberAdded {
                session: shared.session,
                name: joiner.clone(),
            });
        }
        let _ = link.send(&Frame::JoinReply {
            session: shared.session,
            unique_name: joiner.clone(),
            host: shared.unique_name.clone(),
            members: existing,
        });
        state.members.insert(
            id,
            Member {
                name: joiner.clone(),
                link,
            },
        );
    }

    shared.listeners.membership.session_joined(shared.session, &joiner);
    shared.listeners.membership.member_added(shared.session, &joiner);
}

fn on_signal(
    shared: &HostShared,
    id: LinkId,
    session: SessionId,
    ttl_secs: u32,
    flags: u8,
    body: Vec<u8>,
) {
    if session != shared.session {
        log::debug!("[host] signal for unknown session {session} from link {id}");
        return;
    }

    let sender = {
        let state = shared.lock();
        let Some(sender) = state.members.get(&id).map(|m| m.name.clone()) else {
            log::debug!("[host] signal from link {id} which has not joined");
            return;
        };
        let bytes = Frame::Signal {
            session,
            sender: sender.clone(),
            ttl_secs,
            flags,
            body: body.clone(),
        }
        .encode();
        for (other, m) in &state.members {
            if *other == id {
                continue;
            }
            if let Err(e) = m.link.send_encoded(bytes.clone()) {
                log::warn!("[host] relay to {} failed: {}", m.name, e);
            }
        }
        sender
    };

    shared.listeners.signals.on_signal(&sender, &body);
}

fn on_departure(shared: &HostShared, id: LinkId) {
    let (name, now_empty) = {
        let mut state = shared.lock();
        state.links.remove(&id);
        let Some(gone) = state.members.remove(&id) else {
            return;
        };
        for m in state.members.values() {
            let _ = m.link.send(&Frame::MemberRemoved {
                session: shared.session,
                name: gone.name.clone(),
            });
        }
        (gone.name, state.members.is_empty() && !state.closed)
    };

    log::info!("[host] {name} left session {}", shared.session);
    shared.listeners.membership.member_removed(shared.session, &name);
    if now_empty {
        shared.listeners.membership.session_lost(shared.session);
    }
}

// ---------------------------------------------------------------------------
// SignalTransport
// ---------------------------------------------------------------------------

#[async_trait]
impl SignalTransport for SessionHost {
    async fn send_signal(
        &self,
        session: SessionId,
        body: Vec<u8>,
        ttl_secs: u32,
        flags: u8,
    ) -> Result<(), SendError> {
        if session != self.shared.session {
            return Err(SendError::UnknownSession(session));
        }
        let bytes = Frame::Signal {
            session,
            sender: self.shared.unique_name.clone(),
            ttl_secs,
            flags,
            body,
        }
        .encode();

        let state = self.shared.lock();
        if state.closed {
            return Err(SendError::NotJoined);
        }
        let mut result = Ok(());
        for m in state.members.values() {
            if let Err(e) = m.link.send_encoded(bytes.clone()) {
                log::debug!("[host] send to {} failed: {}", m.name, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    fn unique_name(&self) -> String {
        self.shared.unique_name.clone()
    }

    async fn leave(&self) {
        let members = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.links.clear();
            std::mem::take(&mut state.members)
        };
        let lost = Frame::SessionLost {
            session: self.shared.session,
        };
        for m in members.values() {
            if let Err(e) = m.link.send_within(&lost, LEAVE_FLUSH).await {
                log::debug!("[host] session lost not sent to {}: {}", m.name, e);
            }
        }
        log::info!(
            "[host] closed session {} ({})",
            self.shared.session,
            self.shared.well_known_name
        );
        self.shutdown.cancel();
    }
}
