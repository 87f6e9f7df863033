//! Network session client.
//!
//! Joining runs in three steps, each bounded by [`DISCOVERY_TIMEOUT`] and the
//! interrupt token:
//!
//! 1. connect to the bus address (retried every [`FIND_INTERVAL`] while the
//!    host is not up),
//! 2. send [`Frame::Find`] for the prefix until a host advertises a match,
//! 3. join the advertised name and learn the member list from the reply.
//!
//! After that a background task turns host frames into listener callbacks.
//! The host going away is reported as session lost.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use super::link::{self, ClientLink, LinkHandle, LEAVE_FLUSH};
use super::{SendError, SessionId, SignalTransport, TransportError};
use crate::config::TransportKind;
use crate::listener::Listeners;
use crate::wire::Frame;

/// How often an unanswered find (or a refused connect) is retried.
pub const FIND_INTERVAL: Duration = Duration::from_secs(1);

/// Give up on session setup after this long.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// A client joined to a host's session.
pub struct SessionPeer {
    link: LinkHandle,
    unique_name: String,
    session: SessionId,
    left: AtomicBool,
    stop: CancellationToken,
}

enum Step<T> {
    Done(T),
    Retry,
}

impl SessionPeer {
    /// Find a session advertised under `prefix` at `addr` and join it.
    pub async fn join(
        kind: TransportKind,
        addr: SocketAddr,
        prefix: &str,
        listeners: Listeners,
        interrupt: &CancellationToken,
    ) -> Result<Self, TransportError> {
        let deadline = Instant::now() + DISCOVERY_TIMEOUT;
        let stop = CancellationToken::new();

        let ClientLink { handle, mut frames } = loop {
            match link::connect(kind, addr, stop.clone()).await {
                Ok(link) => break link,
                Err(e) if Instant::now() + FIND_INTERVAL >= deadline => return Err(e),
                Err(e) => {
                    log::debug!("[peer] {e}; retrying");
                    pause(interrupt).await?;
                }
            }
        };
        // Stops the link reader unless setup completes.
        let guard = stop.clone().drop_guard();

        let found = loop {
            handle
                .send(&Frame::Find {
                    prefix: prefix.to_string(),
                })
                .map_err(|_| TransportError::LinkClosed)?;
            log::debug!("[peer] find {prefix:?} sent to {addr}");

            let step = await_frame(&mut frames, interrupt, deadline, |frame| match frame {
                Frame::Advertise { name, .. } if name.starts_with(prefix) => Some(name),
                _ => None,
            })
            .await?;
            match step {
                Step::Done(name) => break name,
                Step::Retry if Instant::now() >= deadline => {
                    return Err(TransportError::NotFound {
                        prefix: prefix.to_string(),
                    })
                }
                Step::Retry => {}
            }
        };

        listeners.discovery.found_advertised_name(&found, prefix);

        handle
            .send(&Frame::Join {
                name: found.clone(),
            })
            .map_err(|_| TransportError::LinkClosed)?;

        let reply = loop {
            let step = await_frame(&mut frames, interrupt, deadline, |frame| match frame {
                Frame::JoinReply {
                    session,
                    unique_name,
                    host,
                    members,
                } => Some(Ok((session, unique_name, host, members))),
                Frame::Rejected { reason } => Some(Err(reason)),
                _ => None,
            })
            .await?;
            match step {
                Step::Done(Ok(reply)) => break reply,
                Step::Done(Err(reason)) => {
                    return Err(TransportError::JoinRejected { name: found, reason })
                }
                Step::Retry if Instant::now() >= deadline => {
                    return Err(TransportError::JoinRejected {
                        name: found,
                        reason: "no reply from host".to_string(),
                    })
                }
                Step::Retry => {}
            }
        };
        let _ = guard.disarm();

        let (session, unique_name, host, members) = reply;
        log::info!("[peer] joined {found} (session {session}) as {unique_name}, host {host}");
        for member in &members {
            listeners.membership.member_added(session, member);
        }

        tokio::spawn(session_frames(frames, listeners, session, stop.clone()));

        Ok(Self {
            link: handle,
            unique_name,
            session,
            left: AtomicBool::new(false),
            stop,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }
}

impl Drop for SessionPeer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn pause(interrupt: &CancellationToken) -> Result<(), TransportError> {
    tokio::select! {
        _ = interrupt.cancelled() => Err(TransportError::Interrupted),
        _ = sleep(FIND_INTERVAL) => Ok(()),
    }
}

/// Wait up to [`FIND_INTERVAL`] for a frame `pick` accepts.
async fn await_frame<T, F>(
    frames: &mut mpsc::UnboundedReceiver<Frame>,
    interrupt: &CancellationToken,
    deadline: Instant,
    mut pick: F,
) -> Result<Step<T>, TransportError>
where
    F: FnMut(Frame) -> Option<T>,
{
    let wake = (Instant::now() + FIND_INTERVAL).min(deadline);
    loop {
        tokio::select! {
            _ = interrupt.cancelled() => return Err(TransportError::Interrupted),
            _ = tokio::time::sleep_until(wake) => return Ok(Step::Retry),
            frame = frames.recv() => match frame {
                None => return Err(TransportError::LinkClosed),
                Some(frame) => {
                    let kind = frame.kind();
                    match pick(frame) {
                        Some(v) => return Ok(Step::Done(v)),
                        None => log::debug!("[peer] ignoring {kind} during setup"),
                    }
                }
            },
        }
    }
}

async fn session_frames(
    mut frames: mpsc::UnboundedReceiver<Frame>,
    listeners: Listeners,
    session: SessionId,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => return,
            frame = frames.recv() => frame,
        };
        match frame {
            Some(Frame::Signal {
                session: s,
                sender,
                body,
                ..
            }) if s == session => listeners.signals.on_signal(&sender, &body),
            Some(Frame::MemberAdded { session: s, name }) if s == session => {
                listeners.membership.member_added(session, &name)
            }
            Some(Frame::MemberRemoved { session: s, name }) if s == session => {
                listeners.membership.member_removed(session, &name)
            }
            Some(Frame::SessionLost { session: s }) if s == session => {
                listeners.membership.session_lost(session);
                return;
            }
            Some(other) => log::debug!("[peer] ignoring {}", other.kind()),
            None => {
                if !stop.is_cancelled() {
                    log::debug!("[peer] link to host closed");
                    listeners.membership.session_lost(session);
                }
                return;
            }
        }
    }
}

#[async_trait]
impl SignalTransport for SessionPeer {
    async fn send_signal(
        &self,
        session: SessionId,
        body: Vec<u8>,
        ttl_secs: u32,
        flags: u8,
    ) -> Result<(), SendError> {
        if self.left.load(Ordering::SeqCst) {
            return Err(SendError::NotJoined);
        }
        if session != self.session {
            return Err(SendError::UnknownSession(session));
        }
        self.link.send(&Frame::Signal {
            session,
            sender: self.unique_name.clone(),
            ttl_secs,
            flags,
            body,
        })
    }

    fn unique_name(&self) -> String {
        self.unique_name.clone()
    }

    async fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.link.send_within(&Frame::Leave, LEAVE_FLUSH).await {
            log::debug!("[peer] leave not sent: {e}");
        }
        self.stop.cancel();
        log::info!("[peer] {} left session {}", self.unique_name, self.session);
    }
}
