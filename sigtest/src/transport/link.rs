//! Byte links under the network host and client.
//!
//! A link turns a TCP stream or a UDP flow into channels of [`Frame`]s so
//! the session logic never touches a socket.
//!
//! ```text
//!   LinkHandle::send ──▶ tx (bytes) ──▶ writer task ──▶ socket
//!                                                        │
//!   events / frames  ◀── reader task ◀── decode ◀────────┘
//! ```
//!
//! - **tcp**: each frame carries a 4-byte big-endian length prefix.  The
//!   link closes when the stream does.
//! - **udp**: one frame per datagram, at most [`MAX_DATAGRAM`] bytes.  There
//!   is no close; a [`Frame::Leave`] ends the flow on the host side.
//!
//! Each link queues at most [`LINK_QUEUE_DEPTH`] outbound frames.  When the
//! writer falls behind, [`LinkHandle::send`] fails with
//! [`SendError::Backpressure`] instead of buffering.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use super::{SendError, TransportError};
use crate::config::TransportKind;
use crate::wire::Frame;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

/// Largest length prefix a TCP reader accepts.
const MAX_STREAM_FRAME: usize = 1 << 20;

/// Outbound frames a link holds before sends are refused.
pub const LINK_QUEUE_DEPTH: usize = 64;

/// How long a leave waits for room behind queued signals.
pub const LEAVE_FLUSH: Duration = Duration::from_secs(1);

/// Host-assigned id of one client link.
pub type LinkId = u64;

// ---------------------------------------------------------------------------
// LinkHandle
// ---------------------------------------------------------------------------

/// Sending half of one link.  Cloning shares the same writer task.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    id: LinkId,
    remote: SocketAddr,
    limit: Option<usize>,
    tx: mpsc::Sender<Vec<u8>>,
}

impl LinkHandle {
    fn new(id: LinkId, remote: SocketAddr, kind: TransportKind) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(LINK_QUEUE_DEPTH);
        let limit = match kind {
            TransportKind::Tcp => None,
            TransportKind::Udp => Some(MAX_DATAGRAM),
        };
        (
            Self {
                id,
                remote,
                limit,
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn send(&self, frame: &Frame) -> Result<(), SendError> {
        self.send_encoded(frame.encode())
    }

    /// Queue an already-encoded frame without waiting.
    pub fn send_encoded(&self, bytes: Vec<u8>) -> Result<(), SendError> {
        self.check_size(&bytes)?;
        self.tx.try_send(bytes).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Backpressure,
            TrySendError::Closed(_) => SendError::LinkClosed,
        })
    }

    /// Queue `frame`, waiting up to `wait` for room in the queue.
    pub async fn send_within(&self, frame: &Frame, wait: Duration) -> Result<(), SendError> {
        let bytes = frame.encode();
        self.check_size(&bytes)?;
        match tokio::time::timeout(wait, self.tx.send(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::LinkClosed),
            Err(_) => Err(SendError::Backpressure),
        }
    }

    fn check_size(&self, bytes: &[u8]) -> Result<(), SendError> {
        match self.limit {
            Some(limit) if bytes.len() > limit => Err(SendError::TooLarge {
                size: bytes.len(),
                limit,
            }),
            _ => Ok(()),
        }
    }
}

/// What a listening host sees happen on its links.
#[derive(Debug)]
pub enum LinkEvent {
    Opened(LinkHandle),
    Frame(LinkId, Frame),
    Closed(LinkId),
}

// ---------------------------------------------------------------------------
// Stream framing
// ---------------------------------------------------------------------------

async fn write_stream_frame<W: AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    w.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    w.write_all(bytes).await?;
    w.flush().await
}

/// `Ok(None)` on a clean end of stream.
async fn read_stream_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match r.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_STREAM_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds {MAX_STREAM_FRAME}"),
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

fn spawn_stream_writer<W>(mut w: W, mut rx: mpsc::Receiver<Vec<u8>>, remote: SocketAddr)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = write_stream_frame(&mut w, &bytes).await {
                log::debug!("[link] write to {remote} failed: {e}");
                break;
            }
        }
        let _ = w.shutdown().await;
    });
}

/// Pump decoded frames from `r` into `on_frame` until the stream ends,
/// fails, or `stop` fires.
async fn pump_stream<R, F>(mut r: R, remote: SocketAddr, stop: CancellationToken, mut on_frame: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(Frame) -> bool,
{
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => return,
            next = read_stream_frame(&mut r) => next,
        };
        match next {
            Ok(Some(bytes)) => match Frame::decode(&bytes) {
                Ok(frame) => {
                    if !on_frame(frame) {
                        return;
                    }
                }
                Err(e) => log::warn!("[link] dropping malformed frame from {remote}: {e}"),
            },
            Ok(None) => {
                log::debug!("[link] {remote} closed the stream");
                return;
            }
            Err(e) => {
                log::debug!("[link] read from {remote} failed: {e}");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Host side
// ---------------------------------------------------------------------------

/// Start accepting links on `addr`.
///
/// Returns the bound address and the event stream.  Background tasks stop
/// once `shutdown` fires.
pub async fn listen(
    kind: TransportKind,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, mpsc::UnboundedReceiver<LinkEvent>), TransportError> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let local = match kind {
        TransportKind::Tcp => {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| TransportError::Bind { addr, source })?;
            let local = listener
                .local_addr()
                .map_err(|source| TransportError::Bind { addr, source })?;
            tokio::spawn(accept_streams(listener, events_tx, shutdown));
            local
        }
        TransportKind::Udp => {
            let socket = UdpSocket::bind(addr)
                .await
                .map_err(|source| TransportError::Bind { addr, source })?;
            let local = socket
                .local_addr()
                .map_err(|source| TransportError::Bind { addr, source })?;
            tokio::spawn(serve_datagrams(Arc::new(socket), events_tx, shutdown));
            local
        }
    };
    log::debug!("[link] {kind} listening on {local}");
    Ok((local, events_rx))
}

async fn accept_streams(
    listener: TcpListener,
    events: mpsc::UnboundedSender<LinkEvent>,
    shutdown: CancellationToken,
) {
    let mut next_id: LinkId = 0;
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("[link] accept failed: {e}");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        next_id += 1;
        let id = next_id;
        let (rd, wr) = stream.into_split();
        let (handle, rx) = LinkHandle::new(id, remote, TransportKind::Tcp);
        spawn_stream_writer(wr, rx, remote);
        if events.send(LinkEvent::Opened(handle)).is_err() {
            return;
        }

        let events = events.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            pump_stream(rd, remote, stop, |frame| {
                events.send(LinkEvent::Frame(id, frame)).is_ok()
            })
            .await;
            let _ = events.send(LinkEvent::Closed(id));
        });
    }
}

async fn serve_datagrams(
    socket: Arc<UdpSocket>,
    events: mpsc::UnboundedSender<LinkEvent>,
    shutdown: CancellationToken,
) {
    let mut flows: HashMap<SocketAddr, LinkId> = HashMap::new();
    let mut next_id: LinkId = 0;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = socket.recv_from(&mut buf) => received,
        };
        let (n, remote) = match received {
            Ok(pair) => pair,
            Err(e) => {
                log::debug!("[link] udp receive failed: {e}");
                continue;
            }
        };
        let frame = match Frame::decode(&buf[..n]) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("[link] dropping malformed datagram from {remote}: {e}");
                continue;
            }
        };

        let id = match flows.get(&remote) {
            Some(id) => *id,
            None => {
                next_id += 1;
                let (handle, rx) = LinkHandle::new(next_id, remote, TransportKind::Udp);
                spawn_datagram_writer(socket.clone(), rx, remote);
                if events.send(LinkEvent::Opened(handle)).is_err() {
                    return;
                }
                flows.insert(remote, next_id);
                next_id
            }
        };

        let leaving = frame == Frame::Leave;
        if events.send(LinkEvent::Frame(id, frame)).is_err() {
            return;
        }
        if leaving {
            flows.remove(&remote);
            if events.send(LinkEvent::Closed(id)).is_err() {
                return;
            }
        }
    }
}

fn spawn_datagram_writer(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    remote: SocketAddr,
) {
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = socket.send_to(&bytes, remote).await {
                log::debug!("[link] udp send to {remote} failed: {e}");
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// A client's link to the host.
#[derive(Debug)]
pub struct ClientLink {
    pub handle: LinkHandle,
    /// Closes when the host side goes away (tcp) or `stop` fires.
    pub frames: mpsc::UnboundedReceiver<Frame>,
}

/// Open a link to the host at `addr`.  The reader stops once `stop` fires.
pub async fn connect(
    kind: TransportKind,
    addr: SocketAddr,
    stop: CancellationToken,
) -> Result<ClientLink, TransportError> {
    let (frames_tx, frames) = mpsc::unbounded_channel();
    let handle = match kind {
        TransportKind::Tcp => {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|source| TransportError::Connect { addr, source })?;
            let _ = stream.set_nodelay(true);
            let (rd, wr) = stream.into_split();
            let (handle, rx) = LinkHandle::new(0, addr, kind);
            spawn_stream_writer(wr, rx, addr);
            tokio::spawn(async move {
                pump_stream(rd, addr, stop, |frame| frames_tx.send(frame).is_ok()).await;
            });
            handle
        }
        TransportKind::Udp => {
            let bind: SocketAddr = if addr.is_ipv4() {
                SocketAddr::from(([0, 0, 0, 0], 0))
            } else {
                SocketAddr::from(([0u16; 8], 0))
            };
            let socket = UdpSocket::bind(bind)
                .await
                .map_err(|source| TransportError::Connect { addr, source })?;
            socket
                .connect(addr)
                .await
                .map_err(|source| TransportError::Connect { addr, source })?;
            let socket = Arc::new(socket);
            let (handle, rx) = LinkHandle::new(0, addr, kind);
            spawn_datagram_writer(socket.clone(), rx, addr);
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                loop {
                    let received = tokio::select! {
                        _ = stop.cancelled() => return,
                        received = socket.recv(&mut buf) => received,
                    };
                    match received {
                        Ok(n) => match Frame::decode(&buf[..n]) {
                            Ok(frame) => {
                                if frames_tx.send(frame).is_err() {
                                    return;
                                }
                            }
                            Err(e) => log::warn!("[link] dropping malformed datagram from {addr}: {e}"),
                        },
                        // Refused while the host is not up yet; finds are retried.
                        Err(e) => log::debug!("[link] udp receive failed: {e}"),
                    }
                }
            });
            handle
        }
    };
    log::debug!("[link] {kind} link to {addr} open");
    Ok(ClientLink { handle, frames })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn any_local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("event stream closed")
    }

    #[tokio::test]
    async fn stream_frame_framing() {
        let mut buf = Vec::new();
        write_stream_frame(&mut buf, b"abc").await.unwrap();
        assert_eq!(buf, vec![0, 0, 0, 3, b'a', b'b', b'c']);

        let mut r = &buf[..];
        assert_eq!(read_stream_frame(&mut r).await.unwrap(), Some(b"abc".to_vec()));
        assert_eq!(read_stream_frame(&mut r).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_stream_frame_rejected() {
        let bytes = ((MAX_STREAM_FRAME + 1) as u32).to_be_bytes();
        let mut r = &bytes[..];
        assert!(read_stream_frame(&mut r).await.is_err());
    }

    #[tokio::test]
    async fn udp_handle_enforces_datagram_limit() {
        let (handle, _rx) = LinkHandle::new(1, any_local(), TransportKind::Udp);
        assert!(matches!(
            handle.send_encoded(vec![0; MAX_DATAGRAM + 1]),
            Err(SendError::TooLarge { limit: MAX_DATAGRAM, .. })
        ));
        assert!(handle.send_encoded(vec![0; MAX_DATAGRAM]).is_ok());

        let (tcp, _rx) = LinkHandle::new(1, any_local(), TransportKind::Tcp);
        assert!(tcp.send_encoded(vec![0; MAX_DATAGRAM + 1]).is_ok());
    }

    #[tokio::test]
    async fn closed_writer_reports_link_closed() {
        let (handle, rx) = LinkHandle::new(1, any_local(), TransportKind::Tcp);
        drop(rx);
        assert!(matches!(handle.send(&Frame::Leave), Err(SendError::LinkClosed)));
    }

    #[tokio::test]
    async fn stalled_writer_refuses_instead_of_buffering() {
        // Nobody drains rx, as with a writer stuck on a full socket.
        let (handle, rx) = LinkHandle::new(1, any_local(), TransportKind::Tcp);
        let frame = vec![0xab; 130_026];
        let mut accepted = 0;
        let mut refused = 0;
        for _ in 0..4_000 {
            match handle.send_encoded(frame.clone()) {
                Ok(()) => accepted += 1,
                Err(SendError::Backpressure) => refused += 1,
                Err(e) => panic!("unexpected send error: {e}"),
            }
        }
        assert_eq!(accepted, LINK_QUEUE_DEPTH);
        assert_eq!(refused, 4_000 - LINK_QUEUE_DEPTH);
        assert_eq!(rx.len(), LINK_QUEUE_DEPTH);
    }

    #[tokio::test(start_paused = true)]
    async fn send_within_waits_for_room_then_gives_up() {
        let (handle, mut rx) = LinkHandle::new(1, any_local(), TransportKind::Udp);
        for _ in 0..LINK_QUEUE_DEPTH {
            handle.send(&Frame::Leave).unwrap();
        }
        assert!(matches!(
            handle.send_within(&Frame::Leave, Duration::from_millis(500)).await,
            Err(SendError::Backpressure)
        ));

        rx.recv().await.unwrap();
        handle
            .send_within(&Frame::Leave, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(rx.len(), LINK_QUEUE_DEPTH);
    }

    #[tokio::test]
    async fn unread_tcp_peer_pushes_back() {
        let listener = TcpListener::bind(any_local()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = CancellationToken::new();
        let client = connect(TransportKind::Tcp, addr, stop.clone()).await.unwrap();
        // Accepted but never read from.
        let (_held, _) = listener.accept().await.unwrap();

        let frame = vec![0u8; 130_026];
        let mut refused = false;
        for _ in 0..4_000 {
            match client.handle.send_encoded(frame.clone()) {
                Ok(()) => tokio::task::yield_now().await,
                Err(SendError::Backpressure) => {
                    refused = true;
                    break;
                }
                Err(e) => panic!("unexpected send error: {e}"),
            }
        }
        assert!(refused, "sends never pushed back");
        stop.cancel();
    }

    async fn exchange(kind: TransportKind) {
        let shutdown = CancellationToken::new();
        let (addr, mut events) = listen(kind, any_local(), shutdown.clone()).await.unwrap();
        let mut client = connect(kind, addr, shutdown.clone()).await.unwrap();

        client
            .handle
            .send(&Frame::Find {
                prefix: "sig".into(),
            })
            .unwrap();

        let server_side = match next_event(&mut events).await {
            LinkEvent::Opened(h) => h,
            other => panic!("expected Opened, got {other:?}"),
        };
        match next_event(&mut events).await {
            LinkEvent::Frame(id, Frame::Find { prefix }) => {
                assert_eq!(id, server_side.id());
                assert_eq!(prefix, "sig");
            }
            other => panic!("expected Find, got {other:?}"),
        }

        server_side
            .send(&Frame::SessionLost { session: 4 })
            .unwrap();
        let got = timeout(Duration::from_secs(2), client.frames.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(Frame::SessionLost { session: 4 }));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn tcp_link_exchanges_frames() {
        exchange(TransportKind::Tcp).await;
    }

    #[tokio::test]
    async fn udp_link_exchanges_frames() {
        exchange(TransportKind::Udp).await;
    }

    #[tokio::test]
    async fn tcp_close_is_reported() {
        let shutdown = CancellationToken::new();
        let (addr, mut events) = listen(TransportKind::Tcp, any_local(), shutdown.clone())
            .await
            .unwrap();
        let client_stop = CancellationToken::new();
        let client = connect(TransportKind::Tcp, addr, client_stop.clone())
            .await
            .unwrap();

        let id = match next_event(&mut events).await {
            LinkEvent::Opened(h) => h.id(),
            other => panic!("expected Opened, got {other:?}"),
        };
        client_stop.cancel();
        drop(client);

        match next_event(&mut events).await {
            LinkEvent::Closed(closed) => assert_eq!(closed, id),
            other => panic!("expected Closed, got {other:?}"),
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn udp_leave_closes_flow() {
        let shutdown = CancellationToken::new();
        let (addr, mut events) = listen(TransportKind::Udp, any_local(), shutdown.clone())
            .await
            .unwrap();
        let client = connect(TransportKind::Udp, addr, shutdown.clone())
            .await
            .unwrap();
        client.handle.send(&Frame::Leave).unwrap();

        assert!(matches!(next_event(&mut events).await, LinkEvent::Opened(_)));
        assert!(matches!(
            next_event(&mut events).await,
            LinkEvent::Frame(_, Frame::Leave)
        ));
        assert!(matches!(next_event(&mut events).await, LinkEvent::Closed(_)));
        shutdown.cancel();
    }
}
