//! Per-connection protocol state.
//!
//! A [`Session`] owns the write half of one TCP connection and drives a read
//! loop over the other half. Incoming frames are decoded and routed by
//! pattern: pings are answered inline, pushes, requests and responses are
//! handed to the actor serializer, which owns the correlation table.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::codec::FrameCodec;
use crate::frame::{Frame, Message};
use crate::handler::Handler;
use crate::node::IoCounters;
use crate::sta::StaHandle;
use crate::types::{MsgError, NetError, Reply, SessionId, MAX_FRAME_BODY};

/// How long `close` waits for an in-flight write before giving up on a
/// graceful shutdown of the write half.
const CLOSE_WRITER_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

pub(crate) type SessionReader = FramedRead<OwnedReadHalf, FrameCodec>;

#[derive(Debug, Default)]
struct PingState {
    seed: u8,
    outstanding: Option<(u8, Instant)>,
    rtt: Option<Duration>,
}

/// One open connection.
pub struct Session {
    id: SessionId,
    epoch: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    writer: Mutex<FramedWrite<OwnedWriteHalf, FrameCodec>>,
    handler: Arc<dyn Handler>,
    sta: StaHandle,
    counters: Arc<IoCounters>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    last_active: StdMutex<Instant>,
    nudged: AtomicBool,
    ping: StdMutex<PingState>,
}

impl Session {
    /// Wrap a connected stream. The session is inert until [`Session::start`].
    pub(crate) fn new(
        id: SessionId,
        stream: TcpStream,
        handler: Arc<dyn Handler>,
        sta: StaHandle,
        counters: Arc<IoCounters>,
    ) -> Result<(Arc<Session>, SessionReader), MsgError> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("conn [{}] set_nodelay failed: {}", id, e);
        }

        let (read_half, write_half) = stream.into_split();
        let (closed_tx, _) = watch::channel(false);

        let session = Arc::new(Session {
            id,
            epoch: NEXT_EPOCH.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            local_addr,
            writer: Mutex::new(FramedWrite::new(write_half, FrameCodec::new())),
            handler,
            sta,
            counters,
            closed: AtomicBool::new(false),
            closed_tx,
            last_active: StdMutex::new(Instant::now()),
            nudged: AtomicBool::new(false),
            ping: StdMutex::new(PingState::default()),
        });

        Ok((session, FramedRead::new(read_half, FrameCodec::new())))
    }

    /// Register with the actor serializer, notify `on_open`, then start
    /// reading. A session closed before this point is never opened.
    pub(crate) async fn start(
        self: &Arc<Self>,
        reader: SessionReader,
    ) -> Result<JoinHandle<()>, MsgError> {
        if self.is_closed() {
            return Err(MsgError::SessionClosed);
        }
        self.sta.attach(self).await?;
        if self.is_closed() {
            // close may have detached before the attach above landed
            if let Err(e) = self.sta.detach(self).await {
                debug!("conn [{}] detach skipped: {}", self.id, e);
            }
            return Err(MsgError::SessionClosed);
        }
        info!("conn [{}] established with {}.", self.id, self.peer_addr);
        self.handler.on_open(self);

        let session = self.clone();
        Ok(tokio::spawn(async move { session.read_loop(reader).await }))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Time of the last frame received from the peer.
    pub fn last_active(&self) -> Instant {
        *lock(&self.last_active)
    }

    /// How long the session has been idle as of `now`.
    pub fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active())
    }

    /// Round-trip time measured by the last answered [`Session::ping`].
    pub fn rtt(&self) -> Option<Duration> {
        lock(&self.ping).rtt
    }

    fn touch(&self) {
        *lock(&self.last_active) = Instant::now();
        self.nudged.store(false, Ordering::Release);
    }

    /// Marks the session as pinged for its current idle period. Returns
    /// false if it already was.
    pub(crate) fn mark_nudged(&self) -> bool {
        !self.nudged.swap(true, Ordering::AcqRel)
    }

    async fn read_loop(self: Arc<Self>, mut reader: SessionReader) {
        let mut closed_rx = self.closed_tx.subscribe();

        loop {
            if self.is_closed() {
                return;
            }

            let next = tokio::select! {
                biased;
                _ = closed_rx.changed() => continue,
                next = reader.next() => next,
            };

            match next {
                Some(Ok(body)) => {
                    self.counters.record_read();
                    if let Err(e) = self.dispatch(body).await {
                        error!("conn [{}] dispatch failed: {}", self.id, e);
                        break;
                    }
                }
                Some(Err(e)) if e.is_protocol() => {
                    error!("conn [{}] protocol error: {}", self.id, e);
                    break;
                }
                Some(Err(e)) => {
                    debug!("conn [{}] read error: {}", self.id, e);
                    break;
                }
                None => break,
            }
        }

        self.close(false).await;
    }

    async fn dispatch(self: &Arc<Self>, body: Bytes) -> Result<(), MsgError> {
        self.touch();

        match Frame::decode(body)?.message {
            Message::Push { body } => self.sta.push(self, body).await?,
            Message::Request { serial, body } => self.sta.request(self, serial, body).await?,
            Message::Response { serial, en, body } => {
                self.sta.response(self, serial, Reply::new(en, body)).await?
            }
            Message::Ping { serial } => {
                if let Err(e) = self.write_message(Message::Pong { serial }).await {
                    debug!("conn [{}] pong {} not sent: {}", self.id, serial, e);
                }
            }
            Message::Pong { serial } => self.on_pong(serial),
            Message::Sub { subject } => self.handler.on_sub(self, &subject),
            Message::Unsub => self.handler.on_unsub(self),
            Message::Pub { subject, body } => self.handler.on_pub(self, &subject, body),
        }

        Ok(())
    }

    fn on_pong(&self, serial: u8) {
        let mut ping = lock(&self.ping);
        let outstanding = ping.outstanding;
        match outstanding {
            Some((expected, sent)) if expected == serial => {
                let rtt = sent.elapsed();
                ping.outstanding = None;
                ping.rtt = Some(rtt);
                debug!("conn [{}] rtt {:?}", self.id, rtt);
            }
            _ => debug!("conn [{}] unexpected pong {}", self.id, serial),
        }
    }

    /// Encode and write one message. An I/O failure closes the session.
    pub(crate) async fn write_message(self: &Arc<Self>, message: Message) -> Result<(), MsgError> {
        if self.is_closed() {
            return Err(MsgError::SessionClosed);
        }

        let body = Frame::new(message).encode_body()?;
        let result = {
            let mut writer = self.writer.lock().await;
            writer.send(body).await
        };
        self.after_write(result).await
    }

    /// Write already framed bytes as they are.
    pub async fn write_raw(self: &Arc<Self>, data: &[u8]) -> Result<(), MsgError> {
        if self.is_closed() {
            return Err(MsgError::SessionClosed);
        }

        let result = {
            let mut writer = self.writer.lock().await;
            writer.get_mut().write_all(data).await.map_err(MsgError::from)
        };
        self.after_write(result).await
    }

    async fn after_write(self: &Arc<Self>, result: Result<(), MsgError>) -> Result<(), MsgError> {
        match result {
            Ok(()) => {
                self.counters.record_write();
                Ok(())
            }
            Err(e) => {
                error!("conn [{}] write error: {}", self.id, e);
                self.close(false).await;
                Err(e)
            }
        }
    }

    /// Send a request and wait for its response.
    ///
    /// Always resolves: with the peer's reply, or with a non-zero error code
    /// if the request could not be sent or the session closed first.
    pub async fn request(self: &Arc<Self>, data: impl Into<Bytes>) -> Reply {
        let body = data.into();
        if body.is_empty() {
            return Reply::error(NetError::RequestDataIsEmpty);
        }
        if body.len() + 4 > MAX_FRAME_BODY {
            return Reply::error(NetError::DataTooLarge);
        }
        if self.is_closed() {
            return Reply::error(NetError::SessionClosed);
        }

        let (serial, waiter) = match self.sta.register(self).await {
            Ok(registered) => registered,
            Err(en) => return Reply::error(en),
        };

        if let Err(e) = self.write_message(Message::Request { serial, body }).await {
            self.sta.cancel(self, serial).await;
            return match e {
                MsgError::Io(_) => Reply::error(NetError::Write),
                other => Reply::error(other.net_error()),
            };
        }

        waiter
            .await
            .unwrap_or_else(|_| Reply::error(NetError::SessionClosed))
    }

    /// Send a one-way message.
    pub async fn push(self: &Arc<Self>, data: impl Into<Bytes>) -> NetError {
        let body = data.into();
        if body.is_empty() {
            return NetError::PushDataIsEmpty;
        }
        self.send_or_code(Message::Push { body }).await
    }

    /// Send a ping; the matching pong updates [`Session::rtt`].
    pub async fn ping(self: &Arc<Self>) -> NetError {
        let serial = {
            let mut ping = lock(&self.ping);
            ping.seed = ping.seed.wrapping_add(1);
            ping.outstanding = Some((ping.seed, Instant::now()));
            ping.seed
        };
        self.send_or_code(Message::Ping { serial }).await
    }

    pub async fn sub(self: &Arc<Self>, subject: impl Into<String>) -> NetError {
        self.send_or_code(Message::Sub {
            subject: subject.into(),
        })
        .await
    }

    pub async fn unsub(self: &Arc<Self>) -> NetError {
        self.send_or_code(Message::Unsub).await
    }

    pub async fn publish(self: &Arc<Self>, subject: impl Into<String>, data: impl Into<Bytes>) -> NetError {
        self.send_or_code(Message::Pub {
            subject: subject.into(),
            body: data.into(),
        })
        .await
    }

    /// Reply to a request received on this session.
    pub(crate) async fn respond(self: &Arc<Self>, serial: u16, reply: Reply) -> Result<(), MsgError> {
        let message = Message::Response {
            serial,
            en: reply.en,
            body: reply.data,
        };
        match self.write_message(message).await {
            Err(MsgError::FrameTooLarge(len)) => {
                warn!(
                    "conn [{}] response {} of {} bytes too large",
                    self.id, serial, len
                );
                self.write_message(Message::Response {
                    serial,
                    en: NetError::DataTooLarge.code(),
                    body: Bytes::new(),
                })
                .await
            }
            other => other,
        }
    }

    async fn send_or_code(self: &Arc<Self>, message: Message) -> NetError {
        match self.write_message(message).await {
            Ok(()) => NetError::Success,
            Err(MsgError::Io(_)) => NetError::Write,
            Err(e) => e.net_error(),
        }
    }

    /// Close the session. Only the first call has any effect: it stops the
    /// read loop, fails every pending request with `SessionClosed` and
    /// notifies `on_close`.
    pub async fn close(self: &Arc<Self>, force: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed_tx.send_replace(true);

        if let Err(e) = self.sta.detach(self).await {
            debug!("conn [{}] detach skipped: {}", self.id, e);
        }

        match timeout(CLOSE_WRITER_TIMEOUT, self.writer.lock()).await {
            Ok(mut writer) => {
                if let Err(e) = writer.get_mut().shutdown().await {
                    debug!("conn [{}] shutdown: {}", self.id, e);
                }
            }
            Err(_) => warn!("conn [{}] writer busy, not shut down", self.id),
        }

        info!("conn [{}] closed.", self.id);
        self.handler.on_close(self, force);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::net::TcpListener;

    /// A session over loopback that has not been started yet, its reader
    /// and the raw peer socket.
    pub(crate) async fn unstarted_pair(
        id: SessionId,
        handler: Arc<dyn Handler>,
        sta: StaHandle,
    ) -> (Arc<Session>, SessionReader, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let (session, reader) = Session::new(
            id,
            dialed.unwrap(),
            handler,
            sta,
            Arc::new(IoCounters::default()),
        )
        .unwrap();
        (session, reader, accepted.unwrap().0)
    }

    /// A started session over loopback plus the raw peer socket.
    pub(crate) async fn session_pair(
        id: SessionId,
        handler: Arc<dyn Handler>,
        sta: StaHandle,
    ) -> (Arc<Session>, TcpStream) {
        let (session, reader, peer) = unstarted_pair(id, handler, sta).await;
        session.start(reader).await.unwrap();
        (session, peer)
    }

    /// Read exactly one frame from `peer`, leaving later frames unread.
    pub(crate) async fn read_frame(peer: &mut TcpStream) -> Frame {
        use tokio::io::AsyncReadExt;

        timeout(Duration::from_secs(5), async {
            let mut len = [0u8; 2];
            peer.read_exact(&mut len).await.unwrap();
            let mut body = vec![0u8; u16::from_le_bytes(len) as usize];
            peer.read_exact(&mut body).await.unwrap();
            Frame::decode(Bytes::from(body)).unwrap()
        })
        .await
        .expect("no frame within 5s")
    }
}
