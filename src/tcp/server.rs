use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::handler::Handler;
use crate::node::{IoCounters, KeepAlivePolicy, Node, SessionSource};
use crate::session::Session;
use crate::sta::{Sta, StaHandle};
use crate::types::{MsgError, Reply, SessionId, CLIENT_SESSION_ID};

/// TCP server accepting any number of sessions.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    local_addr: SocketAddr,
    listener: StdMutex<Option<TcpListener>>,
    delegate: Arc<dyn Handler>,
    sta: StaHandle,
    actor: StdMutex<Option<Sta>>,
    sta_task: StdMutex<Option<JoinHandle<()>>>,
    node: Node,
    sessions: StdMutex<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU32,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Keeps the session registry in step with closes before the application
/// hears about them.
struct ServerDelegate {
    inner: Weak<ServerInner>,
    external: Arc<dyn Handler>,
}

impl Server {
    /// Bind to the configured address. Connections are accepted once
    /// [`Server::run`] is called.
    pub async fn bind(config: ServerConfig, handler: Arc<dyn Handler>) -> Result<Self, MsgError> {
        config.validate()?;

        let listener = TcpListener::bind(&config.addr).await?;
        let local_addr = listener.local_addr()?;
        info!("tcpmsg server bound to {}", local_addr);

        let inner = Arc::new_cyclic(|weak: &Weak<ServerInner>| {
            let delegate: Arc<dyn Handler> = Arc::new(ServerDelegate {
                inner: weak.clone(),
                external: handler,
            });
            let (actor, sta) = Sta::new(delegate.clone(), config.node.response_queue_capacity);
            let node = Node::new(local_addr.to_string(), config.node.clone());
            let (shutdown, _) = watch::channel(false);

            ServerInner {
                config,
                local_addr,
                listener: StdMutex::new(Some(listener)),
                delegate,
                sta,
                actor: StdMutex::new(Some(actor)),
                sta_task: StdMutex::new(None),
                node,
                sessions: StdMutex::new(HashMap::new()),
                next_id: AtomicU32::new(1),
                stopped: AtomicBool::new(false),
                shutdown,
            }
        });

        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Accept connections until [`Server::stop`]. Can only be run once.
    pub async fn run(&self) -> Result<(), MsgError> {
        let inner = &self.inner;
        let listener = lock(&inner.listener).take().ok_or(MsgError::NodeStopped)?;
        if inner.is_stopped() {
            return Err(MsgError::NodeStopped);
        }
        inner.ensure_running();
        info!("tcpmsg server listening on {}", inner.local_addr);

        let mut shutdown = inner.shutdown.subscribe();
        loop {
            let stopped = *shutdown.borrow_and_update();
            if stopped {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => continue,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("accepted {}", addr);
                        let inner = inner.clone();
                        tokio::spawn(async move { inner.accept(stream).await });
                    }
                    Err(e) => error!("accept failed: {}", e),
                },
            }
        }

        info!("tcpmsg server on {} stopped accepting", inner.local_addr);
        Ok(())
    }

    /// Stop accepting, close every session with `force`, then stop the
    /// background tasks. Idempotent.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let sessions: Vec<Arc<Session>> = {
            let mut registry = lock(&inner.sessions);
            if inner.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
            registry.drain().map(|(_, session)| session).collect()
        };
        inner.shutdown.send_replace(true);

        for session in sessions {
            session.close(true).await;
        }
        inner.node.stop().await;
        inner.sta.stop();

        let task = lock(&inner.sta_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("STA task ended abnormally: {}", e);
            }
        }
        info!("tcpmsg server on {} stopped.", inner.local_addr);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Snapshot of the open sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions()
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        lock(&self.inner.sessions).get(&id).cloned()
    }

    pub fn session_count(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    pub fn counters(&self) -> &Arc<IoCounters> {
        self.inner.node.counters()
    }
}

impl ServerInner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn ensure_running(self: &Arc<Self>) {
        if let Some(actor) = lock(&self.actor).take() {
            *lock(&self.sta_task) = Some(actor.start());
        }

        let weak: Weak<ServerInner> = Arc::downgrade(self);
        let source: Weak<dyn SessionSource> = weak;
        self.node
            .start(source, KeepAlivePolicy::from_config(&self.config.node, true));
    }

    fn allocate_id(&self) -> SessionId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != CLIENT_SESSION_ID {
                return id;
            }
        }
    }

    async fn accept(self: Arc<Self>, stream: TcpStream) {
        let id = self.allocate_id();
        let (session, reader) = match Session::new(
            id,
            stream,
            self.delegate.clone(),
            self.sta.clone(),
            self.node.counters().clone(),
        ) {
            Ok(pair) => pair,
            Err(e) => {
                error!("conn [{}] setup failed: {}", id, e);
                return;
            }
        };

        {
            let mut registry = lock(&self.sessions);
            if self.is_stopped() {
                debug!("conn [{}] refused, server stopping", id);
                return;
            }
            registry.insert(id, session.clone());
        }

        if let Err(e) = session.start(reader).await {
            error!("conn [{}] start failed: {}", id, e);
            self.forget(&session);
        }
    }

    /// Drop `session` from the registry if it is still registered.
    fn forget(&self, session: &Arc<Session>) {
        let mut registry = lock(&self.sessions);
        if registry
            .get(&session.id())
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            registry.remove(&session.id());
        }
    }
}

impl SessionSource for ServerInner {
    fn sessions(&self) -> Vec<Arc<Session>> {
        lock(&self.sessions).values().cloned().collect()
    }
}

impl Handler for ServerDelegate {
    fn on_open(&self, session: &Arc<Session>) {
        self.external.on_open(session);
    }

    fn on_close(&self, session: &Arc<Session>, forced: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.forget(session);
        }
        self.external.on_close(session, forced);
    }

    fn on_req(&self, session: Arc<Session>, body: Bytes) -> BoxFuture<'static, Reply> {
        self.external.on_req(session, body)
    }

    fn on_push(&self, session: &Arc<Session>, body: Bytes) -> i16 {
        self.external.on_push(session, body)
    }

    fn on_sub(&self, session: &Arc<Session>, subject: &str) {
        self.external.on_sub(session, subject);
    }

    fn on_unsub(&self, session: &Arc<Session>) {
        self.external.on_unsub(session);
    }

    fn on_pub(&self, session: &Arc<Session>, subject: &str, body: Bytes) {
        self.external.on_pub(session, subject, body);
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_frame, try_decode_frame, Frame, Message};
    use crate::types::NetError;
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    struct Echo;

    impl Handler for Echo {
        fn on_req(&self, _session: Arc<Session>, body: Bytes) -> BoxFuture<'static, Reply> {
            Box::pin(async move { Reply::ok(body) })
        }
    }

    async fn running() -> Server {
        let server = Server::bind(ServerConfig::new("127.0.0.1:0"), Arc::new(Echo))
            .await
            .unwrap();
        let runner = server.clone();
        tokio::spawn(async move { runner.run().await });
        server
    }

    async fn wait_for_sessions(server: &Server, count: usize) {
        timeout(Duration::from_secs(5), async {
            while server.session_count() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_bind_reports_address() {
        let server = Server::bind(ServerConfig::new("127.0.0.1:0"), Arc::new(Echo))
            .await
            .unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_raw_request_is_echoed() {
        let server = running().await;
        let mut peer = TcpStream::connect(server.local_addr()).await.unwrap();

        let wire = encode_frame(&Frame::new(Message::Request {
            serial: 77,
            body: Bytes::from_static(b"hello"),
        }))
        .unwrap();
        peer.write_all(&wire).await.unwrap();

        let mut buf = BytesMut::new();
        let frame = timeout(Duration::from_secs(5), async {
            loop {
                if let Some(frame) = try_decode_frame(&mut buf).unwrap() {
                    return frame;
                }
                assert!(peer.read_buf(&mut buf).await.unwrap() > 0);
            }
        })
        .await
        .unwrap();

        assert_eq!(
            frame.message,
            Message::Response {
                serial: 77,
                en: NetError::Success.code(),
                body: Bytes::from_static(b"hello"),
            }
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_registry_tracks_closes() {
        let server = running().await;
        let a = TcpStream::connect(server.local_addr()).await.unwrap();
        let b = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for_sessions(&server, 2).await;

        let mut ids: Vec<_> = server.sessions().iter().map(|s| s.id()).collect();
        ids.sort();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert!(ids.iter().all(|id| *id != CLIENT_SESSION_ID));

        drop(a);
        wait_for_sessions(&server, 1).await;
        drop(b);
        wait_for_sessions(&server, 0).await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_sessions_and_run_returns() {
        let server = Server::bind(ServerConfig::new("127.0.0.1:0"), Arc::new(Echo))
            .await
            .unwrap();
        let runner = server.clone();
        let run = tokio::spawn(async move { runner.run().await });

        let mut peer = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for_sessions(&server, 1).await;

        server.stop().await;
        server.stop().await;

        timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();
        assert_eq!(server.session_count(), 0);
        assert!(server.is_stopped());

        let mut buf = [0u8; 4];
        let n = timeout(Duration::from_secs(5), peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        assert!(matches!(server.run().await, Err(MsgError::NodeStopped)));
    }
}
