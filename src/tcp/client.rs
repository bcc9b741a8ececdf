use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ClientConfig;
use crate::handler::Handler;
use crate::node::{IoCounters, KeepAlivePolicy, Node, SessionSource};
use crate::session::Session;
use crate::sta::{Sta, StaHandle};
use crate::types::{MsgError, NetError, Reply, CLIENT_SESSION_ID};

/// Connection state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

/// TCP client holding at most one session at a time.
///
/// With `auto_retry` enabled the client keeps dialing until the server
/// answers, and dials again whenever the session ends without being
/// closed on purpose.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    delegate: Arc<dyn Handler>,
    sta: StaHandle,
    actor: StdMutex<Option<Sta>>,
    sta_task: StdMutex<Option<JoinHandle<()>>>,
    node: Node,
    session: StdMutex<Option<Arc<Session>>>,
    stopped: AtomicBool,
    state: watch::Sender<ClientState>,
}

/// Sits between the sessions and the application handler so the client
/// notices its session closing.
struct ClientDelegate {
    inner: Weak<ClientInner>,
    external: Arc<dyn Handler>,
}

impl Client {
    /// Create a client. Nothing is dialed until [`Client::start`].
    pub fn new(config: ClientConfig, handler: Arc<dyn Handler>) -> Result<Self, MsgError> {
        config.validate()?;

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let delegate: Arc<dyn Handler> = Arc::new(ClientDelegate {
                inner: weak.clone(),
                external: handler,
            });
            let (actor, sta) = Sta::new(delegate.clone(), config.node.response_queue_capacity);
            let node = Node::new(config.addr.clone(), config.node.clone());
            let (state, _) = watch::channel(ClientState::Disconnected);

            ClientInner {
                config,
                delegate,
                sta,
                actor: StdMutex::new(Some(actor)),
                sta_task: StdMutex::new(None),
                node,
                session: StdMutex::new(None),
                stopped: AtomicBool::new(false),
                state,
            }
        });

        Ok(Self { inner })
    }

    /// Dial the server. With `auto_retry` this only returns once connected
    /// or stopped; without it a failed dial is returned as an error.
    /// Returns the live session if already connected.
    pub async fn start(&self) -> Result<Arc<Session>, MsgError> {
        if let Some(session) = self.session() {
            return Ok(session);
        }
        self.inner.connect().await
    }

    /// Close the session for good. No reconnect follows. Idempotent.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let session = {
            let mut slot = lock(&inner.session);
            if inner.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
            slot.take()
        };
        inner.state.send_replace(ClientState::Stopped);

        if let Some(session) = session {
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
        info!("client for {} stopped.", inner.config.addr);
    }

    /// Send a request on the current session and wait for the response.
    pub async fn request(&self, data: impl Into<Bytes>) -> Reply {
        match self.session() {
            Some(session) => session.request(data).await,
            None => Reply::error(NetError::SessionClosed),
        }
    }

    pub async fn push(&self, data: impl Into<Bytes>) -> NetError {
        match self.session() {
            Some(session) => session.push(data).await,
            None => NetError::SessionClosed,
        }
    }

    /// The live session, if connected.
    pub fn session(&self) -> Option<Arc<Session>> {
        lock(&self.inner.session)
            .as_ref()
            .filter(|s| !s.is_closed())
            .cloned()
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn counters(&self) -> &Arc<IoCounters> {
        self.inner.node.counters()
    }
}

impl ClientInner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Move to `next` unless the client was stopped.
    fn set_state(&self, next: ClientState) {
        self.state.send_if_modified(|current| {
            if *current == ClientState::Stopped || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Start the actor and the node tasks the first time through.
    fn ensure_running(self: &Arc<Self>) {
        if let Some(actor) = lock(&self.actor).take() {
            *lock(&self.sta_task) = Some(actor.start());
        }

        let weak: Weak<ClientInner> = Arc::downgrade(self);
        let source: Weak<dyn SessionSource> = weak;
        self.node
            .start(source, KeepAlivePolicy::from_config(&self.config.node, false));
    }

    async fn connect(self: &Arc<Self>) -> Result<Arc<Session>, MsgError> {
        loop {
            if self.is_stopped() {
                return Err(MsgError::NodeStopped);
            }
            self.set_state(ClientState::Connecting);

            match TcpStream::connect(&self.config.addr).await {
                Ok(stream) => return self.attach(stream).await,
                Err(e) => {
                    error!("connect failed: {} ({})", self.config.addr, e);
                    if !self.config.auto_retry {
                        self.set_state(ClientState::Disconnected);
                        return Err(e.into());
                    }
                }
            }

            info!(
                "reconnecting {} in {:?} ...",
                self.config.addr, self.config.retry_interval
            );
            if !self.pause().await {
                return Err(MsgError::NodeStopped);
            }
        }
    }

    async fn attach(self: &Arc<Self>, stream: TcpStream) -> Result<Arc<Session>, MsgError> {
        self.ensure_running();

        let (session, reader) = Session::new(
            CLIENT_SESSION_ID,
            stream,
            self.delegate.clone(),
            self.sta.clone(),
            self.node.counters().clone(),
        )?;

        {
            let mut slot = lock(&self.session);
            if self.is_stopped() {
                return Err(MsgError::NodeStopped);
            }
            *slot = Some(session.clone());
        }
        self.set_state(ClientState::Connected);

        if let Err(e) = session.start(reader).await {
            error!("session start failed: {}", e);
            self.release(&session);
            self.set_state(ClientState::Disconnected);
            return Err(e);
        }
        Ok(session)
    }

    /// Forget `session` if it is still the current one.
    fn release(&self, session: &Arc<Session>) {
        let mut slot = lock(&self.session);
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, session)) {
            *slot = None;
        }
    }

    /// Sleep for the retry interval. Returns false if the client was stopped
    /// meanwhile.
    async fn pause(&self) -> bool {
        let mut state = self.state.subscribe();
        let sleep = tokio::time::sleep(self.config.retry_interval);
        tokio::pin!(sleep);

        loop {
            let stopped = *state.borrow_and_update() == ClientState::Stopped;
            if stopped {
                return false;
            }
            tokio::select! {
                _ = &mut sleep => return !self.is_stopped(),
                changed = state.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    async fn reconnect(self: Arc<Self>) {
        if !self.pause().await {
            return;
        }
        if let Err(e) = self.connect().await {
            warn!("reconnect to {} abandoned: {}", self.config.addr, e);
        }
    }
}

impl SessionSource for ClientInner {
    fn sessions(&self) -> Vec<Arc<Session>> {
        lock(&self.session).iter().cloned().collect()
    }
}

impl Handler for ClientDelegate {
    fn on_open(&self, session: &Arc<Session>) {
        self.external.on_open(session);
    }

    fn on_close(&self, session: &Arc<Session>, forced: bool) {
        self.external.on_close(session, forced);

        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner.release(session);
        if inner.is_stopped() {
            return;
        }
        inner.set_state(ClientState::Disconnected);

        if !forced && inner.config.auto_retry {
            tokio::spawn(inner.reconnect());
        }
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
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    struct Quiet;
    impl Handler for Quiet {}

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = ClientConfig::new("");
        assert!(matches!(
            Client::new(config, Arc::new(Quiet)),
            Err(MsgError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_failure_without_retry() {
        // grab a free port, then release it so nothing listens there
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClientConfig::new(addr.to_string()).with_auto_retry(false);
        let client = Client::new(config, Arc::new(Quiet)).unwrap();

        let result = timeout(Duration::from_secs(5), client.start()).await.unwrap();
        assert!(matches!(result, Err(MsgError::Io(_))));
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.session().is_none());
    }

    #[tokio::test]
    async fn test_stop_interrupts_retry_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClientConfig::new(addr.to_string())
            .with_retry_interval(Duration::from_millis(50));
        let client = Client::new(config, Arc::new(Quiet)).unwrap();

        let dialing = {
            let client = client.clone();
            tokio::spawn(async move { client.start().await })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        client.stop().await;

        let result = timeout(Duration::from_secs(5), dialing).await.unwrap().unwrap();
        assert!(matches!(result, Err(MsgError::NodeStopped)));
        assert_eq!(client.state(), ClientState::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_reuses_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ClientConfig::new(addr.to_string()).with_auto_retry(false);
        let client = Client::new(config, Arc::new(Quiet)).unwrap();

        let first = timeout(Duration::from_secs(5), client.start()).await.unwrap().unwrap();
        let _accepted = listener.accept().await.unwrap();

        let second = timeout(Duration::from_secs(5), client.start()).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(timeout(Duration::from_millis(200), listener.accept()).await.is_err());

        client.stop().await;
    }

    #[tokio::test]
    async fn test_requests_without_session() {
        let client = Client::new(ClientConfig::new("127.0.0.1:1"), Arc::new(Quiet)).unwrap();
        assert_eq!(
            client.request(&b"hi"[..]).await.net_error(),
            Some(NetError::SessionClosed)
        );
        assert_eq!(client.push(&b"hi"[..]).await, NetError::SessionClosed);

        client.stop().await;
        client.stop().await;
        assert!(client.is_stopped());
    }
}
