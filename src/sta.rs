//! Actor serializer.
//!
//! A single task that owns every session's correlation table and request
//! serial counter, and applies cross-task events to them one at a time:
//!
//! ```text
//! read loops ──────► events (capacity 1) ─────┐
//! request handlers ► completions (bounded) ───┼─► Sta task ─► handler / waiters / writes
//! requesters ──────► register / cancel ───────┘
//! ```
//!
//! Read loops feel backpressure when the actor is busy; finished request
//! handlers are absorbed by the larger completion queue.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::handler::Handler;
use crate::session::Session;
use crate::types::{MsgError, NetError, Reply, SessionId};

/// Identifies the request a finished handler is answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseToken {
    pub session_id: SessionId,
    pub serial: u16,
    epoch: u64,
}

type Registered = Result<(u16, oneshot::Receiver<Reply>), NetError>;

enum Event {
    Attach(Arc<Session>),
    Detach {
        session_id: SessionId,
        epoch: u64,
    },
    Register {
        session_id: SessionId,
        epoch: u64,
        reply: oneshot::Sender<Registered>,
    },
    Cancel {
        session_id: SessionId,
        epoch: u64,
        serial: u16,
    },
    Push {
        session_id: SessionId,
        epoch: u64,
        body: Bytes,
    },
    Request {
        session_id: SessionId,
        epoch: u64,
        serial: u16,
        body: Bytes,
    },
    Response {
        session_id: SessionId,
        epoch: u64,
        serial: u16,
        reply: Reply,
    },
}

struct Completion {
    token: ResponseToken,
    reply: Reply,
}

/// Sending side of the completion queue.
#[derive(Clone)]
struct Completions(mpsc::Sender<Completion>);

impl Completions {
    /// Queue the reply for the request identified by `token`.
    async fn submit(&self, token: ResponseToken, reply: Reply) -> Result<(), MsgError> {
        self.0
            .send(Completion { token, reply })
            .await
            .map_err(|_| MsgError::ActorStopped)
    }
}

/// Correlation state of one attached session.
struct Slot {
    session: Arc<Session>,
    serial: u16,
    pending: HashMap<u16, oneshot::Sender<Reply>>,
}

impl Slot {
    fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            serial: 0,
            pending: HashMap::new(),
        }
    }

    fn register(&mut self) -> Registered {
        self.serial = self.serial.wrapping_add(1);
        if self.pending.contains_key(&self.serial) {
            return Err(NetError::SerialConflict);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(self.serial, tx);
        Ok((self.serial, rx))
    }

    fn fail_pending(&mut self) {
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(Reply::error(NetError::SessionClosed));
        }
    }
}

/// The actor itself. Build with [`Sta::new`], run with [`Sta::start`].
pub struct Sta {
    handler: Arc<dyn Handler>,
    events: mpsc::Receiver<Event>,
    completions: mpsc::Receiver<Completion>,
    completion_tx: Completions,
    shutdown: watch::Receiver<bool>,
    slots: HashMap<SessionId, Slot>,
}

/// Cloneable handle used to feed events to a running [`Sta`].
#[derive(Clone)]
pub struct StaHandle {
    events: mpsc::Sender<Event>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Sta {
    /// Create an actor delivering pushes and requests to `handler`.
    /// `response_capacity` bounds the queue of finished request handlers.
    pub fn new(handler: Arc<dyn Handler>, response_capacity: usize) -> (Sta, StaHandle) {
        let (event_tx, events) = mpsc::channel(1);
        let (completion_tx, completions) = mpsc::channel(response_capacity.max(1));
        let (shutdown_tx, shutdown) = watch::channel(false);

        let sta = Sta {
            handler,
            events,
            completions,
            completion_tx: Completions(completion_tx),
            shutdown,
            slots: HashMap::new(),
        };
        let handle = StaHandle {
            events: event_tx,
            shutdown: Arc::new(shutdown_tx),
        };
        (sta, handle)
    }

    /// Spawn the actor task. Runs until [`StaHandle::stop`] is called or
    /// every handle is dropped.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        debug!("STA started.");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                Some(event) = self.events.recv() => self.on_event(event),
                Some(done) = self.completions.recv() => self.on_completion(done),
            }
        }

        for (_, mut slot) in self.slots.drain() {
            slot.fail_pending();
        }
        info!("STA stopped.");
    }

    fn slot(&mut self, session_id: SessionId, epoch: u64) -> Option<&mut Slot> {
        self.slots
            .get_mut(&session_id)
            .filter(|slot| slot.session.epoch() == epoch)
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Attach(session) => {
                let id = session.id();
                if let Some(mut stale) = self.slots.insert(id, Slot::new(session)) {
                    stale.fail_pending();
                }
            }
            Event::Detach { session_id, epoch } => {
                if self.slot(session_id, epoch).is_some() {
                    if let Some(mut slot) = self.slots.remove(&session_id) {
                        slot.fail_pending();
                    }
                }
            }
            Event::Register {
                session_id,
                epoch,
                reply,
            } => {
                let Some(slot) = self.slot(session_id, epoch) else {
                    let _ = reply.send(Err(NetError::SessionClosed));
                    return;
                };
                if let Err(Ok((serial, _))) = reply.send(slot.register()) {
                    // requester went away before learning its serial
                    slot.pending.remove(&serial);
                }
            }
            Event::Cancel {
                session_id,
                epoch,
                serial,
            } => {
                if let Some(slot) = self.slot(session_id, epoch) {
                    slot.pending.remove(&serial);
                }
            }
            Event::Push {
                session_id,
                epoch,
                body,
            } => {
                let Some(slot) = self.slot(session_id, epoch) else {
                    debug!("conn [{}] gone, push dropped", session_id);
                    return;
                };
                let session = slot.session.clone();
                let handler = &self.handler;
                match std::panic::catch_unwind(AssertUnwindSafe(|| {
                    handler.on_push(&session, body)
                })) {
                    Ok(0) => {}
                    Ok(code) => warn!("conn [{}] onPush : {}", session_id, code),
                    Err(panic) => error!(
                        "conn [{}] push handler panicked: {}",
                        session_id,
                        panic_message(&*panic)
                    ),
                }
            }
            Event::Request {
                session_id,
                epoch,
                serial,
                body,
            } => {
                let Some(slot) = self.slot(session_id, epoch) else {
                    debug!("conn [{}] gone, request {} dropped", session_id, serial);
                    return;
                };
                let token = ResponseToken {
                    session_id,
                    serial,
                    epoch,
                };
                let session = slot.session.clone();
                self.spawn_request(session, token, body);
            }
            Event::Response {
                session_id,
                epoch,
                serial,
                reply,
            } => {
                let Some(slot) = self.slot(session_id, epoch) else {
                    return;
                };
                match slot.pending.remove(&serial) {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => warn!("conn [{}] {} not exist in req pool.", session_id, serial),
                }
            }
        }
    }

    /// Run the request handler on its own task. Whatever happens to it, a
    /// completion carrying `token` is queued exactly once.
    fn spawn_request(&self, session: Arc<Session>, token: ResponseToken, body: Bytes) {
        let handler = self.handler.clone();
        let completions = self.completion_tx.clone();

        tokio::spawn(async move {
            let call = async move { handler.on_req(session, body).await };
            let reply = match AssertUnwindSafe(call).catch_unwind().await {
                Ok(reply) => reply,
                Err(panic) => {
                    error!(
                        "conn [{}] request {} handler panicked: {}",
                        token.session_id,
                        token.serial,
                        panic_message(&*panic)
                    );
                    Reply::error(NetError::ExceptionCatched)
                }
            };

            if completions.submit(token, reply).await.is_err() {
                debug!(
                    "STA stopped, response {} for conn [{}] dropped",
                    token.serial, token.session_id
                );
            }
        });
    }

    fn on_completion(&mut self, done: Completion) {
        let Completion { token, reply } = done;
        let Some(slot) = self.slot(token.session_id, token.epoch) else {
            debug!(
                "conn [{}] gone, response {} dropped",
                token.session_id, token.serial
            );
            return;
        };

        let session = slot.session.clone();
        tokio::spawn(async move {
            if let Err(e) = session.respond(token.serial, reply).await {
                debug!(
                    "conn [{}] response {} not sent: {}",
                    token.session_id, token.serial, e
                );
            }
        });
    }
}

impl StaHandle {
    async fn send(&self, event: Event) -> Result<(), MsgError> {
        if self.is_stopped() {
            return Err(MsgError::ActorStopped);
        }
        self.events
            .send(event)
            .await
            .map_err(|_| MsgError::ActorStopped)
    }

    pub(crate) async fn attach(&self, session: &Arc<Session>) -> Result<(), MsgError> {
        self.send(Event::Attach(session.clone())).await
    }

    pub(crate) async fn detach(&self, session: &Session) -> Result<(), MsgError> {
        self.send(Event::Detach {
            session_id: session.id(),
            epoch: session.epoch(),
        })
        .await
    }

    /// Allocate the next serial for `session` and a waiter for its response.
    pub(crate) async fn register(&self, session: &Session) -> Registered {
        let (tx, rx) = oneshot::channel();
        let event = Event::Register {
            session_id: session.id(),
            epoch: session.epoch(),
            reply: tx,
        };
        if self.send(event).await.is_err() {
            return Err(NetError::SessionClosed);
        }
        rx.await.unwrap_or(Err(NetError::SessionClosed))
    }

    pub(crate) async fn cancel(&self, session: &Session, serial: u16) {
        let event = Event::Cancel {
            session_id: session.id(),
            epoch: session.epoch(),
            serial,
        };
        if let Err(e) = self.send(event).await {
            debug!("conn [{}] cancel {}: {}", session.id(), serial, e);
        }
    }

    pub(crate) async fn push(&self, session: &Session, body: Bytes) -> Result<(), MsgError> {
        self.send(Event::Push {
            session_id: session.id(),
            epoch: session.epoch(),
            body,
        })
        .await
    }

    pub(crate) async fn request(
        &self,
        session: &Session,
        serial: u16,
        body: Bytes,
    ) -> Result<(), MsgError> {
        self.send(Event::Request {
            session_id: session.id(),
            epoch: session.epoch(),
            serial,
            body,
        })
        .await
    }

    pub(crate) async fn response(
        &self,
        session: &Session,
        serial: u16,
        reply: Reply,
    ) -> Result<(), MsgError> {
        self.send(Event::Response {
            session_id: session.id(),
            epoch: session.epoch(),
            serial,
            reply,
        })
        .await
    }

    /// Stop the actor. Pending requests fail with `SessionClosed`. Calling
    /// this more than once is harmless.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
