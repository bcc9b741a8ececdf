//! Application handler capability set.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::debug;

use crate::session::Session;
use crate::types::{NetError, Reply};

/// Callbacks the embedding application implements.
///
/// Every method has a default, so an application only overrides what it
/// uses. A handler is shared by every session of a client or server.
///
/// # Example
///
/// ```ignore
/// use futures::future::BoxFuture;
/// use tcpmsg::{Handler, Reply, Session};
///
/// struct Echo;
///
/// impl Handler for Echo {
///     fn on_req(&self, _session: Arc<Session>, body: Bytes) -> BoxFuture<'static, Reply> {
///         Box::pin(async move { Reply::ok(body) })
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Called once per session, before its read loop starts.
    fn on_open(&self, _session: &Arc<Session>) {}

    /// Called once per session. `forced` is true for explicit shutdowns and
    /// keepalive reaping, false when the peer or an error ended it.
    fn on_close(&self, _session: &Arc<Session>, _forced: bool) {}

    /// Handle a request. Runs on its own task; the returned reply is sent
    /// back with the request's serial.
    fn on_req(&self, _session: Arc<Session>, _body: Bytes) -> BoxFuture<'static, Reply> {
        Box::pin(async { Reply::error(NetError::NoHandler) })
    }

    /// Handle a push. A non-zero return is logged.
    fn on_push(&self, _session: &Arc<Session>, _body: Bytes) -> i16 {
        NetError::Success.code()
    }

    fn on_sub(&self, session: &Arc<Session>, subject: &str) {
        debug!("conn [{}] sub {:?} ignored", session.id(), subject);
    }

    fn on_unsub(&self, session: &Arc<Session>) {
        debug!("conn [{}] unsub ignored", session.id());
    }

    fn on_pub(&self, session: &Arc<Session>, subject: &str, body: Bytes) {
        debug!(
            "conn [{}] pub {:?} ({} bytes) ignored",
            session.id(),
            subject,
            body.len()
        );
    }
}
