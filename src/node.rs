//! Machinery shared by clients and servers: I/O counters, the periodic
//! throughput log and the keepalive sweep.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::session::Session;

/// Frames read and written since the last [`IoCounters::take`].
#[derive(Debug, Default)]
pub struct IoCounters {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl IoCounters {
    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns `(reads, writes)` and resets both to zero.
    pub fn take(&self) -> (u64, u64) {
        (
            self.reads.swap(0, Ordering::Relaxed),
            self.writes.swap(0, Ordering::Relaxed),
        )
    }
}

/// What the keepalive sweep does to idle sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlivePolicy {
    /// Idle time after which a session is pinged, once per idle period
    pub idle_soft: Duration,
    /// Idle time after which a session is closed
    pub idle_hard: Duration,
    /// `force` flag passed to [`Session::close`] when reaping
    pub reap_forced: bool,
}

impl KeepAlivePolicy {
    pub fn from_config(config: &NodeConfig, reap_forced: bool) -> Self {
        Self {
            idle_soft: config.idle_soft,
            idle_hard: config.idle_hard,
            reap_forced,
        }
    }
}

/// Anything that can list the sessions a keepalive sweep should visit.
pub trait SessionSource: Send + Sync + 'static {
    fn sessions(&self) -> Vec<Arc<Session>>;
}

/// Outcome of one keepalive sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub reaped: usize,
}

/// Visit `sessions` as of `now`: close those idle past `idle_hard`, ping
/// those idle past `idle_soft` that have not been pinged since their last
/// activity.
pub async fn sweep_idle(
    sessions: &[Arc<Session>],
    policy: &KeepAlivePolicy,
    now: Instant,
) -> SweepReport {
    let mut report = SweepReport::default();

    for session in sessions.iter().filter(|s| !s.is_closed()) {
        let idle = session.idle_at(now);
        if idle >= policy.idle_hard {
            warn!("conn [{}] idle for {:?}, closing", session.id(), idle);
            session.close(policy.reap_forced).await;
            report.reaped += 1;
        } else if idle >= policy.idle_soft && session.mark_nudged() {
            debug!("conn [{}] idle for {:?}, pinging", session.id(), idle);
            session.ping().await;
            report.pinged += 1;
        }
    }

    report
}

/// Background tasks of one client or server.
pub struct Node {
    addr: String,
    config: NodeConfig,
    counters: Arc<IoCounters>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(addr: impl Into<String>, config: NodeConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            addr: addr.into(),
            config,
            counters: Arc::new(IoCounters::default()),
            shutdown,
            started: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn counters(&self) -> &Arc<IoCounters> {
        &self.counters
    }

    /// Spawn the throughput logger and the keepalive sweep. Only the first
    /// call does anything.
    pub fn start(&self, source: Weak<dyn SessionSource>, policy: KeepAlivePolicy) {
        if self.is_stopped() || self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let counter = tokio::spawn(count_io(
            self.addr.clone(),
            self.counters.clone(),
            self.config.counter_window,
            self.shutdown.subscribe(),
        ));
        let keepalive = tokio::spawn(keep_alive(
            source,
            policy,
            self.config.keepalive_interval,
            self.shutdown.subscribe(),
        ));

        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.push(counter);
        tasks.push(keepalive);
    }

    /// Stop the background tasks and wait for them. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("node task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }
}

async fn count_io(
    addr: String,
    counters: Arc<IoCounters>,
    window: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + window, window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let secs = window.as_secs_f64().max(f64::EPSILON);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let (reads, writes) = counters.take();
                info!(
                    "[{}] Read : {:.0}/s\tWrite : {:.0}/s",
                    addr,
                    reads as f64 / secs,
                    writes as f64 / secs
                );
            }
        }
    }
}

async fn keep_alive(
    source: Weak<dyn SessionSource>,
    policy: KeepAlivePolicy,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let Some(source) = source.upgrade() else {
                    break;
                };
                let sessions = source.sessions();
                drop(source);

                let report = sweep_idle(&sessions, &policy, Instant::now()).await;
                if report != SweepReport::default() {
                    debug!("keepalive: {} pinged, {} reaped", report.pinged, report.reaped);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{try_decode_frame, Message};
    use crate::handler::Handler;
    use crate::session::testing::session_pair;
    use crate::sta::Sta;
    use bytes::BytesMut;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    struct NoSessions;

    impl SessionSource for NoSessions {
        fn sessions(&self) -> Vec<Arc<Session>> {
            Vec::new()
        }
    }

    #[derive(Default)]
    struct Closes {
        count: AtomicUsize,
        forced: AtomicBool,
    }

    impl Handler for Closes {
        fn on_close(&self, _session: &Arc<Session>, forced: bool) {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.forced.store(forced, Ordering::SeqCst);
        }
    }

    fn policy() -> KeepAlivePolicy {
        KeepAlivePolicy {
            idle_soft: Duration::from_secs(20),
            idle_hard: Duration::from_secs(60),
            reap_forced: true,
        }
    }

    #[test]
    fn test_counters_take_resets() {
        let counters = IoCounters::default();
        counters.record_read();
        counters.record_read();
        counters.record_write();

        assert_eq!(counters.take(), (2, 1));
        assert_eq!(counters.take(), (0, 0));
    }

    #[test]
    fn test_policy_from_config() {
        let policy = KeepAlivePolicy::from_config(&NodeConfig::default(), false);
        assert_eq!(policy.idle_soft, Duration::from_secs(20));
        assert_eq!(policy.idle_hard, Duration::from_secs(60));
        assert!(!policy.reap_forced);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let node = Node::new("127.0.0.1:0", NodeConfig::default());
        let source: Weak<dyn SessionSource> = Weak::<NoSessions>::new();
        node.start(source.clone(), policy());
        node.start(source, policy());
        assert_eq!(node.tasks.lock().unwrap().len(), 2);

        timeout(Duration::from_secs(5), node.stop()).await.unwrap();
        timeout(Duration::from_secs(5), node.stop()).await.unwrap();
        assert!(node.is_stopped());
        assert!(node.tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_pings_once_then_reaps() {
        let closes = Arc::new(Closes::default());
        let (sta, handle) = Sta::new(closes.clone(), 8);
        sta.start();
        let (session, mut peer) = session_pair(1, closes.clone(), handle).await;
        let sessions = vec![session.clone()];
        let start = session.last_active();

        let report = sweep_idle(&sessions, &policy(), start + Duration::from_secs(5)).await;
        assert_eq!(report, SweepReport::default());

        let report = sweep_idle(&sessions, &policy(), start + Duration::from_secs(25)).await;
        assert_eq!(report, SweepReport { pinged: 1, reaped: 0 });

        // still idle, already nudged
        let report = sweep_idle(&sessions, &policy(), start + Duration::from_secs(40)).await;
        assert_eq!(report, SweepReport::default());

        let mut buf = BytesMut::new();
        let frame = loop {
            if let Some(frame) = try_decode_frame(&mut buf).unwrap() {
                break frame;
            }
            assert!(peer.read_buf(&mut buf).await.unwrap() > 0);
        };
        assert!(matches!(frame.message, Message::Ping { .. }));

        let report = sweep_idle(&sessions, &policy(), start + Duration::from_secs(65)).await;
        assert_eq!(report, SweepReport { pinged: 0, reaped: 1 });
        assert!(session.is_closed());
        assert_eq!(closes.count.load(Ordering::SeqCst), 1);
        assert!(closes.forced.load(Ordering::SeqCst));

        // closed sessions are skipped
        let report = sweep_idle(&sessions, &policy(), start + Duration::from_secs(120)).await;
        assert_eq!(report, SweepReport::default());
        assert_eq!(closes.count.load(Ordering::SeqCst), 1);
    }
}
