//! Wake-up notifications for idle workers and completion datagrams for
//! submitters.
//!
//! Listeners register a UDP endpoint with a time-to-live. Whenever the queue
//! holds dispatchable work, the dispatcher sends `NCID <queue>` to every live
//! listener, at most once per notify interval. In-process waiters (WaitGet)
//! are woken through a [`tokio::sync::Notify`] instead.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, OnceCell};

use crate::error::Result;
use crate::job::{JobId, SubmitterNotify};
use crate::registry::QueueRegistry;

/// Listeners are re-checked for pending work after this many sends.
const PENDING_RECHECK_EVERY: usize = 10;

/// Datagram transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, host: &str, port: u16, message: &str) -> Result<()>;
}

/// Type alias for a dynamic notifier.
pub type DynNotifier = Arc<dyn Notifier>;

/// Sends datagrams from an ephemeral UDP socket bound on first use.
#[derive(Default)]
pub struct UdpNotifier {
    socket: OnceCell<UdpSocket>,
}

impl UdpNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for UdpNotifier {
    async fn send(&self, host: &str, port: u16, message: &str) -> Result<()> {
        let socket = self
            .socket
            .get_or_try_init(|| UdpSocket::bind("0.0.0.0:0"))
            .await?;
        socket.send_to(message.as_bytes(), (host, port)).await?;
        Ok(())
    }
}

/// One datagram captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub host: String,
    pub port: u16,
    pub message: String,
}

/// Notifier that keeps every datagram in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Datagram>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Datagram> {
        self.sent.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.sent.lock().iter().map(|d| d.message.clone()).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, host: &str, port: u16, message: &str) -> Result<()> {
        self.sent.lock().push(Datagram {
            host: host.to_string(),
            port,
            message: message.to_string(),
        });
        Ok(())
    }
}

/// A registered wake-up endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listener {
    pub host: String,
    pub port: u16,
    pub auth: String,
    pub last_contact: i64,
    /// Seconds after `last_contact` the registration stays valid.
    pub ttl: u64,
}

impl Listener {
    pub fn is_expired(&self, now: i64) -> bool {
        self.last_contact + (self.ttl as i64) < now
    }
}

/// Per-queue listener list and notification rate limiting.
pub struct NotificationDispatcher {
    queue: String,
    notifier: DynNotifier,
    listeners: Mutex<BTreeMap<(String, u16), Listener>>,
    last_burst: AtomicI64,
    wake: Notify,
}

impl NotificationDispatcher {
    pub fn new(queue: impl Into<String>, notifier: DynNotifier) -> Self {
        Self {
            queue: queue.into(),
            notifier,
            listeners: Mutex::new(BTreeMap::new()),
            last_burst: AtomicI64::new(0),
            wake: Notify::new(),
        }
    }

    // ========== Listeners ==========

    /// Register or refresh a listener. A zero ttl registers nothing.
    pub fn register(&self, host: &str, port: u16, ttl: u64, auth: &str, now: i64) -> bool {
        if ttl == 0 || port == 0 {
            return false;
        }
        self.listeners.lock().insert(
            (host.to_string(), port),
            Listener {
                host: host.to_string(),
                port,
                auth: auth.to_string(),
                last_contact: now,
                ttl,
            },
        );
        true
    }

    pub fn unregister(&self, host: &str, port: u16) -> bool {
        self.listeners
            .lock()
            .remove(&(host.to_string(), port))
            .is_some()
    }

    pub fn listeners(&self) -> Vec<Listener> {
        self.listeners.lock().values().cloned().collect()
    }

    /// Drop listeners whose ttl lapsed. Returns how many were dropped.
    pub fn prune(&self, now: i64) -> usize {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|_, l| !l.is_expired(now));
        before - listeners.len()
    }

    // ========== In-process waiters ==========

    /// Future completing on the next [`wake_waiters`](Self::wake_waiters).
    pub fn notified(&self) -> Notified<'_> {
        self.wake.notified()
    }

    pub fn wake_waiters(&self) {
        self.wake.notify_waiters();
    }

    // ========== Datagrams ==========

    /// Send `NCID <queue>` to every live listener while work is pending.
    ///
    /// Bursts are at least `interval` seconds apart; a zero interval disables
    /// the limit. Returns the number of datagrams sent.
    pub async fn notify_if_pending<F>(&self, now: i64, interval: u64, has_pending: F) -> usize
    where
        F: Fn() -> bool,
    {
        let last = self.last_burst.load(Ordering::SeqCst);
        if interval > 0 && last != 0 && now - last < interval as i64 {
            return 0;
        }
        self.prune(now);
        if !has_pending() {
            return 0;
        }
        let targets = self.listeners();
        if targets.is_empty() {
            return 0;
        }
        self.last_burst.store(now, Ordering::SeqCst);

        let message = format!("NCID {}", self.queue);
        let mut sent = 0;
        for listener in targets {
            if sent > 0 && sent % PENDING_RECHECK_EVERY == 0 && !has_pending() {
                break;
            }
            match self
                .notifier
                .send(&listener.host, listener.port, &message)
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!(
                    queue = %self.queue,
                    host = %listener.host,
                    port = listener.port,
                    error = %e,
                    "Failed to notify listener"
                ),
            }
        }
        tracing::debug!(queue = %self.queue, sent = sent, "Notified listeners");
        sent
    }

    /// Tell a submitter that its job finished.
    pub async fn notify_submitter(&self, target: &SubmitterNotify, id: JobId) {
        let message = format!("JNTF {}", id);
        if let Err(e) = self.notifier.send(&target.host, target.port, &message).await {
            tracing::warn!(
                queue = %self.queue,
                job_id = %id,
                host = %target.host,
                error = %e,
                "Failed to notify submitter"
            );
        }
    }
}

/// Periodically sends listener notifications for every queue.
pub struct NotificationService {
    registry: Arc<QueueRegistry>,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl NotificationService {
    pub fn new(registry: Arc<QueueRegistry>, interval: Duration, running: Arc<AtomicBool>) -> Self {
        Self {
            registry,
            interval,
            running,
        }
    }

    /// Run the notification loop.
    pub async fn run(&self) -> Result<()> {
        tracing::debug!("Notification service started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            for queue in self.registry.queues() {
                queue.notify_listeners().await;
            }
        }

        tracing::debug!("Notification service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> (NotificationDispatcher, Arc<RecordingNotifier>) {
        let recorder = Arc::new(RecordingNotifier::new());
        (NotificationDispatcher::new("batch", recorder.clone()), recorder)
    }

    #[test]
    fn test_register_refresh_and_unregister() {
        let (d, _) = dispatcher();
        assert!(!d.register("w1", 9000, 0, "", 100));
        assert!(d.listeners().is_empty());

        assert!(d.register("w1", 9000, 30, "a", 100));
        assert!(d.register("w1", 9000, 60, "b", 120));
        let listeners = d.listeners();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].last_contact, 120);
        assert_eq!(listeners[0].auth, "b");

        assert!(d.unregister("w1", 9000));
        assert!(!d.unregister("w1", 9000));
    }

    #[test]
    fn test_prune_expired() {
        let (d, _) = dispatcher();
        d.register("w1", 1, 10, "", 100);
        d.register("w2", 1, 100, "", 100);
        assert_eq!(d.prune(110), 0);
        assert_eq!(d.prune(111), 1);
        assert_eq!(d.listeners()[0].host, "w2");
    }

    #[tokio::test]
    async fn test_burst_is_rate_limited() {
        let (d, recorder) = dispatcher();
        d.register("w1", 9000, 3600, "", 100);
        d.register("w2", 9001, 3600, "", 100);

        assert_eq!(d.notify_if_pending(100, 7, || true).await, 2);
        assert_eq!(d.notify_if_pending(103, 7, || true).await, 0);
        assert_eq!(d.notify_if_pending(107, 7, || true).await, 2);
        assert_eq!(recorder.messages()[0], "NCID batch");
        assert_eq!(recorder.sent().len(), 4);
    }

    #[tokio::test]
    async fn test_nothing_sent_without_pending_work() {
        let (d, recorder) = dispatcher();
        d.register("w1", 9000, 3600, "", 100);
        assert_eq!(d.notify_if_pending(100, 0, || false).await, 0);
        assert!(recorder.sent().is_empty());
    }

    #[tokio::test]
    async fn test_burst_stops_when_work_drains() {
        let (d, recorder) = dispatcher();
        for port in 1..=25 {
            d.register("w", port, 3600, "", 100);
        }
        let calls = std::sync::atomic::AtomicUsize::new(0);
        // pending on the initial check and the first re-check only
        let sent = d
            .notify_if_pending(100, 0, || calls.fetch_add(1, Ordering::SeqCst) < 2)
            .await;
        assert_eq!(sent, 20);
        assert_eq!(recorder.sent().len(), 20);
    }

    #[tokio::test]
    async fn test_submitter_datagram() {
        let (d, recorder) = dispatcher();
        let target = SubmitterNotify {
            host: "client".to_string(),
            port: 9100,
            timeout: 30,
        };
        d.notify_submitter(&target, JobId(42)).await;
        assert_eq!(
            recorder.sent(),
            vec![Datagram {
                host: "client".to_string(),
                port: 9100,
                message: "JNTF 42".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_wake_waiters() {
        let (d, _) = dispatcher();
        let d = Arc::new(d);
        let notified = d.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        d.wake_waiters();
        tokio::time::timeout(Duration::from_millis(100), notified)
            .await
            .unwrap();
    }
}
