//! Bounded, overwrite-on-full mailbox used between producer and consumer
//! workers.
//!
//! A mailbox never blocks the producer and never grows past its capacity:
//! when it is full, the **oldest** item is dropped to make room for the new
//! one and the drop counter is bumped. Consumers wait on [`Mailbox::notified`]
//! and then drain. Capacity 1 gives "latest write wins" semantics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::{MetricsSink, MAILBOX_LOAD_PERCENT};

/// A bounded drop-oldest queue with a readiness signal.
pub struct Mailbox<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl<T> Mailbox<T> {
    /// Create a mailbox holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// A single-slot mailbox: the latest delivery overwrites any pending one.
    pub fn single() -> Self {
        Self::new(1)
    }

    /// Enqueue `item` without blocking.
    ///
    /// Returns `true` if an older item was dropped to make room. Delivering to
    /// a closed mailbox is a no-op.
    pub fn deliver(&self, item: T) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut overflowed = false;
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            overflowed = true;
        }
        queue.push_back(item);
        drop(queue);

        // A stored permit covers deliveries that happen while nobody waits.
        self.notify.notify_one();
        overflowed
    }

    /// Resolves when items may be available. Several deliveries can collapse
    /// into one wakeup, so consumers must drain until [`Mailbox::retrieve`]
    /// returns `None`.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Pop the oldest pending item.
    pub fn retrieve(&self) -> Option<T> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Return the newest pending item and discard everything else.
    pub fn retrieve_latest_and_clear(&self) -> Option<T> {
        let mut queue = self.queue.lock().unwrap();
        let latest = queue.pop_back();
        queue.clear();
        latest
    }

    /// Drain every pending item in delivery order.
    pub fn retrieve_all(&self) -> Vec<T> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    /// Empty the mailbox and refuse further deliveries.
    pub fn close(&self) {
        let mut queue = self.queue.lock().unwrap();
        self.closed.store(true, Ordering::Release);
        queue.clear();
        drop(queue);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items dropped on overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ─── Monitoring ───────────────────────────────────────────────────────────────

/// Occupancy introspection, independent of the item type.
pub trait MailboxStats: Send + Sync {
    fn pending(&self) -> usize;
    fn slots(&self) -> usize;
    fn overflowed(&self) -> u64;

    /// Occupancy in percent of capacity.
    fn load_percent(&self) -> f64 {
        self.pending() as f64 / self.slots() as f64 * 100.0
    }
}

impl<T: Send> MailboxStats for Mailbox<T> {
    fn pending(&self) -> usize {
        self.len()
    }

    fn slots(&self) -> usize {
        self.capacity
    }

    fn overflowed(&self) -> u64 {
        self.dropped()
    }
}

/// Periodically reports the load of registered mailboxes.
///
/// Only weak references are held: a mailbox that is dropped disappears from
/// the report on the next pass.
pub struct MailboxMonitor {
    mailboxes: Mutex<Vec<(String, Weak<dyn MailboxStats>)>>,
    sink: Arc<dyn MetricsSink>,
}

impl MailboxMonitor {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            mailboxes: Mutex::new(Vec::new()),
            sink,
        }
    }

    /// Start reporting on `mailbox` under `name`.
    pub fn monitor<T: Send + 'static>(&self, mailbox: &Arc<Mailbox<T>>, name: impl Into<String>) {
        let stats: Arc<dyn MailboxStats> = mailbox.clone();
        self.mailboxes
            .lock()
            .unwrap()
            .push((name.into(), Arc::downgrade(&stats)));
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.mailboxes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, mb)| mb.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Emit one load gauge per live mailbox and forget dropped ones.
    pub fn report(&self) {
        let mut mailboxes = self.mailboxes.lock().unwrap();
        mailboxes.retain(|(name, weak)| match weak.upgrade() {
            Some(stats) => {
                self.sink.set_gauge(
                    MAILBOX_LOAD_PERCENT,
                    stats.load_percent(),
                    &[("name", name.clone())],
                );
                if stats.load_percent() >= 100.0 {
                    tracing::debug!(
                        mailbox = %name,
                        dropped = stats.overflowed(),
                        "mailbox is full"
                    );
                }
                true
            }
            None => false,
        });
    }

    /// Report every `interval` until `stop` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => self.report(),
                }
            }
        })
    }
}
