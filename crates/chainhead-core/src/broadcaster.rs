//! Fan-out of new longest chains to registered subscribers.
//!
//! Delivery is best-effort: heads pass through a single-slot mailbox, so a
//! head that arrives while the previous fan-out is still running replaces any
//! head already waiting. Subscribers must tolerate skipped heads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ChainHeadError;
use crate::head::Head;
use crate::health::{HealthReport, HealthReporter};
use crate::lifecycle::{StateMachine, Transition};
use crate::mailbox::Mailbox;

const BROADCASTER_NAME: &str = "HeadBroadcaster";

/// A consumer of new longest chains.
#[async_trait]
pub trait HeadTrackable<H: Head>: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Called with every broadcast head. `ctx` is cancelled when the
    /// broadcaster stops or the callback exceeds its time budget.
    async fn on_new_longest_chain(&self, ctx: CancellationToken, head: H);
}

struct Subscribers<H: Head> {
    callbacks: HashMap<u64, Arc<dyn HeadTrackable<H>>>,
    next_id: u64,
    latest: Option<H>,
}

struct BroadcasterInner<H: Head> {
    mailbox: Mailbox<H>,
    subscribers: Mutex<Subscribers<H>>,
    callback_timeout: Duration,
    stop: CancellationToken,
    state: StateMachine,
}

/// Delivers heads to every subscriber concurrently, each bounded by a
/// per-callback timeout.
pub struct HeadBroadcaster<H: Head> {
    inner: Arc<BroadcasterInner<H>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<H: Head> HeadBroadcaster<H> {
    pub fn new(callback_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                mailbox: Mailbox::single(),
                subscribers: Mutex::new(Subscribers {
                    callbacks: HashMap::new(),
                    next_id: 0,
                    latest: None,
                }),
                callback_timeout,
                stop: CancellationToken::new(),
                state: StateMachine::new(BROADCASTER_NAME),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the delivery worker. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), ChainHeadError> {
        if self.inner.state.begin_start()? == Transition::AlreadyDone {
            return Ok(());
        }
        let inner = self.inner.clone();
        *self.worker.lock().unwrap() = Some(tokio::spawn(async move { inner.run().await }));
        self.inner.state.finish_start(true);
        Ok(())
    }

    /// Drop every subscriber, stop the worker and wait for it. Idempotent.
    pub async fn close(&self) {
        self.inner.subscribers.lock().unwrap().callbacks.clear();
        if self.inner.state.begin_stop() == Transition::AlreadyDone {
            return;
        }
        self.inner.stop.cancel();
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Broadcaster worker panicked");
            }
        }
        self.inner.mailbox.close();
        self.inner.state.finish_stop();
    }

    /// Register `callback`. Returns the latest broadcast head, if any, and a
    /// handle that removes the registration.
    pub fn subscribe(&self, callback: Arc<dyn HeadTrackable<H>>) -> (Option<H>, Unsubscriber<H>) {
        let mut subs = self.inner.subscribers.lock().unwrap();
        let id = subs.next_id;
        subs.next_id += 1;
        tracing::debug!(subscriber = callback.name(), id, "Subscribed to new longest chains");
        subs.callbacks.insert(id, callback);
        let latest = subs.latest.clone();
        (
            latest,
            Unsubscriber {
                id,
                inner: Arc::downgrade(&self.inner),
            },
        )
    }

    /// Queue `head` for delivery. Never blocks; replaces a head still waiting.
    pub fn broadcast_new_longest_chain(&self, head: H) {
        if self.inner.mailbox.deliver(head) {
            tracing::debug!("Broadcaster busy, replaced a pending head");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().callbacks.len()
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.healthy().is_ok()
    }
}

impl<H: Head> HealthReporter for HeadBroadcaster<H> {
    fn name(&self) -> String {
        BROADCASTER_NAME.to_string()
    }

    fn health_report(&self) -> HealthReport {
        let mut report = HealthReport::new();
        report.insert(self.name(), self.inner.state.healthy().err());
        report
    }
}

impl<H: Head> BroadcasterInner<H> {
    async fn run(&self) {
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                _ = self.mailbox.notified() => {}
            }
            while let Some(head) = self.mailbox.retrieve() {
                if self.stop.is_cancelled() {
                    return;
                }
                self.execute_callbacks(head).await;
            }
        }
    }

    async fn execute_callbacks(&self, head: H) {
        let mut callbacks: Vec<(u64, Arc<dyn HeadTrackable<H>>)> = {
            let mut subs = self.subscribers.lock().unwrap();
            subs.latest = Some(head.clone());
            subs.callbacks
                .iter()
                .map(|(id, cb)| (*id, cb.clone()))
                .collect()
        };
        callbacks.sort_by_key(|(id, _)| *id);

        tracing::debug!(
            number = head.block_number(),
            hash = %head.block_hash(),
            subscribers = callbacks.len(),
            "Broadcasting new longest chain"
        );

        let calls = callbacks
            .into_iter()
            .map(|(id, callback)| self.invoke(id, callback, head.clone()));
        join_all(calls).await;
    }

    /// Call one subscriber, skipping it if it unsubscribed after the
    /// snapshot was taken.
    ///
    /// The membership check and the start of the call are not atomic: an
    /// `unsubscribe` racing with this method on another thread can still see
    /// one last invocation begin.
    async fn invoke(&self, id: u64, callback: Arc<dyn HeadTrackable<H>>, head: H) {
        let ctx = self.stop.child_token();
        let is_registered = self.subscribers.lock().unwrap().callbacks.contains_key(&id);
        if !is_registered {
            return;
        }
        let call = tokio::time::timeout(
            self.callback_timeout,
            callback.on_new_longest_chain(ctx.clone(), head),
        );
        let timed_out = tokio::select! {
            _ = self.stop.cancelled() => false,
            result = call => result.is_err(),
        };
        if timed_out {
            ctx.cancel();
            tracing::warn!(
                subscriber = callback.name(),
                timeout_ms = self.callback_timeout.as_millis() as u64,
                "Subscriber callback timed out"
            );
        }
    }
}

/// Removes a subscription from its broadcaster.
pub struct Unsubscriber<H: Head> {
    id: u64,
    inner: Weak<BroadcasterInner<H>>,
}

impl<H: Head> Unsubscriber<H> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the registration. Fan-outs that begin after this returns skip
    /// the subscriber. A call already running may still finish, and one whose
    /// registration check raced with this call may still start.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers.lock().unwrap().callbacks.remove(&self.id);
        }
    }
}
