//! Head tracker: keeps the node's view of the chain tip.
//!
//! The tracker wires the listener, the saver and the broadcaster together:
//!
//! ```text
//!  client ──► HeadListener ──► handle_new_head ──► saver
//!                                   │
//!                    ┌──────────────┴──────────────┐
//!                    ▼                             ▼
//!             backfill mailbox              broadcast mailbox
//!                    │                             │
//!             backfill worker               broadcast worker ──► HeadBroadcaster
//! ```
//!
//! Every head is persisted before it is classified, so competing and
//! out-of-order heads are available when later chains are linked.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broadcaster::HeadBroadcaster;
use crate::client::HeadClient;
use crate::config::HeadTrackerConfig;
use crate::error::ChainHeadError;
use crate::head::Head;
use crate::health::{ErrorBuffer, HealthReport, HealthReporter};
use crate::lifecycle::{StateMachine, Transition};
use crate::listener::HeadListener;
use crate::mailbox::{Mailbox, MailboxMonitor};
use crate::metrics::{HeadTrackerMetrics, MetricsSink};
use crate::saver::HeadSaver;

const TRACKER_NAME: &str = "HeadTracker";

/// Tracks the longest chain of one network.
pub struct HeadTracker<H: Head, C: HeadClient<H>, S: HeadSaver<H>> {
    inner: Arc<TrackerInner<H, C, S>>,
    state: StateMachine,
    workers: Mutex<Vec<JoinHandle<()>>>,
    monitor: Option<Arc<MailboxMonitor>>,
}

struct TrackerInner<H: Head, C: HeadClient<H>, S: HeadSaver<H>> {
    config: HeadTrackerConfig,
    client: Arc<C>,
    saver: Arc<S>,
    broadcaster: Arc<HeadBroadcaster<H>>,
    listener: HeadListener<H, C>,
    backfill_mailbox: Arc<Mailbox<H>>,
    broadcast_mailbox: Arc<Mailbox<H>>,
    metrics: HeadTrackerMetrics,
    errors: ErrorBuffer,
    stop: CancellationToken,
}

impl<H: Head, C: HeadClient<H>, S: HeadSaver<H>> HeadTracker<H, C, S> {
    pub fn new(
        config: HeadTrackerConfig,
        client: Arc<C>,
        saver: Arc<S>,
        broadcaster: Arc<HeadBroadcaster<H>>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let metrics = HeadTrackerMetrics::new(sink, client.configured_chain_id().to_string());
        let listener = HeadListener::new(config.clone(), client.clone(), metrics.clone());
        Self {
            inner: Arc::new(TrackerInner {
                backfill_mailbox: Arc::new(Mailbox::single()),
                broadcast_mailbox: Arc::new(Mailbox::new(config.max_buffer_size)),
                config,
                client,
                saver,
                broadcaster,
                listener,
                metrics,
                errors: ErrorBuffer::default(),
                stop: CancellationToken::new(),
            }),
            state: StateMachine::new(TRACKER_NAME),
            workers: Mutex::new(Vec::new()),
            monitor: None,
        }
    }

    /// Report the load of the tracker's mailboxes through `monitor`.
    pub fn with_mailbox_monitor(mut self, monitor: Arc<MailboxMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Load the persisted chain, process the node's current head and spawn
    /// the listener, backfill and broadcast workers.
    ///
    /// Starting a running tracker is a no-op; starting a closed one fails.
    pub async fn start(&self) -> Result<(), ChainHeadError> {
        if self.state.begin_start()? == Transition::AlreadyDone {
            return Ok(());
        }
        match self.start_inner().await {
            Ok(()) => {
                self.state.finish_start(true);
                tracing::info!(chain_id = %self.inner.client.configured_chain_id(), "HeadTracker started");
                Ok(())
            }
            Err(e) => {
                self.inner.stop.cancel();
                self.state.finish_start(false);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<(), ChainHeadError> {
        let inner = &self.inner;

        let latest = inner
            .saver
            .load()
            .await
            .map_err(|e| e.context("failed to load latest head"))?;
        match &latest {
            Some(head) => tracing::info!(
                number = head.block_number(),
                hash = %head.block_hash(),
                "Loaded chain from DB"
            ),
            None => tracing::info!("No persisted heads found"),
        }

        match inner.fetch_head(None).await {
            Ok(Some(head)) if head.is_valid() => {
                if let Err(e) = inner.handle_new_head(head).await {
                    tracing::error!(error = %e, "Error handling initial head");
                }
            }
            Ok(_) => tracing::warn!("Got nil initial head"),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => tracing::warn!(error = %e, "Error getting initial head"),
        }
        if inner.stop.is_cancelled() {
            return Err(ChainHeadError::Cancelled);
        }

        inner.broadcaster.start()?;

        {
            let mut workers = self.workers.lock().unwrap();
            workers.push(tokio::spawn({
                let inner = inner.clone();
                async move {
                    let handler_inner = inner.clone();
                    inner
                        .listener
                        .listen_for_new_heads(inner.stop.clone(), move |_ctx, head| {
                            let inner = handler_inner.clone();
                            async move { inner.handle_new_head(head).await }
                        })
                        .await;
                }
            }));
            workers.push(tokio::spawn({
                let inner = inner.clone();
                async move { inner.backfill_loop().await }
            }));
            workers.push(tokio::spawn({
                let inner = inner.clone();
                async move { inner.broadcast_loop().await }
            }));
        }

        if let Some(monitor) = &self.monitor {
            monitor.monitor(&inner.backfill_mailbox, "HeadTracker backfill");
            monitor.monitor(&inner.broadcast_mailbox, "HeadTracker broadcast");
        }
        Ok(())
    }

    /// Stop every worker and wait for them. Idempotent.
    pub async fn close(&self) {
        if self.state.begin_stop() == Transition::AlreadyDone {
            return;
        }
        self.inner.stop.cancel();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "HeadTracker worker panicked");
            }
        }
        self.inner.backfill_mailbox.close();
        self.inner.broadcast_mailbox.close();
        self.inner.broadcaster.close().await;
        self.state.finish_stop();
        tracing::info!(chain_id = %self.inner.client.configured_chain_id(), "HeadTracker stopped");
    }

    /// The highest known head, linked to its in-memory ancestors.
    pub fn latest_chain(&self) -> Option<H> {
        self.inner.saver.latest_chain()
    }

    /// Make sure the `depth` blocks ending at `head` are all persisted.
    pub async fn backfill(&self, head: H, depth: u64) -> Result<(), ChainHeadError> {
        self.inner.backfill(head, depth).await
    }

    /// The node's latest head and the head `finality_depth` blocks below it.
    ///
    /// The finalized head is taken from the saver's chain when it is held in
    /// memory and fetched by number otherwise.
    pub async fn latest_and_finalized_block(&self) -> Result<(H, H), ChainHeadError> {
        self.inner.latest_and_finalized_block().await
    }

    pub fn broadcaster(&self) -> &Arc<HeadBroadcaster<H>> {
        &self.inner.broadcaster
    }

    pub fn listener(&self) -> &HeadListener<H, C> {
        &self.inner.listener
    }

    pub fn config(&self) -> &HeadTrackerConfig {
        &self.inner.config
    }
}

impl<H: Head, C: HeadClient<H>, S: HeadSaver<H>> HealthReporter for HeadTracker<H, C, S> {
    fn name(&self) -> String {
        TRACKER_NAME.to_string()
    }

    fn health_report(&self) -> HealthReport {
        let status = self
            .state
            .healthy()
            .err()
            .or_else(|| self.inner.errors.flush());
        let mut report = HealthReport::new();
        report.insert(self.name(), status);
        report.extend(self.inner.listener.health_report());
        report.extend(self.inner.broadcaster.health_report());
        report
    }
}

// ─── Workers ──────────────────────────────────────────────────────────────────

impl<H: Head, C: HeadClient<H>, S: HeadSaver<H>> TrackerInner<H, C, S> {
    /// Persist `head`, then classify it against the previous highest head.
    pub(crate) async fn handle_new_head(&self, head: H) -> Result<(), ChainHeadError> {
        let prev = self.saver.latest_chain();

        tracing::debug!(
            number = head.block_number(),
            hash = %head.block_hash(),
            parent_hash = %head.parent_hash(),
            "Received new head"
        );

        self.saver
            .save(&head)
            .await
            .map_err(|e| e.context(&format!("failed to save head {}", head.block_number())))?;

        let prev = match prev {
            Some(prev) if head.block_number() <= prev.block_number() => prev,
            _ => return self.handle_new_highest_head(&head),
        };

        if head.block_number() == prev.block_number() {
            if head.block_hash() == prev.block_hash() {
                tracing::debug!(number = head.block_number(), "Head already in the database");
            } else {
                tracing::debug!(
                    number = head.block_number(),
                    hash = %head.block_hash(),
                    known_hash = %prev.block_hash(),
                    "Got competing head with the same number as the current one"
                );
            }
            return Ok(());
        }

        let prev_unfinalized = prev.block_number().saturating_sub(self.config.finality_depth);
        if head.block_number() < prev_unfinalized {
            self.metrics.record_very_old_head();
            let err = ChainHeadError::VeryOldHead {
                number: head.block_number(),
                highest: prev.block_number(),
            };
            tracing::error!(
                number = head.block_number(),
                highest = prev.block_number(),
                finality_depth = self.config.finality_depth,
                "Got very old block. Either a very deep re-org occurred, one of the RPC nodes has gotten far out of sync, or the chain went backwards in block numbers. This node may not function correctly without manual intervention."
            );
            self.errors.append(err);
        } else {
            tracing::debug!(
                number = head.block_number(),
                highest = prev.block_number(),
                "Got out of order head"
            );
        }
        Ok(())
    }

    fn handle_new_highest_head(&self, head: &H) -> Result<(), ChainHeadError> {
        self.metrics.set_current_head(head.block_number());
        let chain = self.saver.chain(&head.block_hash()).ok_or_else(|| {
            ChainHeadError::InvariantViolation(format!(
                "chain for head {} ({}) missing right after save",
                head.block_number(),
                head.block_hash()
            ))
        })?;
        self.backfill_mailbox.deliver(chain.clone());
        self.broadcast_mailbox.deliver(chain);
        Ok(())
    }

    /// Walk from `head.number - 1` down to the base height, fetching every
    /// block the saver does not already have.
    async fn backfill(&self, head: H, depth: u64) -> Result<(), ChainHeadError> {
        if head.chain_length() >= depth {
            return Ok(());
        }
        let base_height = head.block_number().saturating_sub(depth - 1);
        let started = Instant::now();
        let mut fetched = 0u64;

        let mut current = head.clone();
        for number in (base_height..head.block_number()).rev() {
            if self.stop.is_cancelled() {
                return Ok(());
            }
            if let Some(existing) = self.saver.chain(&current.parent_hash()) {
                current = existing;
                continue;
            }
            current = match self.fetch_and_save_head(number, &current).await {
                Ok(head) => head,
                Err(e) if e.is_cancelled() => return Ok(()),
                Err(e) => return Err(e.context("fetch and save head failed")),
            };
            fetched += 1;
        }

        self.metrics.record_backfill_duration(started.elapsed());
        tracing::debug!(
            number = head.block_number(),
            base_height,
            fetched,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finished backfill"
        );
        Ok(())
    }

    /// Fetch block `number` (latest when `None`), giving up when `stop` fires.
    async fn fetch_head(&self, number: Option<u64>) -> Result<Option<H>, ChainHeadError> {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(ChainHeadError::Cancelled),
            result = self.client.head_by_number(number) => result,
        }
    }

    /// Fetch and persist the block at `number`, the expected parent of `child`.
    async fn fetch_and_save_head(&self, number: u64, child: &H) -> Result<H, ChainHeadError> {
        tracing::debug!(number, "Fetching head");
        let head = self
            .fetch_head(Some(number))
            .await?
            .ok_or_else(|| ChainHeadError::Rpc(format!("got nil head for block {number}")))?;
        if !head.is_valid() {
            return Err(ChainHeadError::Rpc(format!("got invalid head for block {number}")));
        }
        if !child.extends(&head) {
            tracing::debug!(
                number,
                hash = %head.block_hash(),
                expected = %child.parent_hash(),
                "Fetched head does not match the expected parent; the chain moved during backfill"
            );
        }
        self.saver.save(&head).await?;
        Ok(head)
    }

    async fn latest_and_finalized_block(&self) -> Result<(H, H), ChainHeadError> {
        let latest = match self.fetch_head(None).await {
            Ok(Some(head)) if head.is_valid() => head,
            Ok(_) => return Err(ChainHeadError::Rpc("expected latest block to be valid".into())),
            Err(e) => return Err(e.context("failed to get latest block")),
        };

        let number = latest.block_number().saturating_sub(self.config.finality_depth);
        let known = self
            .saver
            .chain(&latest.block_hash())
            .unwrap_or_else(|| latest.clone())
            .head_at_height(number);
        if let Some(finalized) = known {
            return Ok((latest, finalized));
        }

        match self.fetch_head(Some(number)).await {
            Ok(Some(head)) if head.is_valid() => Ok((latest, head)),
            Ok(_) => Err(ChainHeadError::Rpc(format!(
                "failed to get valid latest finalized block {number}"
            ))),
            Err(e) => Err(e.context("failed to calculate latest finalized block")),
        }
    }

    async fn backfill_loop(&self) {
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                _ = self.backfill_mailbox.notified() => {}
            }
            while let Some(head) = self.backfill_mailbox.retrieve() {
                if self.stop.is_cancelled() {
                    return;
                }
                let number = head.block_number();
                let timeout = self.config.backfill_timeout;
                match tokio::time::timeout(timeout, self.backfill(head, self.config.finality_depth)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(number, error = %e, "Error performing backfill"),
                    Err(_) => tracing::warn!(
                        number,
                        timeout_ms = timeout.as_millis() as u64,
                        "Backfill timed out"
                    ),
                }
            }
        }
    }

    async fn broadcast_loop(&self) {
        if self.config.sampling_enabled() {
            let mut ticker = tokio::time::interval(self.config.sampling_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => return,
                    _ = ticker.tick() => {
                        match self.broadcast_mailbox.retrieve_latest_and_clear() {
                            Some(head) if head.is_valid() => {
                                self.broadcaster.broadcast_new_longest_chain(head);
                            }
                            _ => {}
                        }
                    }
                }
            }
        } else {
            loop {
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => return,
                    _ = self.broadcast_mailbox.notified() => {}
                }
                for head in self.broadcast_mailbox.retrieve_all() {
                    self.broadcaster.broadcast_new_longest_chain(head);
                }
            }
        }
    }
}
