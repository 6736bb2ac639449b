//! New-heads subscription loop.
//!
//! The listener owns the connection lifecycle: it subscribes (retrying with a
//! jittered exponential backoff), forwards every valid head to a handler, and
//! resubscribes whenever the transport reports an error or the subscription
//! closes. It never gives up until the stop token fires.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{HeadClient, HeadSubscription, SubscriptionEvent};
use crate::config::HeadTrackerConfig;
use crate::error::ChainHeadError;
use crate::head::Head;
use crate::health::{ErrorBuffer, HealthReport, HealthReporter};
use crate::metrics::HeadTrackerMetrics;

const LISTENER_NAME: &str = "HeadListener";

/// Subscribes to new heads and feeds them to a handler.
pub struct HeadListener<H: Head, C: HeadClient<H>> {
    client: Arc<C>,
    config: HeadTrackerConfig,
    metrics: HeadTrackerMetrics,
    connected: AtomicBool,
    receiving: AtomicBool,
    errors: ErrorBuffer,
    _head: PhantomData<fn() -> H>,
}

impl<H: Head, C: HeadClient<H>> HeadListener<H, C> {
    pub fn new(config: HeadTrackerConfig, client: Arc<C>, metrics: HeadTrackerMetrics) -> Self {
        Self {
            client,
            config,
            metrics,
            connected: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            errors: ErrorBuffer::default(),
            _head: PhantomData,
        }
    }

    /// `true` while a subscription is open.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// `true` once a valid head arrived on the current subscription and the
    /// idle alarm has not fired since.
    pub fn receiving_heads(&self) -> bool {
        self.receiving.load(Ordering::Acquire)
    }

    /// Run until `stop` fires, calling `handler` for every valid head.
    ///
    /// The handler gets a child of `stop`. Handler errors are logged and do
    /// not end the subscription.
    pub async fn listen_for_new_heads<F, Fut>(&self, stop: CancellationToken, handler: F)
    where
        F: Fn(CancellationToken, H) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), ChainHeadError>> + Send,
    {
        while let Some(mut subscription) = self.subscribe(&stop).await {
            self.connected.store(true, Ordering::Release);
            tracing::info!(chain_id = %self.client.configured_chain_id(), "Subscribed to new heads");

            self.receive_heads(&stop, &mut subscription, &handler).await;

            subscription.unsubscribe();
            self.connected.store(false, Ordering::Release);
            self.receiving.store(false, Ordering::Release);
        }
        self.connected.store(false, Ordering::Release);
        self.receiving.store(false, Ordering::Release);
    }

    /// Subscribe, retrying until success. `None` means `stop` fired.
    async fn subscribe(&self, stop: &CancellationToken) -> Option<HeadSubscription<H>> {
        let mut attempt: u32 = 0;
        loop {
            if stop.is_cancelled() {
                return None;
            }
            if attempt > 0 {
                let delay = backoff_delay(
                    attempt,
                    self.config.subscribe_backoff_min,
                    self.config.subscribe_backoff_max,
                );
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before resubscribing");
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                biased;
                _ = stop.cancelled() => return None,
                result = self.client.subscribe_new_heads() => result,
            };
            match result {
                Ok(subscription) => return Some(subscription),
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    self.metrics.record_connection_error();
                    if e.is_transient() {
                        tracing::warn!(
                            chain_id = %self.client.configured_chain_id(),
                            attempt,
                            error = %e,
                            "Failed to subscribe to heads on chain"
                        );
                    } else {
                        tracing::error!(
                            chain_id = %self.client.configured_chain_id(),
                            attempt,
                            error = %e,
                            "Failed to subscribe to heads on chain"
                        );
                    }
                }
            }
        }
    }

    async fn receive_heads<F, Fut>(
        &self,
        stop: &CancellationToken,
        subscription: &mut HeadSubscription<H>,
        handler: &F,
    ) where
        F: Fn(CancellationToken, H) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), ChainHeadError>> + Send,
    {
        let idle_threshold = self.config.block_emission_idle_warning_threshold;
        let mut idle_deadline = (!idle_threshold.is_zero()).then(|| Instant::now() + idle_threshold);

        loop {
            let deadline = idle_deadline;
            let idle_alarm = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                event = subscription.next() => match event {
                    SubscriptionEvent::Head(head) => {
                        if !self.accept(&head) {
                            continue;
                        }
                        self.metrics.record_head_received();
                        self.receiving.store(true, Ordering::Release);
                        if !idle_threshold.is_zero() {
                            idle_deadline = Some(Instant::now() + idle_threshold);
                        }
                        if let Err(e) = handler(stop.child_token(), head.clone()).await {
                            tracing::error!(
                                number = head.block_number(),
                                hash = %head.block_hash(),
                                error = %e,
                                "Error handling head"
                            );
                        }
                    }
                    SubscriptionEvent::Error(e) => {
                        tracing::warn!(error = %e, "Subscription errored, resubscribing");
                        return;
                    }
                    SubscriptionEvent::Closed => {
                        tracing::warn!("Subscription channel unexpectedly closed, resubscribing");
                        return;
                    }
                },
                _ = idle_alarm => {
                    self.receiving.store(false, Ordering::Release);
                    tracing::warn!(
                        chain_id = %self.client.configured_chain_id(),
                        threshold_ms = idle_threshold.as_millis() as u64,
                        "Have not received a head for the configured threshold; the node may be down or stuck"
                    );
                    // Stays quiet until the next valid head re-arms it.
                    idle_deadline = None;
                }
            }
        }
    }

    /// Validity and chain-id checks. Rejected heads do not touch the idle
    /// alarm.
    fn accept(&self, head: &H) -> bool {
        if !head.is_valid() {
            tracing::warn!(number = head.block_number(), "Got invalid head, skipping");
            return false;
        }
        let expected = self.client.configured_chain_id();
        if head.chain_id() != expected {
            let err = ChainHeadError::InvariantViolation(format!(
                "head {} has chain id {} but the client is configured for {}",
                head.block_number(),
                head.chain_id(),
                expected
            ));
            tracing::error!(error = %err, "Chain id mismatch, skipping head");
            self.errors.append(err);
            return false;
        }
        true
    }
}

impl<H: Head, C: HeadClient<H>> HealthReporter for HeadListener<H, C> {
    fn name(&self) -> String {
        LISTENER_NAME.to_string()
    }

    fn health_report(&self) -> HealthReport {
        let mut problems = Vec::new();
        if !self.receiving_heads() {
            problems.push("Listener is not receiving heads".to_string());
        }
        if !self.connected() {
            problems.push("Listener is not connected".to_string());
        }
        if let Some(buffered) = self.errors.flush() {
            problems.push(buffered.to_string());
        }
        let status = (!problems.is_empty()).then(|| ChainHeadError::Other(problems.join("; ")));

        let mut report = HealthReport::new();
        report.insert(self.name(), status);
        report
    }
}

/// Exponential backoff with ±25% jitter: `min · 2^(attempt-1)`, capped at
/// `max`.
pub(crate) fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let base = min.saturating_mul(1u32 << shift).min(max);

    let base_ms = base.as_millis() as u64;
    let jitter_range = base_ms / 2;
    let jitter_offset = if jitter_range > 0 {
        rand::rng().random_range(0..jitter_range)
    } else {
        0
    };
    Duration::from_millis(base_ms.saturating_sub(jitter_range / 2) + jitter_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{CONNECTION_ERRORS, HEADS_RECEIVED};
    use crate::testing::{MockClient, TestHead, TestMetrics};
    use std::sync::Mutex;

    fn config() -> HeadTrackerConfig {
        HeadTrackerConfig {
            subscribe_backoff_min: Duration::from_millis(100),
            subscribe_backoff_max: Duration::from_secs(1),
            ..Default::default()
        }
    }

    struct Harness {
        client: Arc<MockClient>,
        listener: Arc<HeadListener<TestHead, MockClient>>,
        metrics: TestMetrics,
        seen: Arc<Mutex<Vec<u64>>>,
        stop: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_listener(config: HeadTrackerConfig, client: MockClient) -> Harness {
        let client = Arc::new(client);
        let metrics = TestMetrics::new();
        let listener = Arc::new(HeadListener::new(
            config,
            client.clone(),
            HeadTrackerMetrics::new(metrics.sink(), "1"),
        ));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stop = CancellationToken::new();

        let task = {
            let listener = listener.clone();
            let seen = seen.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                listener
                    .listen_for_new_heads(stop, move |_ctx, head: TestHead| {
                        let seen = seen.clone();
                        async move {
                            seen.lock().unwrap().push(head.block_number());
                            Ok(())
                        }
                    })
                    .await;
            })
        };

        Harness {
            client,
            listener,
            metrics,
            seen,
            stop,
            task,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_valid_heads_and_skips_invalid_ones() {
        let h = spawn_listener(config(), MockClient::new());
        let sender = h.client.subscription(1).await;

        sender.send_head(TestHead::at(1)).await;
        sender.send_head(TestHead::invalid(2)).await;
        sender.send_head(TestHead::at(3)).await;
        settle().await;

        assert_eq!(*h.seen.lock().unwrap(), vec![1, 3]);
        assert!(h.listener.connected());
        assert!(h.listener.receiving_heads());
        assert_eq!(h.metrics.counter(HEADS_RECEIVED, "1"), 2);

        h.stop.cancel();
        h.task.await.unwrap();
        assert!(!h.listener.connected());
        assert_eq!(h.client.unsubscribes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_failed_subscribes_with_backoff() {
        let client = MockClient::new();
        client.fail_next_subscribes(3);
        let h = spawn_listener(config(), client);

        let sender = h.client.subscription(1).await;
        assert_eq!(h.client.subscribe_calls(), 4);
        assert_eq!(h.metrics.counter(CONNECTION_ERRORS, "1"), 3);

        sender.send_head(TestHead::at(7)).await;
        settle().await;
        assert_eq!(*h.seen.lock().unwrap(), vec![7]);

        h.stop.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribes_when_the_error_signal_fires() {
        let h = spawn_listener(config(), MockClient::new());
        let first = h.client.subscription(1).await;
        first.send_head(TestHead::at(1)).await;
        first.fail(ChainHeadError::Subscription("websocket closed".into()));

        let second = h.client.subscription(2).await;
        assert!(first.is_closed());
        second.send_head(TestHead::at(2)).await;
        settle().await;

        assert_eq!(*h.seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(h.client.unsubscribes(), 1);
        // Resubscribing after a healthy session is not a connection error.
        assert_eq!(h.metrics.counter(CONNECTION_ERRORS, "1"), 0);

        h.stop.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_alarm_flips_receiving_without_disconnecting() {
        let cfg = HeadTrackerConfig {
            block_emission_idle_warning_threshold: Duration::from_secs(10),
            ..config()
        };
        let h = spawn_listener(cfg, MockClient::new());
        let sender = h.client.subscription(1).await;
        sender.send_head(TestHead::at(1)).await;
        settle().await;
        assert!(h.listener.receiving_heads());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!h.listener.receiving_heads());
        assert!(h.listener.connected());

        sender.send_head(TestHead::at(2)).await;
        settle().await;
        assert!(h.listener.receiving_heads());

        h.stop.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn chain_id_mismatch_is_reported_not_fatal() {
        let h = spawn_listener(config(), MockClient::new());
        let sender = h.client.subscription(1).await;
        sender.send_head(TestHead::at(1).with_chain_id(5)).await;
        sender.send_head(TestHead::at(2)).await;
        settle().await;

        assert_eq!(*h.seen.lock().unwrap(), vec![2]);
        let report = h.listener.health_report();
        let err = report[LISTENER_NAME].clone().expect("mismatch must be reported");
        assert!(err.to_string().contains("chain id 5"));
        // Reported once, then cleared.
        assert!(h.listener.health_report()[LISTENER_NAME].is_none());

        h.stop.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn handler_errors_do_not_end_the_subscription() {
        let client = Arc::new(MockClient::new());
        let listener = Arc::new(HeadListener::new(
            config(),
            client.clone(),
            HeadTrackerMetrics::noop("1"),
        ));
        let stop = CancellationToken::new();
        let calls = Arc::new(Mutex::new(0usize));
        let task = {
            let listener = listener.clone();
            let stop = stop.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                listener
                    .listen_for_new_heads(stop, move |_ctx, _head: TestHead| {
                        let calls = calls.clone();
                        async move {
                            *calls.lock().unwrap() += 1;
                            Err(ChainHeadError::Storage("boom".into()))
                        }
                    })
                    .await;
            })
        };

        let sender = client.subscription(1).await;
        sender.send_head(TestHead::at(1)).await;
        sender.send_head(TestHead::at(2)).await;
        settle().await;

        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(client.subscribe_calls(), 1);

        stop.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn never_subscribes_once_stopped() {
        let client = Arc::new(MockClient::new());
        let listener: HeadListener<TestHead, MockClient> =
            HeadListener::new(config(), client.clone(), HeadTrackerMetrics::noop("1"));
        let stop = CancellationToken::new();
        stop.cancel();

        for _ in 0..50 {
            listener
                .listen_for_new_heads(stop.clone(), |_ctx, _head: TestHead| async { Ok(()) })
                .await;
        }
        assert_eq!(client.subscribe_calls(), 0);
        assert!(!listener.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_backoff_ends_the_loop() {
        let client = MockClient::new();
        client.fail_next_subscribes(100);
        let h = spawn_listener(config(), client);

        // First attempt fails immediately, then the loop waits ~100ms.
        settle().await;
        assert_eq!(h.client.subscribe_calls(), 1);

        h.stop.cancel();
        h.task.await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.client.subscribe_calls(), 1);
        assert_eq!(h.metrics.counter(CONNECTION_ERRORS, "1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_heads_leave_the_idle_alarm_alone() {
        let cfg = HeadTrackerConfig {
            block_emission_idle_warning_threshold: Duration::from_secs(10),
            ..config()
        };
        let h = spawn_listener(cfg, MockClient::new());
        let sender = h.client.subscription(1).await;

        // Rejected heads before the first valid one do not mark the listener
        // as receiving.
        sender.send_head(TestHead::invalid(1)).await;
        sender.send_head(TestHead::at(2).with_chain_id(5)).await;
        settle().await;
        assert!(!h.listener.receiving_heads());

        sender.send_head(TestHead::at(3)).await;
        settle().await;
        assert!(h.listener.receiving_heads());

        // Rejected heads do not re-arm the alarm: it still fires 10s after
        // the last valid head.
        tokio::time::sleep(Duration::from_secs(6)).await;
        sender.send_head(TestHead::invalid(4)).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!h.listener.receiving_heads());
        assert!(h.listener.connected());
        assert_eq!(*h.seen.lock().unwrap(), vec![3]);

        h.stop.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn health_reports_disconnected_listener() {
        let client = Arc::new(MockClient::new());
        let listener: HeadListener<TestHead, MockClient> =
            HeadListener::new(config(), client, HeadTrackerMetrics::noop("1"));
        let report = listener.health_report();
        let err = report[LISTENER_NAME].clone().unwrap().to_string();
        assert!(err.contains("Listener is not receiving heads"));
        assert!(err.contains("Listener is not connected"));
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        let first = backoff_delay(1, min, max);
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));
        let capped = backoff_delay(30, min, max);
        assert!(capped >= Duration::from_millis(750) && capped <= Duration::from_millis(1250));
    }
}
