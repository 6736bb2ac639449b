//! Test doubles shared by the unit tests of this crate.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::metrics::MeterProvider as _;
use opentelemetry_sdk::metrics::{data, InMemoryMetricExporter, PeriodicReader, SdkMeterProvider};

use crate::client::{HeadClient, HeadSubscription, SubscriptionSender};
use crate::error::ChainHeadError;
use crate::head::Head;
use crate::metrics::{MetricsSink, OtelMetrics};
use crate::saver::HeadSaver;

pub const TEST_CHAIN_ID: u64 = 1;

/// Deterministic hash for block `number` on the canonical test chain.
pub fn hash_for(number: u64) -> u64 {
    0x1000 + number
}

// ─── TestHead ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TestHead(Arc<TestHeadInner>);

struct TestHeadInner {
    number: u64,
    hash: u64,
    parent_hash: u64,
    chain_id: u64,
    valid: bool,
    parent: Option<TestHead>,
}

impl TestHead {
    pub fn new(number: u64, hash: u64, parent_hash: u64) -> Self {
        Self(Arc::new(TestHeadInner {
            number,
            hash,
            parent_hash,
            chain_id: TEST_CHAIN_ID,
            valid: true,
            parent: None,
        }))
    }

    /// Unlinked head `number` of the canonical test chain.
    pub fn at(number: u64) -> Self {
        let parent = number.checked_sub(1).map(hash_for).unwrap_or(0);
        Self::new(number, hash_for(number), parent)
    }

    /// `count` canonical heads starting at `start`, each linked to the previous.
    pub fn chain(start: u64, count: u64) -> Vec<Self> {
        let mut heads: Vec<Self> = Vec::with_capacity(count as usize);
        for number in start..start + count {
            let head = Self::at(number).with_parent(heads.last().cloned());
            heads.push(head);
        }
        heads
    }

    pub fn invalid(number: u64) -> Self {
        let mut inner = Self::at(number).into_inner();
        inner.valid = false;
        Self(Arc::new(inner))
    }

    pub fn with_chain_id(&self, chain_id: u64) -> Self {
        let mut inner = self.clone().into_inner();
        inner.chain_id = chain_id;
        Self(Arc::new(inner))
    }

    fn into_inner(self) -> TestHeadInner {
        TestHeadInner {
            number: self.0.number,
            hash: self.0.hash,
            parent_hash: self.0.parent_hash,
            chain_id: self.0.chain_id,
            valid: self.0.valid,
            parent: self.0.parent.clone(),
        }
    }
}

impl fmt::Debug for TestHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestHead")
            .field("number", &self.0.number)
            .field("hash", &format_args!("{:#x}", self.0.hash))
            .field("chain_length", &self.chain_length())
            .finish()
    }
}

impl Head for TestHead {
    type Hash = u64;
    type ChainId = u64;

    fn block_number(&self) -> u64 {
        self.0.number
    }

    fn block_hash(&self) -> u64 {
        self.0.hash
    }

    fn parent_hash(&self) -> u64 {
        self.0.parent_hash
    }

    fn chain_id(&self) -> u64 {
        self.0.chain_id
    }

    fn is_valid(&self) -> bool {
        self.0.valid
    }

    fn parent(&self) -> Option<Self> {
        self.0.parent.clone()
    }

    fn with_parent(&self, parent: Option<Self>) -> Self {
        let mut inner = self.clone().into_inner();
        inner.parent = parent;
        Self(Arc::new(inner))
    }
}

// ─── MockSaver ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockSaver {
    heads: Mutex<HashMap<u64, TestHead>>,
    latest: Mutex<Option<u64>>,
    fail_saves: AtomicBool,
    fail_load: AtomicBool,
}

impl MockSaver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A saver that already holds `heads`, as if loaded from a database.
    pub fn with_heads(heads: impl IntoIterator<Item = TestHead>) -> Self {
        let saver = Self::new();
        for head in heads {
            saver.insert(&head);
        }
        saver
    }

    fn insert(&self, head: &TestHead) {
        self.heads
            .lock()
            .unwrap()
            .insert(head.block_hash(), head.with_parent(None));
        let mut latest = self.latest.lock().unwrap();
        let higher = match *latest {
            Some(hash) => self
                .heads
                .lock()
                .unwrap()
                .get(&hash)
                .map_or(true, |l| head.block_number() > l.block_number()),
            None => true,
        };
        if higher {
            *latest = Some(head.block_hash());
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn has_number(&self, number: u64) -> bool {
        self.heads
            .lock()
            .unwrap()
            .values()
            .any(|h| h.block_number() == number)
    }
}

#[async_trait]
impl HeadSaver<TestHead> for MockSaver {
    async fn save(&self, head: &TestHead) -> Result<(), ChainHeadError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(ChainHeadError::Storage("disk full".into()));
        }
        self.insert(head);
        Ok(())
    }

    async fn load(&self) -> Result<Option<TestHead>, ChainHeadError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(ChainHeadError::Storage("database unavailable".into()));
        }
        Ok(self.latest_chain())
    }

    fn latest_chain(&self) -> Option<TestHead> {
        let hash = (*self.latest.lock().unwrap())?;
        self.chain(&hash)
    }

    fn chain(&self, hash: &u64) -> Option<TestHead> {
        let heads = self.heads.lock().unwrap();
        let mut path = vec![heads.get(hash)?.clone()];
        while let Some(parent) = path.last().and_then(|h| heads.get(&h.parent_hash())) {
            if parent.block_number() + 1 != path[path.len() - 1].block_number() {
                break;
            }
            path.push(parent.clone());
        }
        path.into_iter()
            .rev()
            .fold(None, |parent, head| Some(head.with_parent(parent)))
    }
}

// ─── MockClient ───────────────────────────────────────────────────────────────

/// Client whose blocks and subscriptions are scripted by the test.
pub struct MockClient {
    chain_id: u64,
    blocks: Mutex<HashMap<u64, TestHead>>,
    latest: Mutex<Option<TestHead>>,
    fetched: Mutex<Vec<u64>>,
    fail_fetches: AtomicBool,
    stall_fetches: AtomicBool,
    subscribe_failures: Mutex<VecDeque<ChainHeadError>>,
    subscribe_calls: AtomicUsize,
    senders: Mutex<Vec<SubscriptionSender<TestHead>>>,
    unsubscribes: Arc<AtomicUsize>,
}

impl Default for MockClient {
    fn default() -> Self {
        Self {
            chain_id: TEST_CHAIN_ID,
            blocks: Mutex::new(HashMap::new()),
            latest: Mutex::new(None),
            fetched: Mutex::new(Vec::new()),
            fail_fetches: AtomicBool::new(false),
            stall_fetches: AtomicBool::new(false),
            subscribe_failures: Mutex::new(VecDeque::new()),
            subscribe_calls: AtomicUsize::new(0),
            senders: Mutex::new(Vec::new()),
            unsubscribes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make canonical blocks `numbers` fetchable by number.
    pub fn with_blocks(self, numbers: impl IntoIterator<Item = u64>) -> Self {
        {
            let mut blocks = self.blocks.lock().unwrap();
            for n in numbers {
                blocks.insert(n, TestHead::at(n));
            }
        }
        self
    }

    pub fn set_latest(&self, head: Option<TestHead>) {
        *self.latest.lock().unwrap() = head;
    }

    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// While set, `head_by_number` never resolves.
    pub fn set_stall_fetches(&self, stall: bool) {
        self.stall_fetches.store(stall, Ordering::SeqCst);
    }

    /// The next `count` subscribe attempts fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        let mut failures = self.subscribe_failures.lock().unwrap();
        for _ in 0..count {
            failures.push_back(ChainHeadError::Rpc("connection refused".into()));
        }
    }

    /// Block numbers requested through `head_by_number(Some(_))`, in order.
    pub fn fetched(&self) -> Vec<u64> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` subscriptions were opened and return the
    /// sender of the `n`-th one.
    pub async fn subscription(&self, n: usize) -> SubscriptionSender<TestHead> {
        loop {
            if let Some(sender) = self.senders.lock().unwrap().get(n - 1) {
                return sender.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl HeadClient<TestHead> for MockClient {
    fn configured_chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn head_by_number(&self, number: Option<u64>) -> Result<Option<TestHead>, ChainHeadError> {
        if self.stall_fetches.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(ChainHeadError::Rpc("upstream timeout".into()));
        }
        match number {
            None => Ok(self.latest.lock().unwrap().clone()),
            Some(n) => {
                self.fetched.lock().unwrap().push(n);
                Ok(self.blocks.lock().unwrap().get(&n).cloned())
            }
        }
    }

    async fn subscribe_new_heads(&self) -> Result<HeadSubscription<TestHead>, ChainHeadError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.subscribe_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let (sub, sender) = HeadSubscription::channel(16);
        self.senders.lock().unwrap().push(sender);
        let unsubscribes = self.unsubscribes.clone();
        Ok(sub.on_unsubscribe(move || {
            unsubscribes.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

// ─── TestMetrics ──────────────────────────────────────────────────────────────

/// An [`OtelMetrics`] sink wired to the SDK's in-memory exporter.
pub struct TestMetrics {
    provider: SdkMeterProvider,
    exporter: InMemoryMetricExporter,
    sink: Arc<OtelMetrics>,
}

impl TestMetrics {
    pub fn new() -> Self {
        let exporter = InMemoryMetricExporter::default();
        let reader = PeriodicReader::builder(exporter.clone()).build();
        let provider = SdkMeterProvider::builder().with_reader(reader).build();
        let sink = Arc::new(OtelMetrics::new(&provider.meter("chainhead-test")));
        Self {
            provider,
            exporter,
            sink,
        }
    }

    pub fn sink(&self) -> Arc<dyn MetricsSink> {
        self.sink.clone()
    }

    /// Current value of counter `name` for `chain_id` (0 if never incremented).
    pub fn counter(&self, name: &str, chain_id: &str) -> u64 {
        self.inspect(name, |data| {
            let sum = data.downcast_ref::<data::Sum<u64>>()?;
            sum.data_points
                .iter()
                .find(|dp| has_label(&dp.attributes, "chain_id", chain_id))
                .map(|dp| dp.value)
        })
        .unwrap_or(0)
    }

    /// Last value of gauge `name` for `chain_id`.
    pub fn gauge(&self, name: &str, chain_id: &str) -> Option<f64> {
        self.gauge_labeled(name, "chain_id", chain_id)
    }

    /// Last value of gauge `name` for the series labeled `key=value`.
    pub fn gauge_labeled(&self, name: &str, key: &str, value: &str) -> Option<f64> {
        self.inspect(name, |data| {
            let gauge = data.downcast_ref::<data::Gauge<f64>>()?;
            gauge
                .data_points
                .iter()
                .find(|dp| has_label(&dp.attributes, key, value))
                .map(|dp| dp.value)
        })
    }

    /// Sample count and sum of histogram `name` for `chain_id`.
    pub fn histogram(&self, name: &str, chain_id: &str) -> Option<(u64, f64)> {
        self.inspect(name, |data| {
            let histogram = data.downcast_ref::<data::Histogram<f64>>()?;
            histogram
                .data_points
                .iter()
                .find(|dp| has_label(&dp.attributes, "chain_id", chain_id))
                .map(|dp| (dp.count, dp.sum))
        })
    }

    fn inspect<T>(&self, name: &str, read: impl FnOnce(&dyn std::any::Any) -> Option<T>) -> Option<T> {
        self.exporter.reset();
        self.provider.force_flush().unwrap();
        let exported = self.exporter.get_finished_metrics().unwrap();
        let metric = exported
            .last()?
            .scope_metrics
            .iter()
            .flat_map(|scope| scope.metrics.iter())
            .find(|metric| metric.name == name)?;
        read(metric.data.as_any())
    }
}

fn has_label(attributes: &[opentelemetry::KeyValue], key: &str, value: &str) -> bool {
    attributes
        .iter()
        .any(|kv| kv.key.as_str() == key && kv.value.as_str() == value)
}
