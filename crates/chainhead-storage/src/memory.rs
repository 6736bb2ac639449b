//! In-memory head saver.
//!
//! Stores heads by hash and keeps only the last `history_depth` blocks below
//! the highest one. Chains are linked on demand by following parent hashes,
//! so heads saved out of order or on competing forks link up as soon as
//! their ancestors arrive.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chainhead_core::error::ChainHeadError;
use chainhead_core::head::Head;
use chainhead_core::saver::HeadSaver;

struct Heads<H: Head> {
    by_hash: HashMap<H::Hash, H>,
    by_number: BTreeMap<u64, Vec<H::Hash>>,
    latest: Option<H::Hash>,
}

impl<H: Head> Default for Heads<H> {
    fn default() -> Self {
        Self {
            by_hash: HashMap::new(),
            by_number: BTreeMap::new(),
            latest: None,
        }
    }
}

impl<H: Head> Heads<H> {
    fn insert(&mut self, head: &H) {
        let hash = head.block_hash();
        if self.by_hash.contains_key(&hash) {
            return;
        }
        self.by_hash.insert(hash.clone(), head.with_parent(None));
        self.by_number
            .entry(head.block_number())
            .or_default()
            .push(hash.clone());

        let higher = match self.latest.as_ref().and_then(|h| self.by_hash.get(h)) {
            Some(latest) => head.block_number() > latest.block_number(),
            None => true,
        };
        if higher {
            self.latest = Some(hash);
        }
    }

    fn latest_number(&self) -> Option<u64> {
        self.latest
            .as_ref()
            .and_then(|h| self.by_hash.get(h))
            .map(|h| h.block_number())
    }

    /// Drop every head numbered below `cutoff`. Returns how many went.
    fn trim_below(&mut self, cutoff: u64) -> usize {
        let kept = self.by_number.split_off(&cutoff);
        let removed = std::mem::replace(&mut self.by_number, kept);
        let mut count = 0;
        for hash in removed.into_values().flatten() {
            self.by_hash.remove(&hash);
            count += 1;
        }
        count
    }

    fn chain(&self, hash: &H::Hash, max_len: u64) -> Option<H> {
        let mut path = vec![self.by_hash.get(hash)?];
        while (path.len() as u64) < max_len {
            let child = path[path.len() - 1];
            match self.by_hash.get(&child.parent_hash()) {
                Some(parent) if parent.block_number() + 1 == child.block_number() => path.push(parent),
                _ => break,
            }
        }
        path.into_iter()
            .rev()
            .fold(None, |parent, head| Some(head.with_parent(parent)))
    }
}

/// Head saver that keeps everything in RAM.
///
/// All data is lost when the process exits.
pub struct InMemoryHeadSaver<H: Head> {
    history_depth: u64,
    heads: Mutex<Heads<H>>,
}

impl<H: Head> InMemoryHeadSaver<H> {
    pub fn new(history_depth: u64) -> Self {
        Self {
            history_depth,
            heads: Mutex::new(Heads::default()),
        }
    }

    /// A saver pre-populated with `heads`, as if they had been persisted by a
    /// previous run. `load()` returns their latest chain.
    pub fn with_heads(history_depth: u64, heads: impl IntoIterator<Item = H>) -> Self {
        let saver = Self::new(history_depth);
        {
            let mut state = saver.heads.lock().unwrap();
            for head in heads {
                state.insert(&head);
            }
        }
        saver.trim();
        saver
    }

    pub fn history_depth(&self) -> u64 {
        self.history_depth
    }

    /// Number of stored heads.
    pub fn len(&self) -> usize {
        self.heads.lock().unwrap().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &H::Hash) -> bool {
        self.heads.lock().unwrap().by_hash.contains_key(hash)
    }

    /// All stored heads with `number` (several on competing forks).
    pub fn heads_at(&self, number: u64) -> Vec<H> {
        let state = self.heads.lock().unwrap();
        state
            .by_number
            .get(&number)
            .map(|hashes| {
                hashes
                    .iter()
                    .filter_map(|h| state.by_hash.get(h).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn trim(&self) {
        let mut state = self.heads.lock().unwrap();
        let Some(latest) = state.latest_number() else {
            return;
        };
        let cutoff = latest.saturating_sub(self.history_depth);
        let removed = state.trim_below(cutoff);
        if removed > 0 {
            tracing::trace!(cutoff, removed, "Trimmed old heads");
        }
    }
}

#[async_trait]
impl<H: Head> HeadSaver<H> for InMemoryHeadSaver<H> {
    async fn save(&self, head: &H) -> Result<(), ChainHeadError> {
        self.heads.lock().unwrap().insert(head);
        self.trim();
        Ok(())
    }

    async fn load(&self) -> Result<Option<H>, ChainHeadError> {
        Ok(self.latest_chain())
    }

    fn latest_chain(&self) -> Option<H> {
        let state = self.heads.lock().unwrap();
        let hash = state.latest.clone()?;
        state.chain(&hash, self.history_depth + 1)
    }

    fn chain(&self, hash: &H::Hash) -> Option<H> {
        self.heads.lock().unwrap().chain(hash, self.history_depth + 1)
    }
}
