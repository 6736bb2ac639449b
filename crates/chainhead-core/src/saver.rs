//! Persistence contract consumed by the tracker.

use async_trait::async_trait;

use crate::error::ChainHeadError;
use crate::head::Head;

/// Stores heads and materializes their in-memory chains.
///
/// `save` and `load` may hit durable storage; `chain` and `latest_chain` are
/// expected to be answered from memory.
#[async_trait]
pub trait HeadSaver<H: Head>: Send + Sync + 'static {
    /// Persist `head`. Saving a head that is already known is not an error.
    async fn save(&self, head: &H) -> Result<(), ChainHeadError>;

    /// Load previously persisted heads and return the latest chain, if any.
    async fn load(&self) -> Result<Option<H>, ChainHeadError>;

    /// The highest known head, linked to its in-memory ancestors.
    fn latest_chain(&self) -> Option<H>;

    /// The head with `hash`, linked to its in-memory ancestors.
    fn chain(&self, hash: &H::Hash) -> Option<H>;
}
