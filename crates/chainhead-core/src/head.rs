//! The chain-agnostic `Head` abstraction.
//!
//! A head is one block plus an optional link to its in-memory parent. The
//! linked chain of a head may be shorter than the chain's full history: the
//! saver only materializes what it currently holds.

use std::fmt::{Debug, Display};
use std::hash::Hash;

/// One block header as seen by the tracker.
///
/// Implementations must be cheap to clone (typically an `Arc` around the
/// header data). A head's own number and hash never change after creation;
/// [`Head::with_parent`] returns a new value rather than mutating `self`.
pub trait Head: Clone + Debug + Send + Sync + 'static {
    /// Block hash type.
    type Hash: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static;
    /// Chain identifier type.
    type ChainId: Clone + Eq + Debug + Display + Send + Sync + 'static;

    /// Block number (height).
    fn block_number(&self) -> u64;

    /// Hash of this block.
    fn block_hash(&self) -> Self::Hash;

    /// Hash of the parent block.
    fn parent_hash(&self) -> Self::Hash;

    /// Chain this head belongs to.
    fn chain_id(&self) -> Self::ChainId;

    /// Returns `false` for malformed or placeholder heads that must not be
    /// tracked.
    fn is_valid(&self) -> bool;

    /// The in-memory parent, if it has been linked.
    fn parent(&self) -> Option<Self>;

    /// A copy of this head linked to `parent`.
    fn with_parent(&self, parent: Option<Self>) -> Self;

    /// Number of heads in the in-memory chain, including `self`.
    fn chain_length(&self) -> u64 {
        let mut length = 1;
        let mut current = self.parent();
        while let Some(head) = current {
            length += 1;
            current = head.parent();
        }
        length
    }

    /// The oldest head reachable through in-memory parent links.
    fn earliest_in_chain(&self) -> Self {
        let mut earliest = self.clone();
        while let Some(parent) = earliest.parent() {
            earliest = parent;
        }
        earliest
    }

    /// The head at `number` in the in-memory chain, if it is linked.
    fn head_at_height(&self, number: u64) -> Option<Self> {
        let mut current = Some(self.clone());
        while let Some(head) = current {
            if head.block_number() == number {
                return Some(head);
            }
            if head.block_number() < number {
                return None;
            }
            current = head.parent();
        }
        None
    }

    /// Returns `true` if `parent` is the direct parent of `self`.
    fn extends(&self, parent: &Self) -> bool {
        self.block_number() == parent.block_number() + 1
            && self.parent_hash() == parent.block_hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHead;

    #[test]
    fn chain_length_counts_linked_parents() {
        let chain = TestHead::chain(0, 5);
        let tip = chain.last().unwrap();
        assert_eq!(tip.block_number(), 4);
        assert_eq!(tip.chain_length(), 5);
        assert_eq!(tip.earliest_in_chain().block_number(), 0);
    }

    #[test]
    fn unlinked_head_is_its_own_earliest() {
        let head = TestHead::new(10, 0xa, 0x9);
        assert_eq!(head.chain_length(), 1);
        assert_eq!(head.earliest_in_chain().block_hash(), head.block_hash());
    }

    #[test]
    fn head_at_height_walks_linked_parents() {
        let tip = TestHead::chain(10, 5).pop().unwrap();
        assert_eq!(tip.head_at_height(12).map(|h| h.block_number()), Some(12));
        assert_eq!(tip.head_at_height(14).map(|h| h.block_number()), Some(14));
        assert!(tip.head_at_height(9).is_none());
        assert!(tip.head_at_height(15).is_none());
    }

    #[test]
    fn extends_checks_number_and_hash() {
        let parent = TestHead::new(100, 0xaa, 0x99);
        let child = TestHead::new(101, 0xbb, 0xaa);
        let gap = TestHead::new(102, 0xcc, 0xaa);
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
        assert!(!gap.extends(&parent));
    }
}
