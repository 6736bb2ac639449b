//! chainhead-storage: head saver backends for ChainHead.
//!
//! Backends:
//! - [`memory`]: in-memory, bounded by the configured history depth

pub mod memory;

pub use memory::InMemoryHeadSaver;
