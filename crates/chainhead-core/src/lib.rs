//! chainhead-core: chain-agnostic head tracking, reorg classification,
//! ancestor backfill and best-effort head broadcasting.
//!
//! # Architecture
//!
//! ```text
//! HeadTracker
//!    ├── HeadListener     (subscribe / resubscribe, idle alarm)
//!    ├── HeadSaver        (persistence contract, in-memory chains)
//!    ├── backfill worker  (fetch missing ancestors up to finality depth)
//!    ├── broadcast worker (sampling or every-head mode)
//!    └── HeadBroadcaster  (concurrent fan-out with per-callback timeout)
//! ```

pub mod broadcaster;
pub mod client;
pub mod config;
pub mod error;
pub mod head;
pub mod health;
pub mod lifecycle;
pub mod listener;
pub mod mailbox;
pub mod metrics;
pub mod saver;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

pub use broadcaster::{HeadBroadcaster, HeadTrackable, Unsubscriber};
pub use client::{HeadClient, HeadSubscription, SubscriptionEvent, SubscriptionSender};
pub use config::{HeadTrackerBuilder, HeadTrackerConfig};
pub use error::ChainHeadError;
pub use head::Head;
pub use health::{HealthReport, HealthReporter};
pub use lifecycle::{ServiceState, StateMachine};
pub use listener::HeadListener;
pub use mailbox::{Mailbox, MailboxMonitor};
pub use metrics::{HeadTrackerMetrics, MetricsSink, NoopMetrics, OtelMetrics};
pub use saver::HeadSaver;
pub use tracker::HeadTracker;
