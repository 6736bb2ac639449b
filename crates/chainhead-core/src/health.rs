//! Health reporting contract and the bounded service-error buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::error::ChainHeadError;

/// Component name → `None` when healthy, the current error otherwise.
pub type HealthReport = HashMap<String, Option<ChainHeadError>>;

/// Implemented by every long-running component.
pub trait HealthReporter {
    /// Stable component name used as the report key.
    fn name(&self) -> String;

    /// Health of this component and of the components it owns.
    fn health_report(&self) -> HealthReport;
}

/// Returns `true` if no entry in `report` carries an error.
pub fn all_healthy(report: &HealthReport) -> bool {
    report.values().all(Option::is_none)
}

/// Non-fatal errors waiting to be surfaced through health reporting.
///
/// Holds at most `capacity` errors; the oldest is dropped on overflow.
/// [`ErrorBuffer::flush`] hands out everything accumulated since the last
/// flush, so a degraded state is reported once and then clears.
#[derive(Debug)]
pub struct ErrorBuffer {
    errors: Mutex<VecDeque<ChainHeadError>>,
    capacity: usize,
}

impl ErrorBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            errors: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn append(&self, err: ChainHeadError) {
        let mut errors = self.errors.lock().unwrap();
        if errors.len() >= self.capacity {
            errors.pop_front();
        }
        errors.push_back(err);
    }

    pub fn len(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every buffered error, joined into one. `None` when empty.
    pub fn flush(&self) -> Option<ChainHeadError> {
        let drained: Vec<ChainHeadError> = self.errors.lock().unwrap().drain(..).collect();
        match drained.len() {
            0 => None,
            1 => drained.into_iter().next(),
            _ => Some(ChainHeadError::Other(
                drained
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
        }
    }
}

impl Default for ErrorBuffer {
    fn default() -> Self {
        Self::new(20)
    }
}
