//! Start/stop state machine shared by the tracker and the broadcaster.
//!
//! `NotStarted → Starting → Started → Stopping → Stopped`; every transition is
//! a compare-and-swap, so concurrent `start`/`close` calls resolve to exactly
//! one winner.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::ChainHeadError;

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    NotStarted = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
    Stopped = 4,
}

impl ServiceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotStarted,
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not-started"),
            Self::Starting => write!(f, "starting"),
            Self::Started => write!(f, "started"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Outcome of a `begin_*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The caller won the transition and must complete it.
    Proceed,
    /// Another call already did (or is doing) the work.
    AlreadyDone,
}

/// Atomic lifecycle guard.
#[derive(Debug)]
pub struct StateMachine {
    name: &'static str,
    state: AtomicU8,
}

impl StateMachine {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: AtomicU8::new(ServiceState::NotStarted as u8),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn cas(&self, from: ServiceState, to: ServiceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `NotStarted → Starting`. Starting twice is a no-op; starting a
    /// stopped service is an error.
    pub fn begin_start(&self) -> Result<Transition, ChainHeadError> {
        if self.cas(ServiceState::NotStarted, ServiceState::Starting) {
            return Ok(Transition::Proceed);
        }
        match self.state() {
            ServiceState::Starting | ServiceState::Started => Ok(Transition::AlreadyDone),
            _ => Err(ChainHeadError::AlreadyStopped {
                name: self.name.to_string(),
            }),
        }
    }

    /// `Starting → Started` on success, `Starting → Stopped` on failure.
    pub fn finish_start(&self, ok: bool) {
        let to = if ok {
            ServiceState::Started
        } else {
            ServiceState::Stopped
        };
        if !self.cas(ServiceState::Starting, to) {
            tracing::debug!(service = self.name, state = %self.state(), "start finished after close");
        }
    }

    /// Enter `Stopping` from any live state. A service that never started goes
    /// straight to `Stopped` and reports `AlreadyDone`.
    pub fn begin_stop(&self) -> Transition {
        if self.cas(ServiceState::NotStarted, ServiceState::Stopped) {
            return Transition::AlreadyDone;
        }
        if self.cas(ServiceState::Started, ServiceState::Stopping)
            || self.cas(ServiceState::Starting, ServiceState::Stopping)
        {
            return Transition::Proceed;
        }
        Transition::AlreadyDone
    }

    /// `Stopping → Stopped`.
    pub fn finish_stop(&self) {
        self.state
            .store(ServiceState::Stopped as u8, Ordering::Release);
    }

    /// `Ok` only while `Started`.
    pub fn healthy(&self) -> Result<(), ChainHeadError> {
        match self.state() {
            ServiceState::Started => Ok(()),
            ServiceState::NotStarted | ServiceState::Starting => Err(ChainHeadError::NotStarted {
                name: self.name.to_string(),
            }),
            ServiceState::Stopping | ServiceState::Stopped => {
                Err(ChainHeadError::AlreadyStopped {
                    name: self.name.to_string(),
                })
            }
        }
    }
}
