//! Wall-clock and simulated timestamp sources.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const NANOS_PER_SEC: f64 = 1_000_000_000.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("system clock is before the unix epoch")]
    BeforeEpoch,
    #[error("timestamp does not fit in 64 bits")]
    Overflow,
}

/// Source of wall-clock timestamps in nanoseconds since the unix epoch.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> Result<u64, ClockError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> Result<u64, ClockError> {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| ClockError::BeforeEpoch)?;
        u64::try_from(since_epoch.as_nanos()).map_err(|_| ClockError::Overflow)
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_nanos: u64) -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new(start_nanos)),
        }
    }

    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: f64) {
        let delta = (secs * NANOS_PER_SEC) as u64;
        self.nanos.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> Result<u64, ClockError> {
        Ok(self.nanos.load(Ordering::SeqCst))
    }
}
