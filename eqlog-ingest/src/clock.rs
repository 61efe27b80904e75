//! Clock synchronization adjustor.
//!
//! Equipment clocks drift; every stored row carries a corrected `serv_ts` produced here. The
//! correction offset can change at any time, so callers convert one record at a time and never
//! cache the result.

use chrono::{Duration, NaiveDateTime, SubsecRound};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::info;

static GLOBAL_CLOCK: OnceLock<Arc<OffsetClock>> = OnceLock::new();

/// Converts a local equipment timestamp into the canonical wall clock.
pub trait ClockSync: Send + Sync {
    /// Returns the corrected timestamp, truncated to whole seconds.
    fn to_synchronized_wall_clock(&self, local: NaiveDateTime) -> NaiveDateTime;
}

/// Drops any sub-second component.
pub fn truncate_to_second(ts: NaiveDateTime) -> NaiveDateTime {
    ts.trunc_subsecs(0)
}

/// Adjustor applying a single correction offset that may be updated while running.
#[derive(Debug, Default)]
pub struct OffsetClock {
    offset_ms: AtomicI64,
}

impl OffsetClock {
    pub fn new(offset_ms: i64) -> Self {
        Self {
            offset_ms: AtomicI64::new(offset_ms),
        }
    }

    /// Process-wide instance, created with a zero offset on first use.
    pub fn global() -> Arc<OffsetClock> {
        GLOBAL_CLOCK
            .get_or_init(|| Arc::new(OffsetClock::default()))
            .clone()
    }

    pub fn set_offset_ms(&self, offset_ms: i64) {
        let previous = self.offset_ms.swap(offset_ms, Ordering::Relaxed);
        if previous != offset_ms {
            info!(previous, offset_ms, "clock correction offset updated");
        }
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }
}

impl ClockSync for OffsetClock {
    fn to_synchronized_wall_clock(&self, local: NaiveDateTime) -> NaiveDateTime {
        let base = truncate_to_second(local);
        let corrected = base
            .checked_add_signed(Duration::milliseconds(self.offset_ms()))
            .unwrap_or(base);
        truncate_to_second(corrected)
    }
}
