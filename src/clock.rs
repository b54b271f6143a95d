//! Engine clock: wall time in production, a logical UTC clock under a
//! configured seed so ledger records and state timestamps are byte-identical
//! across replays. Every read advances the logical clock by one second.

use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// 2025-01-01T00:00:00Z, the logical-clock epoch.
const LOGICAL_EPOCH_S: i64 = 1_735_689_600;

#[derive(Clone)]
pub struct EngineClock {
    mode: Mode,
}

#[derive(Clone)]
enum Mode {
    Wall,
    Logical(Arc<AtomicU64>),
}

impl EngineClock {
    pub fn wall() -> Self {
        Self { mode: Mode::Wall }
    }

    pub fn logical() -> Self {
        Self {
            mode: Mode::Logical(Arc::new(AtomicU64::new(0))),
        }
    }

    pub fn is_logical(&self) -> bool {
        matches!(self.mode, Mode::Logical(_))
    }

    fn next(&self) -> DateTime<Utc> {
        match &self.mode {
            Mode::Wall => Utc::now(),
            Mode::Logical(tick) => {
                let t = tick.fetch_add(1, Ordering::SeqCst) as i64;
                DateTime::from_timestamp(LOGICAL_EPOCH_S + t, 0)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC)
            }
        }
    }

    /// RFC3339 UTC timestamp. Advances the logical clock.
    pub fn now_rfc3339(&self) -> String {
        self.next().to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Epoch seconds. Advances the logical clock.
    pub fn now_epoch(&self) -> f64 {
        self.next().timestamp() as f64
    }
}
