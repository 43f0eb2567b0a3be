//! Clock and identifier ports.
//!
//! Components take these by `Arc` so tests can pin time and ids instead of
//! reaching for `Utc::now()` and `Uuid::new_v4()` directly.

use chrono::{DateTime, Utc};
use std::time::Instant;
use uuid::Uuid;

pub trait Clock: Send + Sync {
    /// Wall-clock time, used for persisted timestamps.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic time, used for latency measurement.
    fn monotonic(&self) -> Instant;
}

pub trait IdSource: Send + Sync {
    fn next_id(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UuidSource;

impl IdSource for UuidSource {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_source_yields_unique_opaque_ids() {
        let ids = UuidSource;
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
