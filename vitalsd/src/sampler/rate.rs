//! Counter-to-rate conversion.
//!
//! OS counters (disk sectors, interface bytes) only ever grow until the
//! machine reboots or a device disappears. Each tick we diff against the
//! previous reading and divide by elapsed wall time.

use std::time::Instant;

/// Previous `(value, instant)` of one monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct RateState {
    last: Option<(u64, Instant)>,
}

impl RateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the current counter value and get the per-second rate since the
    /// previous call. The first observation and any reset (value went down)
    /// report 0.
    pub fn observe(&mut self, value: u64, now: Instant) -> f64 {
        let rate = match self.last {
            Some((prev, at)) => {
                let elapsed = now.saturating_duration_since(at).as_secs_f64();
                if elapsed <= 0.0 || value < prev {
                    0.0
                } else {
                    (value - prev) as f64 / elapsed
                }
            }
            None => 0.0,
        };
        self.last = Some((value, now));
        rate
    }

    pub fn is_primed(&self) -> bool {
        self.last.is_some()
    }
}

/// A pair of counters read together (read/write, sent/received).
#[derive(Debug, Clone, Default)]
pub struct CounterPair {
    first: RateState,
    second: RateState,
}

impl CounterPair {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, values: (u64, u64), now: Instant) -> (f64, f64) {
        (
            self.first.observe(values.0, now),
            self.second.observe(values.1, now),
        )
    }
}
