//! Progress throttling.
//!
//! Callbacks fire at most every [`ProgressThrottle::MIN_INTERVAL`]
//! unless progress jumped by at least five percent since the last
//! emission. Terminal reports (fraction 1.0) always pass.

use std::time::{Duration, Instant};

pub struct ProgressThrottle {
    min_interval: Duration,
    min_delta: f64,
    last_emit: Option<Instant>,
    last_fraction: f64,
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(Self::MIN_INTERVAL, Self::MIN_DELTA)
    }
}

impl ProgressThrottle {
    pub const MIN_INTERVAL: Duration = Duration::from_millis(100);
    pub const MIN_DELTA: f64 = 0.05;

    pub fn new(min_interval: Duration, min_delta: f64) -> Self {
        Self {
            min_interval,
            min_delta,
            last_emit: None,
            last_fraction: 0.0,
        }
    }

    /// Whether a report at `fraction` (0.0..=1.0) should go out now.
    pub fn should_emit(&mut self, fraction: f64) -> bool {
        let now = Instant::now();
        let due = match self.last_emit {
            None => true,
            Some(last) => {
                now.duration_since(last) >= self.min_interval
                    || (fraction - self.last_fraction).abs() >= self.min_delta
                    || fraction >= 1.0
            }
        };
        if due {
            self.last_emit = Some(now);
            self.last_fraction = fraction;
        }
        due
    }
}
