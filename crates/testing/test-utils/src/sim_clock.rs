use chrono::{DateTime, Utc};
use concepts::time::ClockFn;
use std::{sync::Arc, time::Duration};
use tracing::debug;

/// Manually driven clock shared between the test and the code under test.
#[derive(Clone)]
pub struct SimClock {
    current_time: Arc<std::sync::Mutex<DateTime<Utc>>>,
}

impl SimClock {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(std::sync::Mutex::new(now)),
        }
    }

    /// Called by a test to move the time forward.
    pub fn move_time_forward(&self, duration: Duration) {
        let mut guard = self.current_time.lock().unwrap();
        let old = *guard;
        *guard = old + duration;
        debug!(from = %old, to = %*guard, "Clock moved");
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap())
    }
}

impl ClockFn for SimClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current_time.lock().unwrap()
    }
}
