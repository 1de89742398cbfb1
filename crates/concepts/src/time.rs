use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

pub trait ClockFn: Send + Sync + Clone + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Debug, Default)]
pub struct Now;

impl ClockFn for Now {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant.
#[derive(Clone, Debug)]
pub struct ConstClock(pub DateTime<Utc>);

impl ClockFn for ConstClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Half-open interval `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Window of length `duration` ending at `end`.
    #[must_use]
    pub fn trailing(end: DateTime<Utc>, duration: Duration) -> TimeWindow {
        let duration = TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
        TimeWindow {
            start: end.checked_sub_signed(duration).unwrap_or(DateTime::<Utc>::MIN_UTC),
            end,
        }
    }

    #[must_use]
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_window_is_half_open() {
        let end = DateTime::from_timestamp(1_000, 0).unwrap();
        let window = TimeWindow::trailing(end, Duration::from_secs(300));
        assert_eq!(DateTime::from_timestamp(700, 0).unwrap(), window.start);
        assert!(window.contains(window.start));
        assert!(!window.contains(end));
    }
}
