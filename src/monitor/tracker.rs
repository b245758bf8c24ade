use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Per-name sliding window of restart-like event timestamps with an
/// entry-into-loop edge. Lives only in memory; authoritative loop state is
/// the persisted container row, re-seeded at startup.
pub struct RestartTracker {
    window: Duration,
    threshold: usize,
    inner: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    data: HashMap<String, Vec<DateTime<Utc>>>,
    looping: HashSet<String>,
}

impl RestartTracker {
    pub fn new(window_seconds: u64, threshold: usize) -> Self {
        Self {
            window: Duration::seconds(window_seconds as i64),
            threshold,
            inner: Mutex::new(TrackerState::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a restart-like event. Returns the current in-window streak and
    /// whether this record crossed the threshold for the first time since
    /// the last heal.
    pub fn record(&self, name: &str, ts: DateTime<Utc>) -> (usize, bool) {
        let mut state = self.inner.lock().expect("restart tracker lock poisoned");
        let cut = ts - self.window;
        let series = state.data.entry(name.to_string()).or_default();
        series.push(ts);
        series.retain(|t| *t >= cut);
        let streak = series.len();

        let mut entered_loop = false;
        if streak >= self.threshold {
            if !state.looping.contains(name) {
                entered_loop = true;
            }
            state.looping.insert(name.to_string());
        }
        (streak, entered_loop)
    }

    pub fn in_loop(&self, name: &str) -> bool {
        let state = self.inner.lock().expect("restart tracker lock poisoned");
        state.looping.contains(name)
    }

    pub fn reset(&self, name: &str) {
        let mut state = self.inner.lock().expect("restart tracker lock poisoned");
        state.data.remove(name);
        state.looping.remove(name);
    }

    pub fn mark_healed(&self, name: &str) {
        self.reset(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-01T10:00:00Z")
            .expect("parse base timestamp")
            .with_timezone(&Utc)
            + Duration::seconds(offset_secs)
    }

    #[test]
    fn test_entered_loop_fires_exactly_once_per_crossing() {
        let tracker = RestartTracker::new(30, 3);

        assert_eq!(tracker.record("web", ts(0)), (1, false));
        assert_eq!(tracker.record("web", ts(5)), (2, false));
        assert_eq!(tracker.record("web", ts(12)), (3, true));
        assert!(tracker.in_loop("web"));

        // Further records keep the loop without re-reporting the edge.
        assert_eq!(tracker.record("web", ts(15)), (4, false));

        tracker.mark_healed("web");
        assert!(!tracker.in_loop("web"));

        // After healing the next threshold crossing reports the edge again.
        assert_eq!(tracker.record("web", ts(60)), (1, false));
        assert_eq!(tracker.record("web", ts(61)), (2, false));
        assert_eq!(tracker.record("web", ts(62)), (3, true));
    }

    #[test]
    fn test_window_prunes_old_entries() {
        let tracker = RestartTracker::new(30, 3);
        tracker.record("web", ts(0));
        tracker.record("web", ts(5));
        // 40 s later both earlier entries fall out of the window.
        assert_eq!(tracker.record("web", ts(40)), (1, false));
        assert!(!tracker.in_loop("web"));
    }

    #[test]
    fn test_reset_clears_series_and_flag() {
        let tracker = RestartTracker::new(30, 2);
        tracker.record("web", ts(0));
        tracker.record("web", ts(1));
        assert!(tracker.in_loop("web"));

        tracker.reset("web");
        assert!(!tracker.in_loop("web"));
        assert_eq!(tracker.record("web", ts(2)), (1, false));
    }

    #[test]
    fn test_names_are_tracked_independently() {
        let tracker = RestartTracker::new(30, 2);
        tracker.record("a", ts(0));
        tracker.record("a", ts(1));
        tracker.record("b", ts(1));
        assert!(tracker.in_loop("a"));
        assert!(!tracker.in_loop("b"));
    }
}
