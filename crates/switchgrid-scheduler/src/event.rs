//! Timer event records and occurrence arithmetic.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Store key prefix for persisted timer events.
pub const TIMER_KEY_PREFIX: &str = "timer/";

/// A persisted timer event.
///
/// `time` is the next wall-clock firing time. `recur_mins == 0` marks a
/// one-shot event; anything else repeats with that period. `version == 0`
/// flags a record written by an external editor that the scheduler has not
/// yet claimed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub recur_mins: u32,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub version: i64,
}

impl Event {
    /// One-shot event firing at `time`.
    pub fn once(id: &str, time: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            description: String::new(),
            time,
            recur_mins: 0,
            data: serde_json::Map::new(),
            version: 0,
        }
    }
}

/// Next firing time for an event anchored at `anchor`, and the delay from
/// `now` until it.
///
/// One-shot events keep their anchor; a past or imminent anchor is clamped
/// to fire in one second. Recurring events whose anchor has passed advance
/// by whole periods to the first occurrence strictly after `now`, so a
/// backlog of missed firings is never replayed one by one.
pub fn next_occurrence(
    now: DateTime<Utc>,
    anchor: DateTime<Utc>,
    recur_mins: u32,
) -> (DateTime<Utc>, Duration) {
    const MIN_DELAY: Duration = Duration::from_secs(1);

    if recur_mins == 0 || anchor > now {
        let delay = (anchor - now).to_std().unwrap_or(Duration::ZERO);
        return (anchor, delay.max(MIN_DELAY));
    }

    let period = ChronoDuration::minutes(i64::from(recur_mins));
    let elapsed = (now - anchor).num_milliseconds();
    let periods = elapsed / period.num_milliseconds() + 1;
    // Multiply in i64 milliseconds; a period count this large would wrap an
    // i32 and land the "next" occurrence in the past.
    let next = anchor + ChronoDuration::milliseconds(period.num_milliseconds() * periods);
    let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
    (next, delay.max(MIN_DELAY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_past_clamps_to_one_second() {
        let now = Utc::now();
        let anchor = now - ChronoDuration::seconds(30);
        let (next, delay) = next_occurrence(now, anchor, 0);
        assert_eq!(next, anchor);
        assert_eq!(delay, Duration::from_secs(1));
    }

    #[test]
    fn test_one_shot_future_keeps_anchor() {
        let now = Utc::now();
        let anchor = now + ChronoDuration::seconds(45);
        let (next, delay) = next_occurrence(now, anchor, 0);
        assert_eq!(next, anchor);
        assert!(delay > Duration::from_secs(44) && delay <= Duration::from_secs(45));
    }

    #[test]
    fn test_recurring_advances_whole_periods() {
        let now = Utc::now();
        let anchor = now - ChronoDuration::seconds(130);
        let (next, delay) = next_occurrence(now, anchor, 1);
        assert_eq!(next, anchor + ChronoDuration::seconds(180));
        assert!(next > now);
        assert_eq!((next - anchor).num_seconds() % 60, 0);
        assert!(delay <= Duration::from_secs(50));
    }

    #[test]
    fn test_recurring_on_boundary_is_strictly_future() {
        let now = Utc::now();
        let anchor = now - ChronoDuration::minutes(5);
        let (next, _) = next_occurrence(now, anchor, 5);
        assert_eq!(next, now + ChronoDuration::minutes(5));
    }

    #[test]
    fn test_recurring_ancient_anchor_still_advances_into_future() {
        // A 1-minute period with an anchor millennia back needs more than
        // i32::MAX periods to catch up; the count must not wrap.
        let now = Utc::now();
        let anchor = now - ChronoDuration::minutes(i64::from(i32::MAX) + 5);
        let (next, delay) = next_occurrence(now, anchor, 1);
        assert!(next > now);
        assert!(next <= now + ChronoDuration::minutes(1));
        assert_eq!((next - anchor).num_seconds() % 60, 0);
        assert!(delay <= Duration::from_secs(60));
    }

    #[test]
    fn test_recurring_future_anchor_unchanged() {
        let now = Utc::now();
        let anchor = now + ChronoDuration::minutes(3);
        let (next, _) = next_occurrence(now, anchor, 10);
        assert_eq!(next, anchor);
    }
}
