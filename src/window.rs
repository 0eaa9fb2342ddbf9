//! Time-window evaluation for incremental collection
//!
//! Every collector classifies node timestamps against a `[since, until)`
//! window. Top-level connections are requested newest-first, so the first
//! node older than `since` ends pagination for that connection. Child
//! connections (comments, reviews) are oldest-first and only skip nodes.

use chrono::{DateTime, Utc};

/// Half-open `[since, until)` bounds; `None` means unbounded on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowBounds {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl WindowBounds {
    pub fn new(since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        Self { since, until }
    }

    /// Bounds that accept every parseable timestamp.
    pub fn unbounded() -> Self {
        Self::default()
    }
}

/// Outcome of classifying one timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowDecision {
    /// `since <= t < until`
    pub include: bool,
    /// `t >= until`: skip this node, later pages may still qualify.
    pub after_upper_bound: bool,
    /// `t < since`: on a newest-first connection, stop paging entirely.
    pub before_lower_bound: bool,
}

/// Parse an upstream timestamp. Anything that is not RFC 3339 yields `None`.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Classify `timestamp` against `bounds`.
///
/// Missing or unparseable timestamps are excluded without raising either
/// boundary flag, so they never terminate pagination on their own.
pub fn evaluate(timestamp: Option<&str>, bounds: &WindowBounds) -> WindowDecision {
    let Some(ts) = timestamp.and_then(parse_timestamp) else {
        return WindowDecision::default();
    };
    evaluate_at(ts, bounds)
}

/// [`evaluate`] for an already-parsed timestamp.
pub fn evaluate_at(ts: DateTime<Utc>, bounds: &WindowBounds) -> WindowDecision {
    let before_lower_bound = bounds.since.is_some_and(|since| ts < since);
    let after_upper_bound = bounds.until.is_some_and(|until| ts >= until);

    WindowDecision {
        include: !before_lower_bound && !after_upper_bound,
        after_upper_bound,
        before_lower_bound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use quickcheck_macros::quickcheck;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn test_half_open_bounds() {
        let bounds = WindowBounds::new(Some(at(100)), Some(at(200)));

        assert!(evaluate_at(at(100), &bounds).include);
        assert!(evaluate_at(at(199), &bounds).include);

        let upper = evaluate_at(at(200), &bounds);
        assert!(!upper.include);
        assert!(upper.after_upper_bound);
        assert!(!upper.before_lower_bound);

        let lower = evaluate_at(at(99), &bounds);
        assert!(!lower.include);
        assert!(lower.before_lower_bound);
        assert!(!lower.after_upper_bound);
    }

    #[test]
    fn test_unbounded_accepts_everything_parseable() {
        let decision = evaluate(Some("2001-01-01T00:00:00Z"), &WindowBounds::unbounded());
        assert!(decision.include);
    }

    #[test]
    fn test_missing_and_garbage_timestamps_are_excluded() {
        let bounds = WindowBounds::new(Some(at(0)), None);
        assert_eq!(evaluate(None, &bounds), WindowDecision::default());
        assert_eq!(evaluate(Some("yesterday"), &bounds), WindowDecision::default());
        assert_eq!(evaluate(Some(""), &WindowBounds::unbounded()), WindowDecision::default());
    }

    #[test]
    fn test_offsets_are_normalised() {
        let bounds = WindowBounds::new(Some(parse_timestamp("2024-05-01T12:00:00Z").unwrap()), None);
        // 13:30 at +02:00 is 11:30 UTC, before the lower bound
        let decision = evaluate(Some("2024-05-01T13:30:00+02:00"), &bounds);
        assert!(decision.before_lower_bound);
    }

    #[quickcheck]
    fn prop_include_iff_inside_window(t: i32, since: Option<i32>, until: Option<i32>) -> bool {
        let ts = at(t as i64);
        let bounds = WindowBounds::new(since.map(|s| at(s as i64)), until.map(|u| at(u as i64)));
        let expected = since.map_or(true, |s| s <= t) && until.map_or(true, |u| t < u);

        let rendered = ts.to_rfc3339();
        let decision = evaluate(Some(&rendered), &bounds);
        decision.include == expected && evaluate_at(ts, &bounds) == decision
    }

    #[quickcheck]
    fn prop_unparseable_never_included(garbage: String) -> bool {
        let bounds = WindowBounds::new(Some(at(0) - Duration::days(1)), None);
        parse_timestamp(&garbage).is_some() || !evaluate(Some(&garbage), &bounds).include
    }
}
