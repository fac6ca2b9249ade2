use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;

use crate::{
    error::{Result, TickHubError},
    models::{Quotation, QuotationRecord},
};

/// Smallest step used to keep a symbol's timestamps strictly increasing.
pub fn min_time_unit() -> Duration {
    Duration::microseconds(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Producer lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected {
        symbol: String,
        origin: String,
        first: Quotation,
    },
    Disconnected {
        symbol: String,
        reason: i32,
        ticks: u64,
    },
}

/// What a `DeInit` left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeInitSummary {
    pub symbol: String,
    pub reason: i32,
    pub ticks: u64,
    pub flushed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolStatus {
    pub symbol: String,
    pub state: ConnectionState,
    pub ticks: u64,
    pub last_known: Option<QuotationRecord>,
}

/// Push `candidate` past `last` one unit at a time until it is strictly later.
/// Sub-microsecond precision is dropped first; the store keeps microseconds.
pub fn monotonize(
    candidate: DateTime<Utc>,
    last: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>> {
    let candidate = candidate
        .duration_trunc(min_time_unit())
        .unwrap_or(candidate);
    match last {
        Some(last) if candidate <= last => last
            .checked_add_signed(min_time_unit())
            .ok_or_else(|| TickHubError::InvalidInput(format!("no timestamp after {last}"))),
        _ => Ok(candidate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_monotonize() {
        let t = ts("2024-01-01T00:00:00Z");
        assert_eq!(monotonize(t, None).unwrap(), t);
        assert_eq!(
            monotonize(t + Duration::seconds(1), Some(t)).unwrap(),
            t + Duration::seconds(1)
        );
        assert_eq!(monotonize(t, Some(t)).unwrap(), t + Duration::microseconds(1));
        assert_eq!(
            monotonize(t - Duration::seconds(5), Some(t)).unwrap(),
            t + Duration::microseconds(1)
        );
    }

    #[test]
    fn test_monotonize_at_end_of_time_is_an_error() {
        let last = DateTime::<Utc>::MAX_UTC;
        let err = monotonize(last, Some(last)).unwrap_err();
        assert!(matches!(err, TickHubError::InvalidInput(_)));
    }

    #[test]
    fn test_monotonize_drops_nanoseconds() {
        let t = ts("2024-01-01T00:00:00.000001500Z");
        assert_eq!(monotonize(t, None).unwrap(), ts("2024-01-01T00:00:00.000001Z"));
    }
}
