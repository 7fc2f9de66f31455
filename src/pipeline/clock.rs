//! Run clock and fetch-time rounding.

use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant. Handy for replaying a given day.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Nearest hour; minute < 30 rounds down.
pub fn round_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let floor = ts.duration_trunc(Duration::hours(1)).unwrap_or(ts);
    if ts.minute() < 30 {
        floor
    } else {
        floor + Duration::hours(1)
    }
}

/// Nearest ten minutes; `minute % 10 < 5` rounds down.
pub fn round_to_ten_minutes(ts: DateTime<Utc>) -> DateTime<Utc> {
    let floor = ts.duration_trunc(Duration::minutes(10)).unwrap_or(ts);
    if ts.minute() % 10 < 5 {
        floor
    } else {
        floor + Duration::minutes(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn hour_rounding() {
        assert_eq!(round_to_hour(at(9, 29, 59)), at(9, 0, 0));
        assert_eq!(round_to_hour(at(9, 30, 0)), at(10, 0, 0));
        assert_eq!(
            round_to_hour(at(23, 45, 0)),
            Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn ten_minute_rounding() {
        assert_eq!(round_to_ten_minutes(at(9, 14, 59)), at(9, 10, 0));
        assert_eq!(round_to_ten_minutes(at(9, 15, 0)), at(9, 20, 0));
        assert_eq!(round_to_ten_minutes(at(9, 58, 0)), at(10, 0, 0));
    }
}
