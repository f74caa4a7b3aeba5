//! Wall-clock conversions in the booking timezone.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::{Ms, Span};

/// Calendar date of an instant as seen in `tz`.
pub fn local_date(tz: Tz, at: Ms) -> NaiveDate {
    match DateTime::<Utc>::from_timestamp_millis(at) {
        Some(utc) => utc.with_timezone(&tz).date_naive(),
        None => NaiveDate::MIN,
    }
}

/// Instant of a wall-clock time on `date` in `tz`. Ambiguous times take the
/// earliest instant; times in a DST gap do not exist and yield `None`.
pub fn local_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<Ms> {
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// `[midnight, next midnight)` of `date` in `tz`.
pub fn day_span(tz: Tz, date: NaiveDate) -> Span {
    let start = local_midnight(tz, date);
    let end = local_midnight(tz, date + Duration::days(1));
    Span::new(start, end)
}

fn local_midnight(tz: Tz, date: NaiveDate) -> Ms {
    // Some zones skip midnight on DST day; walk forward to the first valid minute.
    let mut time = NaiveTime::MIN;
    for _ in 0..180 {
        if let Some(ms) = local_instant(tz, date, time) {
            return ms;
        }
        time += Duration::minutes(1);
    }
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// 0 = Sunday … 6 = Saturday.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Every calendar date from `from` to `to` inclusive.
pub fn dates_between(from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    from.iter_days().take_while(move |d| *d <= to)
}

pub fn format_local(tz: Tz, at: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(at) {
        Some(utc) => utc.with_timezone(&tz).format("%Y-%m-%d %H:%M").to_string(),
        None => at.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn date_follows_timezone_not_utc() {
        // 2025-03-03 23:30 UTC is already 2025-03-04 in Berlin.
        let at = date(2025, 3, 3).and_hms_opt(23, 30, 0).unwrap().and_utc().timestamp_millis();
        assert_eq!(local_date(chrono_tz::UTC, at), date(2025, 3, 3));
        assert_eq!(local_date(chrono_tz::Europe::Berlin, at), date(2025, 3, 4));
    }

    #[test]
    fn weekday_zero_is_sunday() {
        assert_eq!(weekday_index(date(2025, 3, 2)), 0); // Sunday
        assert_eq!(weekday_index(date(2025, 3, 3)), 1); // Monday
        assert_eq!(weekday_index(date(2025, 3, 8)), 6); // Saturday
    }

    #[test]
    fn dst_gap_has_no_instant() {
        // Europe/Berlin jumps 02:00 → 03:00 on 2025-03-30.
        let tz = chrono_tz::Europe::Berlin;
        let t = NaiveTime::from_hms_opt(2, 30, 0).unwrap();
        assert!(local_instant(tz, date(2025, 3, 30), t).is_none());
        let span = day_span(tz, date(2025, 3, 30));
        assert_eq!(span.duration_ms(), 23 * 3_600_000);
    }

    #[test]
    fn dates_between_is_inclusive() {
        let days: Vec<_> = dates_between(date(2025, 1, 30), date(2025, 2, 2)).collect();
        assert_eq!(days.len(), 4);
        assert_eq!(days[3], date(2025, 2, 2));
    }
}
