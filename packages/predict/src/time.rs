//! Timestamp parsing and calendar feature derivation in a fixed civil
//! timezone.

use chrono::{
    DateTime, Datelike as _, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, Offset as _,
    TimeZone as _, Timelike as _, Utc,
};
use chrono_tz::Tz;
use parking_finder_parking_models::TimeContext;

/// Civil timezone the classifier was trained in.
pub const DEFAULT_TIME_ZONE: Tz = chrono_tz::Australia::Melbourne;

/// Errors from timestamp handling.
#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    /// The input could not be parsed as an ISO-8601 timestamp.
    #[error("Invalid timestamp: {input}")]
    InvalidTimestamp {
        /// The rejected input.
        input: String,
    },

    /// The timestamp is not strictly in the future.
    #[error("Timestamp {timestamp} is not in the future")]
    NotInFuture {
        /// The rejected timestamp, as RFC 3339.
        timestamp: String,
    },

    /// The configured timezone name is unknown.
    #[error("Unknown time zone: {name}")]
    UnknownZone {
        /// The rejected zone name.
        name: String,
    },
}

/// Parses an IANA zone name such as `Australia/Melbourne`.
///
/// # Errors
///
/// Returns [`TimeError::UnknownZone`] for unknown names.
pub fn parse_zone(name: &str) -> Result<Tz, TimeError> {
    name.parse().map_err(|_| TimeError::UnknownZone {
        name: name.to_string(),
    })
}

/// Parses an ISO-8601 timestamp and converts it to `zone`.
///
/// Timestamps without an offset are taken as civil time in `zone`. Local
/// times inside a DST gap move forward by the length of the gap; local
/// times in a DST fold resolve to the earlier instant.
///
/// # Errors
///
/// Returns [`TimeError::InvalidTimestamp`] if the input is not a supported
/// ISO-8601 shape.
pub fn parse_in_zone(input: &str, zone: Tz) -> Result<DateTime<Tz>, TimeError> {
    let invalid = || TimeError::InvalidTimestamp {
        input: input.to_string(),
    };
    let trimmed = input.trim();

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
        return Ok(localize(midnight, zone));
    }

    let normalized = normalize_separator(trimmed);
    if let Some(instant) = parse_with_offset(&normalized) {
        return Ok(instant.with_timezone(&zone));
    }
    let naive = parse_naive(&normalized).ok_or_else(invalid)?;
    Ok(localize(naive, zone))
}

/// Uppercases the date/time separator and accepts a space in its place.
fn normalize_separator(s: &str) -> String {
    match s.get(10..11) {
        Some(" " | "t") => format!("{}T{}", &s[..10], &s[11..]),
        _ => s.to_string(),
    }
}

/// Parses a timestamp carrying `Z` or a `±HH`, `±HHMM`, or `±HH:MM` offset.
fn parse_with_offset(s: &str) -> Option<DateTime<FixedOffset>> {
    const FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M%#z"];
    let s = match s.strip_suffix(['Z', 'z']) {
        Some(local) => format!("{local}+00:00"),
        None => s.to_string(),
    };
    FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(&s, format).ok())
}

fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];
    FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
}

/// Maps a civil time in `zone` to an instant.
fn localize(naive: NaiveDateTime, zone: Tz) -> DateTime<Tz> {
    match zone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earlier, _) => earlier,
        LocalResult::None => {
            // Gap: read the wall clock with the offset in force before the
            // transition, which lands the same distance past its end.
            let before = naive - chrono::Duration::hours(24);
            let offset = zone.offset_from_utc_datetime(&before).fix();
            let utc = naive - chrono::Duration::seconds(i64::from(offset.local_minus_utc()));
            zone.from_utc_datetime(&utc)
        }
    }
}

/// Calendar features of an instant already in the target zone.
#[must_use]
pub fn time_context_of(instant: &DateTime<Tz>) -> TimeContext {
    TimeContext {
        hour: instant.hour(),
        weekday: instant.weekday().num_days_from_monday(),
        month: instant.month(),
    }
}

/// Parses `input` and derives its calendar features in `zone`.
///
/// # Errors
///
/// Returns [`TimeError::InvalidTimestamp`] if the input cannot be parsed.
pub fn to_time_context(input: &str, zone: Tz) -> Result<TimeContext, TimeError> {
    parse_in_zone(input, zone).map(|instant| time_context_of(&instant))
}

/// Rejects instants that are not strictly after `now`.
///
/// # Errors
///
/// Returns [`TimeError::NotInFuture`] when `instant <= now`.
pub fn ensure_future(instant: &DateTime<Tz>, now: DateTime<Utc>) -> Result<(), TimeError> {
    if instant.with_timezone(&Utc) > now {
        Ok(())
    } else {
        Err(TimeError::NotInFuture {
            timestamp: instant.to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Offset as _, Timelike as _};

    use super::*;

    const MELB: Tz = DEFAULT_TIME_ZONE;

    #[test]
    fn naive_timestamp_is_local_civil_time() {
        let ctx = to_time_context("2024-03-04T09:00:00", MELB).unwrap();
        assert_eq!(
            ctx,
            TimeContext {
                hour: 9,
                weekday: 0,
                month: 3
            }
        );
    }

    #[test]
    fn offsets_are_converted_into_zone() {
        // 2024-06-11 04:00 UTC is 14:00 AEST (UTC+10), a Tuesday.
        for input in [
            "2024-06-11T04:00:00Z",
            "2024-06-11T04:00:00+00:00",
            "2024-06-11T06:00:00+0200",
            "2024-06-11T01:00:00-03",
            "2024-06-11 04:00Z",
            "2024-06-11t04:00:00.500z",
            "2024-06-11T14:30:00+10:30",
            "2024-06-11T14:30+1030",
        ] {
            let ctx = to_time_context(input, MELB).unwrap();
            assert_eq!(
                ctx,
                TimeContext {
                    hour: 14,
                    weekday: 1,
                    month: 6
                },
                "{input}"
            );
        }
    }

    #[test]
    fn accepts_fractions_minutes_and_bare_dates() {
        let ctx = to_time_context("2024-03-04T09:15:30.250", MELB).unwrap();
        assert_eq!(ctx.hour, 9);
        let ctx = to_time_context("2024-03-04 23:59", MELB).unwrap();
        assert_eq!(ctx.hour, 23);
        let ctx = to_time_context("2024-03-10", MELB).unwrap();
        assert_eq!((ctx.hour, ctx.weekday, ctx.month), (0, 6, 3));
    }

    #[test]
    fn rejects_garbage() {
        for input in ["", "yesterday", "2024-13-01T00:00:00", "2024-03-04T09:00:00+5", "2024-03-04T25:00"] {
            assert!(
                matches!(
                    to_time_context(input, MELB),
                    Err(TimeError::InvalidTimestamp { .. })
                ),
                "{input}"
            );
        }
    }

    #[test]
    fn dst_gap_moves_forward() {
        // Melbourne clocks jump from 02:00 to 03:00 on 2024-10-06.
        let instant = parse_in_zone("2024-10-06T02:30:00", MELB).unwrap();
        assert_eq!(instant.hour(), 3);
        assert_eq!(instant.minute(), 30);
    }

    #[test]
    fn dst_fold_takes_earlier_instant() {
        // Melbourne clocks fall back from 03:00 to 02:00 on 2024-04-07.
        let instant = parse_in_zone("2024-04-07T02:30:00", MELB).unwrap();
        assert_eq!(instant.offset().fix().local_minus_utc(), 11 * 3600);
    }

    #[test]
    fn future_check_is_strict() {
        let instant = parse_in_zone("2024-03-04T09:00:00", MELB).unwrap();
        let same = instant.with_timezone(&Utc);
        assert!(matches!(
            ensure_future(&instant, same),
            Err(TimeError::NotInFuture { .. })
        ));
        assert!(ensure_future(&instant, same - chrono::Duration::seconds(1)).is_ok());
    }

    #[test]
    fn parses_zone_names() {
        assert_eq!(parse_zone("Australia/Melbourne").unwrap(), MELB);
        assert!(matches!(
            parse_zone("Mars/Olympus_Mons"),
            Err(TimeError::UnknownZone { .. })
        ));
    }
}
