//! Cron expression parsing and timezone-aware next-occurrence computation.
//!
//! Supported grammar:
//!
//! ```text
//! [second] minute hour day-of-month month day-of-week
//! ```
//!
//! Each field accepts `*`, single values, ranges (`a-b`), steps (`*/n`, `a-b/n`, `a/n`)
//! and comma separated lists of those. Months accept `JAN`-`DEC`, weekdays accept
//! `SUN`-`SAT` and both `0` and `7` mean Sunday. `?` is accepted as `*` in the two day
//! fields. The macros `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`,
//! `@midnight` and `@hourly` expand to their usual five-field forms.
//!
//! When both day-of-month and day-of-week are restricted a day matches if *either*
//! field matches. A field counts as restricted unless it starts with `*` or `?`.
//!
//! # DST policy
//!
//! Fields are matched against local civil time in the job's timezone.
//!
//! - A local time inside a spring-forward gap is rounded forward to the first valid
//!   instant after the gap (e.g. `02:30` on a day where clocks jump from `02:00` to
//!   `03:00` fires at `03:00`).
//! - A local time inside a fall-back overlap resolves to the earlier of its two instants.
//!   The later instant is never fired for the same local time.
//!
//! The evaluator holds no state; every function here is safe to call concurrently.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TempoError};

/// How far past `after` the search may go before the expression is declared unsatisfiable.
const SEARCH_HORIZON_YEARS: i32 = 8;

/// Upper bound on minutes tried when rounding out of a DST gap.
const MAX_GAP_MINUTES: i64 = 24 * 60;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

// ═══════════════════════════════════════════════════════════════════════════════
// Cron Expression
// ═══════════════════════════════════════════════════════════════════════════════

/// A parsed cron expression.
///
/// Each field is stored as a bitset indexed by its numeric value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpression {
    /// Parse an expression, rejecting anything outside the supported grammar.
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let expanded = expand_macro(trimmed)?;
        let fields: Vec<&str> = expanded.split_whitespace().collect();

        let (seconds_field, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => {
                return Err(TempoError::invalid_schedule(format!(
                    "cron expression '{}' has {} fields, expected 5 or 6",
                    trimmed, n
                )))
            }
        };

        let seconds = parse_field(seconds_field, FieldKind::Second)?;
        let minutes = parse_field(rest[0], FieldKind::Minute)?;
        let hours = parse_field(rest[1], FieldKind::Hour)?;
        let days_of_month = parse_field(rest[2], FieldKind::DayOfMonth)?;
        let months = parse_field(rest[3], FieldKind::Month)?;
        let mut days_of_week = parse_field(rest[4], FieldKind::DayOfWeek)?;

        // 7 is an alias for Sunday.
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: trimmed.to_string(),
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: is_restricted(rest[2]),
            dow_restricted: is_restricted(rest[4]),
        })
    }

    /// The expression as written by the caller.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Compute the first instant strictly after `after` that matches this expression
    /// in `timezone`.
    pub fn next_after(&self, timezone: &Tz, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let local = after.with_timezone(timezone).naive_local();
        let start = local.with_nanosecond(0).unwrap_or(local) + Duration::seconds(1);
        let horizon = start.year() + SEARCH_HORIZON_YEARS;

        let mut date = start.date();
        let (mut hour, mut minute, mut second) = (start.hour(), start.minute(), start.second());

        loop {
            if date.year() > horizon {
                return Err(TempoError::invalid_schedule(format!(
                    "cron expression '{}' has no occurrence within {} years",
                    self.source, SEARCH_HORIZON_YEARS
                )));
            }

            if !has_bit(self.months, date.month()) {
                date = first_of_next_month(date)?;
                (hour, minute, second) = (0, 0, 0);
                continue;
            }

            if !self.day_matches(date) {
                date = next_day(date)?;
                (hour, minute, second) = (0, 0, 0);
                continue;
            }

            let Some((h, m, s)) = self.next_time_in_day(hour, minute, second) else {
                date = next_day(date)?;
                (hour, minute, second) = (0, 0, 0);
                continue;
            };

            let candidate = date
                .and_hms_opt(h, m, s)
                .ok_or_else(|| TempoError::internal("cron search produced an invalid time"))?;

            if let Some(instant) = resolve_local(timezone, candidate) {
                if instant > after {
                    return Ok(instant);
                }
            }

            (hour, minute, second) = (h, m, s + 1);
        }
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has_bit(self.days_of_month, date.day());
        let dow = has_bit(self.days_of_week, date.weekday().num_days_from_sunday());

        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Earliest matching `(hour, minute, second)` at or after the given time of day.
    fn next_time_in_day(&self, mut hour: u32, mut minute: u32, mut second: u32) -> Option<(u32, u32, u32)> {
        loop {
            let h = next_bit(self.hours, hour)?;
            if h != hour {
                (hour, minute, second) = (h, 0, 0);
            }

            let Some(m) = next_bit(self.minutes, minute) else {
                (hour, minute, second) = (hour + 1, 0, 0);
                continue;
            };
            if m != minute {
                (minute, second) = (m, 0);
            }

            match next_bit(self.seconds, second) {
                Some(s) => return Some((hour, minute, s)),
                None => (minute, second) = (minute + 1, 0),
            }
        }
    }
}

impl FromStr for CronExpression {
    type Err = TempoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Public Helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Parse an IANA timezone identifier.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| TempoError::invalid_schedule(format!("unknown timezone '{}'", name)))
}

/// Next instant strictly after `after` at which `expression` fires in `timezone`.
pub fn next_occurrence(expression: &str, timezone: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let tz = parse_timezone(timezone)?;
    CronExpression::parse(expression)?.next_after(&tz, after)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Local Time Resolution
// ═══════════════════════════════════════════════════════════════════════════════

/// Map a local wall-clock time to an instant using the gap/overlap policy above.
fn resolve_local(timezone: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    if let Some(dt) = timezone.from_local_datetime(&local).earliest() {
        return Some(dt.with_timezone(&Utc));
    }

    // Inside a gap: walk forward minute by minute until wall-clock time exists again.
    let mut candidate = local.with_second(0).unwrap_or(local);
    for _ in 0..MAX_GAP_MINUTES {
        candidate += Duration::minutes(1);
        if let Some(dt) = timezone.from_local_datetime(&candidate).earliest() {
            return Some(dt.with_timezone(&Utc));
        }
    }
    None
}

fn next_day(date: NaiveDate) -> Result<NaiveDate> {
    date.succ_opt()
        .ok_or_else(|| TempoError::invalid_schedule("cron search ran past the supported calendar"))
}

fn first_of_next_month(date: NaiveDate) -> Result<NaiveDate> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| TempoError::invalid_schedule("cron search ran past the supported calendar"))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Field Parsing
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
enum FieldKind {
    Second,
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl FieldKind {
    fn name(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::DayOfMonth => "day-of-month",
            Self::Month => "month",
            Self::DayOfWeek => "day-of-week",
        }
    }

    /// Inclusive value range.
    fn bounds(self) -> (u32, u32) {
        match self {
            Self::Second | Self::Minute => (0, 59),
            Self::Hour => (0, 23),
            Self::DayOfMonth => (1, 31),
            Self::Month => (1, 12),
            Self::DayOfWeek => (0, 7),
        }
    }

    fn allows_question_mark(self) -> bool {
        matches!(self, Self::DayOfMonth | Self::DayOfWeek)
    }

    fn lookup_name(self, token: &str) -> Option<u32> {
        let upper = token.to_ascii_uppercase();
        match self {
            Self::Month => MONTH_NAMES.iter().position(|n| *n == upper).map(|i| i as u32 + 1),
            Self::DayOfWeek => WEEKDAY_NAMES.iter().position(|n| *n == upper).map(|i| i as u32),
            _ => None,
        }
    }
}

fn expand_macro(expression: &str) -> Result<&str> {
    if !expression.starts_with('@') {
        return Ok(expression);
    }
    match expression.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Ok("0 0 1 1 *"),
        "@monthly" => Ok("0 0 1 * *"),
        "@weekly" => Ok("0 0 * * 0"),
        "@daily" | "@midnight" => Ok("0 0 * * *"),
        "@hourly" => Ok("0 * * * *"),
        _ => Err(TempoError::invalid_schedule(format!(
            "unknown cron macro '{}'",
            expression
        ))),
    }
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field.starts_with('?'))
}

fn parse_field(field: &str, kind: FieldKind) -> Result<u64> {
    let (min, max) = kind.bounds();
    let mut mask = 0u64;

    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(parse_step(step, kind)?)),
            None => (item, None),
        };

        let (start, end) = if range == "*" || (range == "?" && kind.allows_question_mark()) {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, kind)?, parse_value(b, kind)?)
        } else {
            let value = parse_value(range, kind)?;
            // `a/n` runs from `a` to the end of the field.
            if step.is_some() {
                (value, max)
            } else {
                (value, value)
            }
        };

        if start > end {
            return Err(invalid_field(kind, item, "range start is after range end"));
        }

        let step = step.unwrap_or(1) as usize;
        for value in (start..=end).step_by(step) {
            mask |= 1 << value;
        }
    }

    Ok(mask)
}

fn parse_step(step: &str, kind: FieldKind) -> Result<u32> {
    match step.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid_field(kind, step, "step must be a positive integer")),
    }
}

fn parse_value(token: &str, kind: FieldKind) -> Result<u32> {
    let (min, max) = kind.bounds();
    let value = match token.parse::<u32>() {
        Ok(v) => v,
        Err(_) => kind
            .lookup_name(token)
            .ok_or_else(|| invalid_field(kind, token, "not a number or known name"))?,
    };

    if value < min || value > max {
        return Err(invalid_field(
            kind,
            token,
            &format!("value must be between {} and {}", min, max),
        ));
    }
    Ok(value)
}

fn invalid_field(kind: FieldKind, token: &str, reason: &str) -> TempoError {
    TempoError::invalid_schedule(format!(
        "invalid {} field '{}': {}",
        kind.name(),
        token,
        reason
    ))
}

// ─── bitset helpers ───

fn has_bit(mask: u64, value: u32) -> bool {
    value < 64 && mask & (1 << value) != 0
}

/// Smallest set bit `>= from`.
fn next_bit(mask: u64, from: u32) -> Option<u32> {
    if from >= 64 {
        return None;
    }
    let shifted = mask >> from;
    if shifted == 0 {
        None
    } else {
        Some(from + shifted.trailing_zeros())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn next(expr: &str, tz: &str, after: &str) -> DateTime<Utc> {
        next_occurrence(expr, tz, utc(after)).unwrap()
    }

    #[test]
    fn test_daily_utc() {
        assert_eq!(
            next("0 2 * * *", "UTC", "2026-01-15T10:00:00Z"),
            utc("2026-01-16T02:00:00Z")
        );
    }

    #[test]
    fn test_result_is_strictly_after() {
        assert_eq!(
            next("0 2 * * *", "UTC", "2026-01-16T02:00:00Z"),
            utc("2026-01-17T02:00:00Z")
        );
        assert_eq!(
            next("* * * * *", "UTC", "2026-01-15T10:00:00.500Z"),
            utc("2026-01-15T10:01:00Z")
        );
    }

    #[test]
    fn test_weekday_range_and_names() {
        // 2026-01-15 is a Thursday.
        assert_eq!(
            next("0 9 * * MON-FRI", "UTC", "2026-01-15T10:00:00Z"),
            utc("2026-01-16T09:00:00Z")
        );
        assert_eq!(
            next("0 9 * * mon-fri", "UTC", "2026-01-16T10:00:00Z"),
            utc("2026-01-19T09:00:00Z")
        );
        assert_eq!(
            next("0 12 1 JUL *", "UTC", "2026-01-15T10:00:00Z"),
            utc("2026-07-01T12:00:00Z")
        );
    }

    #[test]
    fn test_seven_is_sunday() {
        assert_eq!(
            next("0 0 * * 7", "UTC", "2026-01-15T10:00:00Z"),
            utc("2026-01-18T00:00:00Z")
        );
        assert_eq!(
            CronExpression::parse("0 0 * * 7").unwrap().days_of_week,
            CronExpression::parse("0 0 * * 0").unwrap().days_of_week
        );
    }

    #[test]
    fn test_day_of_month_or_day_of_week() {
        // Both restricted: first of the month OR any Monday.
        assert_eq!(
            next("0 0 1 * MON", "UTC", "2026-01-15T00:00:00Z"),
            utc("2026-01-19T00:00:00Z")
        );
        // Only day-of-month restricted.
        assert_eq!(
            next("0 0 1 * *", "UTC", "2026-01-15T00:00:00Z"),
            utc("2026-02-01T00:00:00Z")
        );
        assert_eq!(
            next("0 0 1 * ?", "UTC", "2026-01-15T00:00:00Z"),
            utc("2026-02-01T00:00:00Z")
        );
    }

    #[test]
    fn test_steps_lists_and_seconds() {
        assert_eq!(
            next("*/15 * * * *", "UTC", "2026-01-15T10:07:00Z"),
            utc("2026-01-15T10:15:00Z")
        );
        assert_eq!(
            next("5,20-22 * * * *", "UTC", "2026-01-15T10:20:00Z"),
            utc("2026-01-15T10:21:00Z")
        );
        assert_eq!(
            next("10/20 * * * *", "UTC", "2026-01-15T10:31:00Z"),
            utc("2026-01-15T10:50:00Z")
        );
        assert_eq!(
            next("*/15 * * * * *", "UTC", "2026-01-15T10:00:07Z"),
            utc("2026-01-15T10:00:15Z")
        );
        assert_eq!(
            next("30 59 23 31 12 *", "UTC", "2026-01-15T10:00:00Z"),
            utc("2026-12-31T23:59:30Z")
        );
    }

    #[test]
    fn test_macros() {
        assert_eq!(
            next("@hourly", "UTC", "2026-01-15T10:20:00Z"),
            utc("2026-01-15T11:00:00Z")
        );
        assert_eq!(
            next("@yearly", "UTC", "2026-01-15T10:20:00Z"),
            utc("2027-01-01T00:00:00Z")
        );
        assert_eq!(
            next("@weekly", "UTC", "2026-01-15T10:20:00Z"),
            utc("2026-01-18T00:00:00Z")
        );
        assert!(CronExpression::parse("@fortnightly").is_err());
    }

    #[test]
    fn test_leap_day() {
        assert_eq!(
            next("0 0 29 2 *", "UTC", "2026-01-01T00:00:00Z"),
            utc("2028-02-29T00:00:00Z")
        );
    }

    #[test]
    fn test_timezone_offset() {
        // 09:00 in Tokyo is 00:00 UTC.
        assert_eq!(
            next("0 9 * * *", "Asia/Tokyo", "2026-01-15T10:00:00Z"),
            utc("2026-01-16T00:00:00Z")
        );
    }

    #[test]
    fn test_dst_gap_rounds_forward() {
        // 2026-03-08: New York clocks jump from 02:00 EST to 03:00 EDT.
        assert_eq!(
            next("30 2 * * *", "America/New_York", "2026-03-08T05:00:00Z"),
            utc("2026-03-08T07:00:00Z")
        );
        // The following day fires at the regular local time again.
        assert_eq!(
            next("30 2 * * *", "America/New_York", "2026-03-08T07:00:00Z"),
            utc("2026-03-09T06:30:00Z")
        );
    }

    #[test]
    fn test_dst_gap_never_lands_inside_gap() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let expr = CronExpression::parse("*/10 * * * *").unwrap();
        let mut after = utc("2026-03-08T06:00:00Z");
        for _ in 0..24 {
            let at = expr.next_after(&tz, after).unwrap();
            assert!(at > after);
            let local = at.with_timezone(&tz).naive_local();
            assert!(
                !(local.date() == NaiveDate::from_ymd_opt(2026, 3, 8).unwrap() && local.hour() == 2),
                "landed inside the gap: {}",
                local
            );
            after = at;
        }
    }

    #[test]
    fn test_dst_overlap_picks_earlier_instant() {
        // 2026-11-01: New York 01:00-02:00 happens twice (EDT then EST).
        assert_eq!(
            next("30 1 * * *", "America/New_York", "2026-11-01T04:00:00Z"),
            utc("2026-11-01T05:30:00Z")
        );
        // The later 01:30 EST instant is not fired again.
        assert_eq!(
            next("30 1 * * *", "America/New_York", "2026-11-01T06:00:00Z"),
            utc("2026-11-02T06:30:00Z")
        );
    }

    #[test]
    fn test_invalid_expressions() {
        for expr in [
            "",
            "* * *",
            "* * * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "5-1 * * * *",
            "*/0 * * * *",
            "abc * * * *",
            "? * * * *",
            "1,,2 * * * *",
        ] {
            let err = CronExpression::parse(expr).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidScheduleSpec, "expr: {:?}", expr);
        }
    }

    #[test]
    fn test_never_matching_expression() {
        let err = next_occurrence("0 0 30 2 *", "UTC", utc("2026-01-15T10:00:00Z")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidScheduleSpec);
    }

    #[test]
    fn test_unknown_timezone() {
        let err = next_occurrence("0 2 * * *", "Mars/Olympus", utc("2026-01-15T10:00:00Z")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidScheduleSpec);
    }

    #[test]
    fn test_display_round_trips_source() {
        let expr: CronExpression = " 0 2 * * * ".parse().unwrap();
        assert_eq!(expr.to_string(), "0 2 * * *");
        assert_eq!(expr.as_str(), "0 2 * * *");
    }
}
