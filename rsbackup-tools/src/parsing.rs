//! Integer, time-interval and time-of-day parsing, plus the `RSBACKUP_*`
//! test-time overrides (spec.md §6 "Time overrides (for testing)").

use anyhow::{bail, Result};
use chrono::{Local, NaiveDate};

/// Parses `s` as a signed integer in `[min, max]`. `radix == 0` means
/// "auto-detect like `strtoll`": a `0x`/`0X` prefix selects base 16, a
/// leading `0` selects base 8, otherwise base 10.
pub fn parse_integer(s: &str, min: i64, max: i64, radix: u32) -> Result<i64> {
    if s.is_empty() {
        bail!("invalid integer ''");
    }
    let first = s.as_bytes()[0];
    if !(first.is_ascii_digit() || first == b'-') {
        bail!("invalid integer '{}'", s);
    }

    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if digits.is_empty() {
        bail!("invalid integer '{}'", s);
    }

    let (effective_radix, digits) = if radix == 0 {
        if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            (16, hex)
        } else if digits.len() > 1 && digits.starts_with('0') {
            (8, &digits[1..])
        } else {
            (10, digits)
        }
    } else if radix == 16 {
        (
            16,
            digits
                .strip_prefix("0x")
                .or_else(|| digits.strip_prefix("0X"))
                .unwrap_or(digits),
        )
    } else {
        (radix, digits)
    };

    let magnitude = i64::from_str_radix(digits, effective_radix)
        .map_err(|_| anyhow::anyhow!("invalid integer '{}'", s))?;
    let n = if negative { -magnitude } else { magnitude };
    if n > max || n < min {
        bail!("integer '{}' out of range", s);
    }
    Ok(n)
}

/// Unit suffixes in descending order, spec's `d`/`h`/`m`/`s`.
const TIME_UNITS: &[(char, i64)] = &[('d', 86400), ('h', 3600), ('m', 60), ('s', 1)];

/// Parses a suffixed interval like `"90s"`, `"1d"`; the result is clamped to
/// `max` seconds (bails rather than overflowing).
pub fn parse_time_interval(s: &str, max: i64) -> Result<i64> {
    if s.is_empty() {
        bail!("time interval must have a unit");
    }
    let last = s.chars().last().unwrap();
    if !last.is_alphabetic() {
        bail!("time interval must have a unit");
    }
    let ch = last.to_ascii_lowercase();
    let unit = TIME_UNITS
        .iter()
        .find(|(u, _)| *u == ch)
        .map(|(_, secs)| *secs)
        .ok_or_else(|| anyhow::anyhow!("unrecognized time unit"))?;

    let digits = &s[..s.len() - last.len_utf8()];
    let n = parse_integer(digits, i64::MIN, i64::MAX, 0)?;
    if unit != 0 && n > max / unit {
        bail!("time interval too large to represent");
    }
    Ok(n * unit)
}

/// Formats a whole count of seconds with the largest unit that divides it
/// evenly, falling back to seconds. Round-trips with [`parse_time_interval`]
/// for values that are themselves a round number of some unit.
pub fn format_time_interval(mut n: i64) -> String {
    for (ch, secs) in TIME_UNITS {
        if n % secs == 0 {
            n /= secs;
            return format!("{}{}", n, ch);
        }
    }
    unreachable!("1s divides everything")
}

/// Parses `HH:MM` or `HH:MM:SS` into seconds since midnight; `24:00:00` is
/// accepted as the end-of-day sentinel but `24:MM` with `MM != 0` is not.
pub fn parse_time_of_day(s: &str) -> Result<i64> {
    let bits: Vec<&str> = s.split(':').collect();
    if bits.len() < 2 || bits.len() > 3 {
        bail!("time of day {} malformed", s);
    }
    let hour = parse_integer(bits[0], 0, 24, 10)?;
    let minute = parse_integer(bits[1], 0, 59, 10)?;
    let second = if bits.len() > 2 {
        parse_integer(bits[2], 0, 59, 10)?
    } else {
        0
    };
    if hour == 24 && (minute != 0 || second != 0) {
        bail!("time of day {} out of range", s);
    }
    Ok(hour * 3600 + minute * 60 + second)
}

pub fn format_time_of_day(t: i64) -> String {
    let seconds = t % 60;
    let minutes = (t / 60) % 60;
    let hours = t / 3600;
    format!("{}:{:02}:{:02}", hours, minutes, seconds)
}

/// Which override, if any, was provided for `now_backup()`/`now_finish()`
/// (spec.md §6: "a mismatched-override error is fatal" if only one of the
/// pair is set).
fn override_time(var: &str) -> Option<Result<chrono::DateTime<Local>>> {
    std::env::var(var).ok().map(|raw| {
        raw.parse::<i64>()
            .map_err(|_| anyhow::anyhow!("{}={:?} is not a unix timestamp", var, raw))
            .map(|secs| {
                chrono::DateTime::from_timestamp(secs, 0)
                    .unwrap_or_default()
                    .with_timezone(&Local)
            })
    })
}

/// Today's date, honouring `RSBACKUP_TODAY` (`YYYY-MM-DD`).
pub fn today() -> Result<NaiveDate> {
    match std::env::var("RSBACKUP_TODAY") {
        Ok(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map_err(|_| anyhow::anyhow!("RSBACKUP_TODAY={:?} is not YYYY-MM-DD", raw)),
        Err(_) => Ok(Local::now().date_naive()),
    }
}

/// The "now" to stamp a backup's start time with, honouring
/// `RSBACKUP_TIME_BACKUP` then the blanket `RSBACKUP_TIME`.
pub fn now_backup() -> Result<chrono::DateTime<Local>> {
    now_for("RSBACKUP_TIME_BACKUP", "RSBACKUP_TIME_FINISH")
}

/// The "now" to stamp a backup's finish time with, honouring
/// `RSBACKUP_TIME_FINISH` then the blanket `RSBACKUP_TIME`.
pub fn now_finish() -> Result<chrono::DateTime<Local>> {
    now_for("RSBACKUP_TIME_FINISH", "RSBACKUP_TIME_BACKUP")
}

fn now_for(specific_var: &str, sibling_var: &str) -> Result<chrono::DateTime<Local>> {
    if let Some(value) = override_time(specific_var) {
        return value;
    }
    if let Some(value) = override_time("RSBACKUP_TIME") {
        return value;
    }
    if std::env::var(sibling_var).is_ok() {
        bail!(
            "{} is set without a matching override for this timestamp",
            sibling_var
        );
    }
    Ok(Local::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trip_hex() {
        assert_eq!(parse_integer("0x10", i64::MIN, i64::MAX, 0).unwrap(), 16);
    }

    #[test]
    fn integer_rejects_leading_whitespace() {
        assert!(parse_integer(" 5", i64::MIN, i64::MAX, 10).is_err());
    }

    #[test]
    fn integer_negative() {
        assert_eq!(parse_integer("-3", i64::MIN, i64::MAX, 10).unwrap(), -3);
    }

    #[test]
    fn interval_round_trip() {
        let secs = parse_time_interval("1d", i64::MAX).unwrap();
        assert_eq!(format_time_interval(secs), "1d");
    }

    #[test]
    fn interval_picks_coarsest_unit() {
        assert_eq!(format_time_interval(90), "90s");
        assert_eq!(format_time_interval(120), "2m");
    }

    #[test]
    fn time_of_day_end_of_day_sentinel() {
        assert_eq!(parse_time_of_day("24:00:00").unwrap(), 86400);
        assert!(parse_time_of_day("24:01").is_err());
    }

    #[test]
    fn time_of_day_formats_back() {
        assert_eq!(format_time_of_day(3723), "1:02:03");
    }
}
