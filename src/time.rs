//! Wall-clock helpers. Timestamps are stored as Unix milliseconds.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// ISO-8601 UTC timestamp (YYYY-MM-DDTHH:MM:SSZ) for a Unix-ms value.
pub fn iso_timestamp(ms: i64) -> String {
    let secs = (ms.max(0) / 1000) as u64;
    let (year, month, day) = days_to_ymd(secs / 86400);
    let day_secs = secs % 86400;
    let hour = day_secs / 3600;
    let min = (day_secs % 3600) / 60;
    let sec = day_secs % 60;
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{min:02}:{sec:02}Z")
}

pub fn iso_now() -> String {
    iso_timestamp(now_ms())
}

/// Parse `YYYY-MM-DDTHH:MM:SS[.fff][Z]` back to Unix ms. Offsets other than Z are ignored.
pub fn parse_iso_ms(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.len() < 19 {
        return None;
    }
    let num = |range: std::ops::Range<usize>| s.get(range)?.parse::<u64>().ok();
    let (year, month, day) = (num(0..4)?, num(5..7)?, num(8..10)?);
    let (hour, min, sec) = (num(11..13)?, num(14..16)?, num(17..19)?);
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || min > 59 {
        return None;
    }
    let days = ymd_to_days(year, month, day);
    let secs = days * 86400 + hour * 3600 + min * 60 + sec;
    Some(secs as i64 * 1000)
}

/// Days since Unix epoch to (year, month, day). civil_from_days (Howard Hinnant).
fn days_to_ymd(mut days: u64) -> (u64, u64, u64) {
    days += 719468;
    let era = days / 146097;
    let doe = days % 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

/// Inverse of `days_to_ymd`. days_from_civil (Howard Hinnant).
fn ymd_to_days(year: u64, month: u64, day: u64) -> u64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y / 400;
    let yoe = y - era * 400;
    let mp = if month > 2 { month - 3 } else { month + 9 };
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    (era * 146097 + doe).saturating_sub(719468)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_epoch() {
        assert_eq!(iso_timestamp(0), "1970-01-01T00:00:00Z");
        assert_eq!(iso_timestamp(1_700_000_000_000), "2023-11-14T22:13:20Z");
    }

    #[test]
    fn parse_inverts_format() {
        let ms = 1_700_000_000_000;
        assert_eq!(parse_iso_ms(&iso_timestamp(ms)), Some(ms));
        assert_eq!(parse_iso_ms("2024-02-29T12:00:00.123456"), parse_iso_ms("2024-02-29T12:00:00Z"));
        assert_eq!(parse_iso_ms("not a date"), None);
    }
}
