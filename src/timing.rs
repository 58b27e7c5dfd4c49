//! Time-series parsers
//!
//! Providers ship lap and race times as strings in a handful of layouts
//! (`MM:SS.mmm`, `HH:MM:SS.mmm`, bare `SS.mmm`). Everything downstream works
//! in integer milliseconds, so conversion happens once at the ingest edge.

/// Parse a lap time string (`MM:SS.mmm` or bare `SS.mmm`) to milliseconds.
///
/// Returns `None` for empty or malformed input rather than guessing.
pub fn parse_lap_time(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let mut parts = s.rsplitn(3, ':');
    let seconds_part = parts.next()?;
    let (secs, millis) = parse_seconds(seconds_part)?;
    let minutes: i64 = match parts.next() {
        Some(m) => m.parse().ok()?,
        None => 0,
    };
    // Lap times never carry an hour field; a third segment is malformed.
    if parts.next().is_some() {
        return None;
    }
    Some(minutes * 60_000 + secs * 1_000 + millis)
}

/// Parse a race/elapsed time string (`HH:MM:SS.mmm` or `MM:SS.mmm`) to
/// milliseconds.
pub fn parse_race_time(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let mut parts = s.rsplitn(3, ':');
    let seconds_part = parts.next()?;
    let (secs, millis) = parse_seconds(seconds_part)?;
    let minutes: i64 = match parts.next() {
        Some(m) => m.parse().ok()?,
        None => 0,
    };
    let hours: i64 = match parts.next() {
        Some(h) => h.parse().ok()?,
        None => 0,
    };
    Some(hours * 3_600_000 + minutes * 60_000 + secs * 1_000 + millis)
}

/// Format milliseconds as a lap time (`M:SS.mmm`).
pub fn format_lap_time(ms: i64) -> String {
    let minutes = ms / 60_000;
    let secs = (ms % 60_000) / 1_000;
    let millis = ms % 1_000;
    format!("{}:{:02}.{:03}", minutes, secs, millis)
}

/// Format milliseconds as a race time (`H:MM:SS.mmm`).
pub fn format_race_time(ms: i64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let secs = (ms % 60_000) / 1_000;
    let millis = ms % 1_000;
    format!("{}:{:02}:{:02}.{:03}", hours, minutes, secs, millis)
}

/// Split a `SS.mmm` segment. The fractional part is optional and may be
/// shorter than three digits (some feeds truncate trailing zeros).
fn parse_seconds(s: &str) -> Option<(i64, i64)> {
    match s.split_once('.') {
        Some((whole, frac)) => {
            let secs: i64 = whole.parse().ok()?;
            if frac.is_empty() || frac.len() > 3 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let mut millis: i64 = frac.parse().ok()?;
            for _ in frac.len()..3 {
                millis *= 10;
            }
            Some((secs, millis))
        }
        None => {
            let secs: i64 = s.parse().ok()?;
            Some((secs, 0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lap_time_minutes_seconds_millis() {
        assert_eq!(parse_lap_time("1:31.842"), Some(91_842));
        assert_eq!(parse_lap_time("0:45.001"), Some(45_001));
    }

    #[test]
    fn test_lap_time_bare_seconds() {
        assert_eq!(parse_lap_time("45.5"), Some(45_500));
        assert_eq!(parse_lap_time("45"), Some(45_000));
    }

    #[test]
    fn test_lap_time_rejects_garbage() {
        assert_eq!(parse_lap_time(""), None);
        assert_eq!(parse_lap_time("--"), None);
        assert_eq!(parse_lap_time("1:2:3:4"), None);
        assert_eq!(parse_lap_time("1:31.8428"), None);
        // hour field is not a lap time
        assert_eq!(parse_lap_time("1:02:31.842"), None);
    }

    #[test]
    fn test_race_time_hours() {
        assert_eq!(parse_race_time("1:02:31.842"), Some(3_751_842));
        assert_eq!(parse_race_time("02:31.842"), Some(151_842));
    }

    #[test]
    fn test_format_round_trip() {
        assert_eq!(format_lap_time(91_842), "1:31.842");
        assert_eq!(parse_lap_time(&format_lap_time(91_842)), Some(91_842));
        assert_eq!(format_race_time(3_751_842), "1:02:31.842");
        assert_eq!(parse_race_time(&format_race_time(3_751_842)), Some(3_751_842));
    }
}
