//! RMonitor Line Protocol Decoder
//!
//! Provider B's live channel is a plain persistent socket emitting
//! newline-delimited, comma-separated command records with a leading type
//! tag (`$A`, `$COMP`, `$F`, `$G`, `$H`, `$RMHL`, ...). Fields may be
//! double-quoted and quoted fields may contain embedded commas.
//!
//! Malformed lines are a `DecodeError` for the caller to log and drop;
//! unknown tags decode to `Unknown` and are skipped. Either way the stream
//! continues.

use crate::errors::{PitwallError, Result};
use crate::models::{FlagStatus, UNKNOWN_POSITION};
use crate::timing::{parse_lap_time, parse_race_time};
use tracing::debug;

/// One decoded command record.
#[derive(Debug, Clone, PartialEq)]
pub enum RmRecord {
    /// `$F` heartbeat: laps to go, time to go, race time, flag.
    Heartbeat {
        laps_to_go: Option<u32>,
        time_to_go: Option<String>,
        race_time_ms: Option<i64>,
        flag: FlagStatus,
    },
    /// `$A` competitor registration: registration id, car number,
    /// transponder, driver names, class.
    Competitor {
        reg_id: String,
        number: String,
        transponder: Option<String>,
        first_name: Option<String>,
        last_name: Option<String>,
        class: Option<String>,
    },
    /// `$COMP` extra competitor data (team/additional field).
    CompetitorExtra {
        reg_id: String,
        number: String,
        team: Option<String>,
    },
    /// `$G` race position line: position, registration id, laps, total time.
    RacePosition {
        position: u32,
        reg_id: String,
        laps: Option<u32>,
        total_time_ms: Option<i64>,
    },
    /// `$H` best lap line: rank, registration id, best lap number, best time.
    BestLap {
        reg_id: String,
        best_lap: Option<u32>,
        best_time_ms: Option<i64>,
    },
    /// `$RMHL` per-lap history line: registration id, lap, position, lap
    /// time, flag at time of lap, total time. The per-lap flag color makes
    /// this the source of truth for lap histories.
    LapHistory {
        reg_id: String,
        lap: u32,
        position: u32,
        lap_time_ms: i64,
        flag: FlagStatus,
        total_time_ms: i64,
    },
    /// Recognized-but-unhandled or unrecognized tag.
    Unknown(String),
}

/// Decode one line. Empty lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<RmRecord>> {
    let line = line.trim_end_matches(['\r', '\n']).trim();
    if line.is_empty() {
        return Ok(None);
    }
    let fields = split_fields(line)?;
    let tag = fields
        .first()
        .ok_or_else(|| PitwallError::Decode("empty command line".into()))?;

    let record = match tag.as_str() {
        "$F" => RmRecord::Heartbeat {
            laps_to_go: field(&fields, 1).and_then(|s| s.parse().ok()),
            time_to_go: field(&fields, 2).map(str::to_owned),
            race_time_ms: field(&fields, 3).and_then(parse_race_time),
            flag: field(&fields, 5)
                .map(FlagStatus::from_provider)
                .unwrap_or(FlagStatus::Unknown),
        },
        "$A" => RmRecord::Competitor {
            reg_id: required(&fields, 1, "$A registration id")?,
            number: required(&fields, 2, "$A car number")?,
            transponder: non_empty(field(&fields, 3)),
            first_name: non_empty(field(&fields, 4)),
            last_name: non_empty(field(&fields, 5)),
            class: non_empty(field(&fields, 7)),
        },
        "$COMP" => RmRecord::CompetitorExtra {
            reg_id: required(&fields, 1, "$COMP registration id")?,
            number: required(&fields, 2, "$COMP car number")?,
            team: non_empty(field(&fields, 7)),
        },
        "$G" => RmRecord::RacePosition {
            position: required(&fields, 1, "$G position")?
                .parse()
                .map_err(|_| PitwallError::Decode("$G position not numeric".into()))?,
            reg_id: required(&fields, 2, "$G registration id")?,
            laps: field(&fields, 3).and_then(|s| s.parse().ok()),
            total_time_ms: field(&fields, 4).and_then(parse_race_time),
        },
        "$H" => RmRecord::BestLap {
            reg_id: required(&fields, 2, "$H registration id")?,
            best_lap: field(&fields, 3).and_then(|s| s.parse().ok()),
            best_time_ms: field(&fields, 4).and_then(parse_lap_time),
        },
        "$RMHL" => RmRecord::LapHistory {
            reg_id: required(&fields, 1, "$RMHL registration id")?,
            lap: required(&fields, 2, "$RMHL lap")?
                .parse()
                .map_err(|_| PitwallError::Decode("$RMHL lap not numeric".into()))?,
            position: field(&fields, 3)
                .and_then(|s| s.parse().ok())
                .unwrap_or(UNKNOWN_POSITION),
            lap_time_ms: field(&fields, 4)
                .and_then(parse_lap_time)
                .ok_or_else(|| PitwallError::Decode("$RMHL lap time unparseable".into()))?,
            flag: field(&fields, 5)
                .map(FlagStatus::from_provider)
                .unwrap_or(FlagStatus::Unknown),
            total_time_ms: field(&fields, 6).and_then(parse_race_time).unwrap_or(0),
        },
        other => {
            debug!("skipping unhandled rmonitor tag {}", other);
            RmRecord::Unknown(other.to_string())
        }
    };
    Ok(Some(record))
}

fn field<'a>(fields: &'a [String], index: usize) -> Option<&'a str> {
    fields.get(index).map(String::as_str).filter(|s| !s.is_empty())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn required(fields: &[String], index: usize, what: &str) -> Result<String> {
    field(fields, index)
        .map(str::to_owned)
        .ok_or_else(|| PitwallError::Decode(format!("missing field: {}", what)))
}

/// Split a comma-separated record, honoring double-quoted fields that may
/// contain embedded commas. Doubled quotes inside a quoted field escape a
/// literal quote.
fn split_fields(line: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current).trim().to_string());
            }
            _ => current.push(c),
        }
    }
    if in_quotes {
        return Err(PitwallError::Decode(format!(
            "unterminated quote in command line: {}",
            line
        )));
    }
    fields.push(current.trim().to_string());
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_line() {
        let rec = parse_line(r#"$F,14,"00:12:45","00:09:47","00:35:00","Green ""#)
            .unwrap()
            .unwrap();
        assert_eq!(
            rec,
            RmRecord::Heartbeat {
                laps_to_go: Some(14),
                time_to_go: Some("00:12:45".into()),
                race_time_ms: Some(587_000),
                flag: FlagStatus::Green,
            }
        );
    }

    #[test]
    fn test_competitor_line_with_quoted_comma() {
        let rec = parse_line(r#"$A,"1234BE","24",7781,"Jo","Driver, Jr.","USA","GT3""#)
            .unwrap()
            .unwrap();
        match rec {
            RmRecord::Competitor {
                reg_id,
                number,
                transponder,
                last_name,
                class,
                ..
            } => {
                assert_eq!(reg_id, "1234BE");
                assert_eq!(number, "24");
                assert_eq!(transponder.as_deref(), Some("7781"));
                // embedded comma survives the split
                assert_eq!(last_name.as_deref(), Some("Driver, Jr."));
                assert_eq!(class.as_deref(), Some("GT3"));
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_lap_history_line() {
        let rec = parse_line(r#"$RMHL,"1234BE",12,3,"1:31.842","Yellow","18:32.001""#)
            .unwrap()
            .unwrap();
        assert_eq!(
            rec,
            RmRecord::LapHistory {
                reg_id: "1234BE".into(),
                lap: 12,
                position: 3,
                lap_time_ms: 91_842,
                flag: FlagStatus::Yellow,
                total_time_ms: 1_112_001,
            }
        );
    }

    #[test]
    fn test_race_position_line() {
        let rec = parse_line(r#"$G,3,"1234BE",14,"01:12:47.872""#).unwrap().unwrap();
        assert_eq!(
            rec,
            RmRecord::RacePosition {
                position: 3,
                reg_id: "1234BE".into(),
                laps: Some(14),
                total_time_ms: Some(4_367_872),
            }
        );
    }

    #[test]
    fn test_unknown_tag_is_skipped_not_error() {
        let rec = parse_line("$J,\"1234BE\",\"00:00:00.387\",\"01:12:47.919\"")
            .unwrap()
            .unwrap();
        assert_eq!(rec, RmRecord::Unknown("$J".into()));
    }

    #[test]
    fn test_malformed_lines_are_decode_errors() {
        assert!(parse_line(r#"$A,"unterminated"#).is_err());
        assert!(parse_line("$G,notanumber,\"x\"").is_err());
        assert!(parse_line(r#"$RMHL,"1234BE",12,3,"--","Green","0""#).is_err());
    }

    #[test]
    fn test_blank_line_is_none() {
        assert!(parse_line("\r\n").unwrap().is_none());
        assert!(parse_line("").unwrap().is_none());
    }
}
