//! Trackside REST Client
//!
//! Read-only surface of the low-latency provider: event and session lists,
//! the live per-car snapshot, per-car lap histories (the bulk fetch behind
//! the replay reconstructor) and the control-log feed. All reads are
//! idempotent GETs with a bearer token from the token manager.
//!
//! Snapshot bodies may arrive as plain JSON or as the same compressed
//! envelope encoding the live channel uses; both go through the envelope
//! codec's detection path.

use crate::auth::TokenManager;
use crate::errors::{PitwallError, Result};
use crate::live::envelope::decode_envelope;
use crate::models::{FlagStatus, LapRecord, UNKNOWN_POSITION};
use crate::timing::{parse_lap_time, parse_race_time};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct TracksideEvent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TracksideSession {
    pub id: String,
    pub event_id: String,
    pub name: String,
    #[serde(default)]
    pub session_type: Option<String>,
}

#[derive(Clone)]
pub struct TracksideRestClient {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
}

impl TracksideRestClient {
    pub fn new(base_url: String, tokens: Arc<TokenManager>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| PitwallError::Transport(format!("failed to build client: {}", e)))?;
        Ok(Self {
            client,
            base_url,
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        let token = self.tokens.get_token().await?;
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PitwallError::Transport(format!(
                "GET {} {}: {}",
                path, status, body
            )));
        }
        Ok(resp.text().await?)
    }

    /// GET and decode a body that may be plain JSON or a compressed
    /// envelope.
    async fn get_decoded(&self, path: &str) -> Result<Value> {
        let text = self.get_text(path).await?;
        decode_envelope(&text)
    }

    pub async fn get_events(&self) -> Result<Vec<TracksideEvent>> {
        let value = self.get_decoded("/events").await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_sessions(&self, event_id: &str) -> Result<Vec<TracksideSession>> {
        let value = self
            .get_decoded(&format!("/events/{}/sessions", event_id))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Live per-car snapshot: one loosely-typed record per car, keyed by the
    /// provider's abbreviated field codes. No canonical shape is assumed
    /// here; the reconciliation engine owns the interpretation.
    pub async fn get_live_snapshot(&self, session_id: &str) -> Result<Vec<Map<String, Value>>> {
        let value = self
            .get_decoded(&format!("/sessions/{}/snapshot", session_id))
            .await?;
        match value {
            Value::Array(cars) => Ok(cars
                .into_iter()
                .filter_map(|car| match car {
                    Value::Object(map) => Some(map),
                    other => {
                        debug!("skipping non-object car record: {}", other);
                        None
                    }
                })
                .collect()),
            other => Err(PitwallError::Decode(format!(
                "snapshot was not an array: {}",
                other
            ))),
        }
    }

    /// Bulk per-car lap history fetch for the replay reconstructor.
    /// Response shape: {"<car number>": [{"L":1,"LT":"1:31.842",...}, ...]}.
    pub async fn get_lap_histories(&self, session_id: &str) -> Result<HashMap<String, Vec<LapRecord>>> {
        let value = self
            .get_decoded(&format!("/sessions/{}/laps", session_id))
            .await?;
        let Value::Object(cars) = value else {
            return Err(PitwallError::Decode("lap history was not an object".into()));
        };
        let mut histories = HashMap::with_capacity(cars.len());
        for (car_number, laps) in cars {
            let Value::Array(laps) = laps else {
                debug!("skipping malformed lap list for car {}", car_number);
                continue;
            };
            let parsed = laps
                .iter()
                .enumerate()
                .filter_map(|(i, lap)| parse_wire_lap(i, lap))
                .collect();
            histories.insert(car_number, parsed);
        }
        Ok(histories)
    }

    /// Control-log feed (race control messages) for a session.
    pub async fn get_control_log(&self, session_id: &str) -> Result<Vec<Value>> {
        let value = self
            .get_decoded(&format!("/sessions/{}/control-log", session_id))
            .await?;
        match value {
            Value::Array(lines) => Ok(lines),
            other => Err(PitwallError::Decode(format!(
                "control log was not an array: {}",
                other
            ))),
        }
    }
}

/// Decode one wire lap record. Lap number defaults to the array-position
/// convention; an explicit "L" field is authoritative. Trackside does not
/// carry per-lap flag color, so flags come through as Unknown until the
/// rmonitor history replaces this list wholesale.
fn parse_wire_lap(index: usize, lap: &Value) -> Option<LapRecord> {
    let obj = lap.as_object()?;
    let lap_number = obj
        .get("L")
        .and_then(Value::as_u64)
        .map(|n| n as u32)
        .unwrap_or(index as u32 + 1);
    let lap_time_ms = match obj.get("LT") {
        Some(Value::String(s)) => parse_lap_time(s)?,
        Some(Value::Number(n)) => n.as_i64()?,
        _ => return None,
    };
    let position = obj
        .get("P")
        .and_then(Value::as_u64)
        .map(|p| p as u32)
        .unwrap_or(UNKNOWN_POSITION);
    let total_elapsed_ms = match obj.get("ET") {
        Some(Value::String(s)) => parse_race_time(s).unwrap_or(0),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        _ => 0,
    };
    Some(LapRecord {
        lap_number,
        lap_time_ms,
        position,
        flag: FlagStatus::Unknown,
        total_elapsed_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_wire_lap_explicit_lap_number_wins() {
        let lap = json!({"L": 7, "LT": "1:31.842", "P": 3, "ET": "12:45.100"});
        let parsed = parse_wire_lap(0, &lap).unwrap();
        assert_eq!(parsed.lap_number, 7);
        assert_eq!(parsed.lap_time_ms, 91_842);
        assert_eq!(parsed.position, 3);
        assert_eq!(parsed.total_elapsed_ms, 765_100);
    }

    #[test]
    fn test_parse_wire_lap_falls_back_to_array_position() {
        let lap = json!({"LT": 90500});
        let parsed = parse_wire_lap(4, &lap).unwrap();
        assert_eq!(parsed.lap_number, 5);
        assert_eq!(parsed.lap_time_ms, 90_500);
        assert_eq!(parsed.position, UNKNOWN_POSITION);
        assert_eq!(parsed.flag, FlagStatus::Unknown);
    }

    #[test]
    fn test_parse_wire_lap_missing_time_is_dropped() {
        assert!(parse_wire_lap(0, &json!({"L": 1, "P": 2})).is_none());
        assert!(parse_wire_lap(0, &json!({"L": 1, "LT": "--"})).is_none());
    }
}
