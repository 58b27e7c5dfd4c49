//! RMonitor REST Client
//! Mission: Stay inside the free tier's 6 requests/minute, always
//!
//! Provider B's REST surface takes the API token in the POST body rather
//! than a header. Responses are JSON. The client enforces request spacing
//! on its side and maps 429-equivalent responses to a retryable
//! `RateLimitError` so callers back off instead of hammering.

use crate::errors::{PitwallError, Result};
use crate::models::{FlagStatus, LapRecord, UNKNOWN_POSITION};
use crate::timing::{parse_lap_time, parse_race_time};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

/// 6 requests/minute on the free tier.
const MIN_REQUEST_SPACING: Duration = Duration::from_secs(10);

/// Competitor record as the REST surface ships it. Field names are the
/// provider's own and deliberately not canonical.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RmCompetitor {
    #[serde(rename = "Number")]
    pub number: String,
    #[serde(rename = "Transponder", default)]
    pub transponder: Option<String>,
    #[serde(rename = "FirstName", default)]
    pub first_name: Option<String>,
    #[serde(rename = "LastName", default)]
    pub last_name: Option<String>,
    #[serde(rename = "AdditionalData", default)]
    pub team: Option<String>,
    #[serde(rename = "Class", default)]
    pub class: Option<String>,
    #[serde(rename = "Position", default)]
    pub position: Option<u32>,
    #[serde(rename = "ClassPosition", default)]
    pub class_position: Option<u32>,
    #[serde(rename = "Laps", default)]
    pub laps: Option<u32>,
    #[serde(rename = "LastLapTime", default)]
    pub last_lap_time: Option<String>,
    #[serde(rename = "BestLapTime", default)]
    pub best_lap_time: Option<String>,
    #[serde(rename = "TotalTime", default)]
    pub total_time: Option<String>,
    #[serde(rename = "PitStops", default)]
    pub pit_stops: Option<u32>,
    #[serde(rename = "InPit", default)]
    pub in_pit: Option<bool>,
}

impl RmCompetitor {
    pub fn driver_name(&self) -> Option<String> {
        match (&self.first_name, &self.last_name) {
            (Some(f), Some(l)) => Some(format!("{} {}", f, l)),
            (Some(f), None) => Some(f.clone()),
            (None, Some(l)) => Some(l.clone()),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RmRace {
    #[serde(rename = "RaceID")]
    pub race_id: i64,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "FlagStatus", default)]
    pub flag_status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RmRaceResponse {
    #[serde(rename = "Race")]
    race: RmRace,
    #[serde(rename = "Competitors", default)]
    competitors: Vec<RmCompetitor>,
}

#[derive(Debug, Clone, Deserialize)]
struct RmLapWire {
    #[serde(rename = "Number")]
    number: String,
    #[serde(rename = "Lap")]
    lap: u32,
    #[serde(rename = "Position", default)]
    position: Option<u32>,
    #[serde(rename = "LapTime", default)]
    lap_time: Option<String>,
    #[serde(rename = "FlagStatus", default)]
    flag_status: Option<String>,
    #[serde(rename = "TotalTime", default)]
    total_time: Option<String>,
}

/// Rate-limited client. Clone-cheap; the limiter is shared.
#[derive(Clone)]
pub struct RmonitorRestClient {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    last_request: Arc<Mutex<Option<Instant>>>,
}

impl RmonitorRestClient {
    pub fn new(base_url: String, api_token: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PitwallError::Transport(format!("failed to build client: {}", e)))?;
        Ok(Self {
            client,
            base_url,
            api_token,
            last_request: Arc::new(Mutex::new(None)),
        })
    }

    /// Wait out the spacing window before the next request.
    async fn rate_limited(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < MIN_REQUEST_SPACING {
                let wait = MIN_REQUEST_SPACING - elapsed;
                debug!("rmonitor rate limiting: waiting {}ms", wait.as_millis());
                sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn post(&self, path: &str, mut form: Vec<(&str, String)>) -> Result<serde_json::Value> {
        self.rate_limited().await;
        form.push(("apiToken", self.api_token.clone()));

        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .form(&form)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(PitwallError::RateLimit(format!(
                "POST {} throttled by provider",
                path
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PitwallError::Transport(format!(
                "POST {} {}: {}",
                path, status, body
            )));
        }
        Ok(resp.json().await?)
    }

    /// Current live races visible to this token.
    pub async fn get_current_races(&self) -> Result<Vec<RmRace>> {
        let value = self.post("/Common/CurrentRaces", Vec::new()).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Full current snapshot for one race: race header plus competitor
    /// records.
    pub async fn get_race(&self, race_id: i64) -> Result<(RmRace, Vec<RmCompetitor>)> {
        let value = self
            .post("/Race/RaceDetails", vec![("raceID", race_id.to_string())])
            .await?;
        let resp: RmRaceResponse = serde_json::from_value(value)?;
        Ok((resp.race, resp.competitors))
    }

    /// Per-race lap chart: every competitor's lap history, with the per-lap
    /// flag color this provider is the source of truth for.
    pub async fn get_lap_histories(&self, race_id: i64) -> Result<HashMap<String, Vec<LapRecord>>> {
        let value = self
            .post("/Race/RaceLaps", vec![("raceID", race_id.to_string())])
            .await?;
        let laps: Vec<RmLapWire> = serde_json::from_value(value)?;
        let mut histories: HashMap<String, Vec<LapRecord>> = HashMap::new();
        for wire in laps {
            let Some(lap_time_ms) = wire.lap_time.as_deref().and_then(parse_lap_time) else {
                debug!("dropping lap without a parseable time: car {} lap {}", wire.number, wire.lap);
                continue;
            };
            histories.entry(wire.number).or_default().push(LapRecord {
                lap_number: wire.lap,
                lap_time_ms,
                position: wire.position.unwrap_or(UNKNOWN_POSITION),
                flag: wire
                    .flag_status
                    .as_deref()
                    .map(FlagStatus::from_provider)
                    .unwrap_or(FlagStatus::Unknown),
                total_elapsed_ms: wire
                    .total_time
                    .as_deref()
                    .and_then(parse_race_time)
                    .unwrap_or(0),
            });
        }
        for history in histories.values_mut() {
            history.sort_by_key(|lap| lap.lap_number);
        }
        Ok(histories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_competitor_wire_shape() {
        let comp: RmCompetitor = serde_json::from_value(json!({
            "Number": "24",
            "Transponder": "7781",
            "FirstName": "Jo",
            "LastName": "Driver",
            "Class": "GT3",
            "Position": 3,
            "Laps": 41,
            "BestLapTime": "1:30.551"
        }))
        .unwrap();
        assert_eq!(comp.driver_name().as_deref(), Some("Jo Driver"));
        assert_eq!(comp.transponder.as_deref(), Some("7781"));
        assert_eq!(comp.laps, Some(41));
    }

    #[test]
    fn test_lap_wire_to_records_sorted_and_flagged() {
        let wire = json!([
            {"Number": "24", "Lap": 2, "Position": 3, "LapTime": "1:32.000", "FlagStatus": "Yellow", "TotalTime": "3:03.500"},
            {"Number": "24", "Lap": 1, "Position": 4, "LapTime": "1:31.500", "FlagStatus": "Green", "TotalTime": "1:31.500"},
            {"Number": "7",  "Lap": 1, "LapTime": "1:33.100"}
        ]);
        let laps: Vec<RmLapWire> = serde_json::from_value(wire).unwrap();
        let mut histories: HashMap<String, Vec<LapRecord>> = HashMap::new();
        for w in laps {
            let lap_time_ms = w.lap_time.as_deref().and_then(parse_lap_time).unwrap();
            histories.entry(w.number).or_default().push(LapRecord {
                lap_number: w.lap,
                lap_time_ms,
                position: w.position.unwrap_or(UNKNOWN_POSITION),
                flag: w
                    .flag_status
                    .as_deref()
                    .map(FlagStatus::from_provider)
                    .unwrap_or(FlagStatus::Unknown),
                total_elapsed_ms: w.total_time.as_deref().and_then(parse_race_time).unwrap_or(0),
            });
        }
        for h in histories.values_mut() {
            h.sort_by_key(|l| l.lap_number);
        }

        let car24 = &histories["24"];
        assert_eq!(car24[0].lap_number, 1);
        assert_eq!(car24[0].flag, FlagStatus::Green);
        assert_eq!(car24[1].flag, FlagStatus::Yellow);
        assert_eq!(histories["7"][0].position, UNKNOWN_POSITION);
    }

    #[tokio::test]
    async fn test_rate_limiter_spacing() {
        tokio::time::pause();
        let client = RmonitorRestClient::new("http://unused".into(), "t".into()).unwrap();

        client.rate_limited().await;
        let before = tokio::time::Instant::now();
        // second call must wait out the 10s spacing window (paused clock
        // auto-advances, so this is instant in real time)
        client.rate_limited().await;
        let waited = tokio::time::Instant::now() - before;
        // allow sub-millisecond slack between the wall and tokio clocks
        assert!(waited >= Duration::from_millis(9_900), "waited only {:?}", waited);
    }
}
