//! Shared domain types
//!
//! The canonical shapes that flow between the providers, the reconciliation
//! engine, the pace analyzer and the replay reconstructor. Provider-specific
//! wire shapes live next to their clients; everything here is already in
//! canonical units (integer milliseconds, 1-based lap numbers).

use serde::{Deserialize, Serialize};
use std::env;

/// Recorded-position sentinel used by provider feeds when a car's running
/// position is unknown. Treated as lowest priority in replay tie-breaks.
pub const UNKNOWN_POSITION: u32 = 999;

/// Flag state attached to a lap or to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagStatus {
    Green,
    Yellow,
    Red,
    Checkered,
    Unknown,
}

impl FlagStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagStatus::Green => "green",
            FlagStatus::Yellow => "yellow",
            FlagStatus::Red => "red",
            FlagStatus::Checkered => "checkered",
            FlagStatus::Unknown => "unknown",
        }
    }

    /// Lenient parse of the flag spellings seen across both providers.
    pub fn from_provider(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "green" | "g" | "1" => FlagStatus::Green,
            "yellow" | "caution" | "y" | "2" => FlagStatus::Yellow,
            "red" | "r" | "3" => FlagStatus::Red,
            "checkered" | "checker" | "finish" | "f" | "9" => FlagStatus::Checkered,
            _ => FlagStatus::Unknown,
        }
    }
}

/// One completed lap in a car's unified history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LapRecord {
    /// 1-based. Array position is the convention; this field is
    /// authoritative when the two disagree.
    pub lap_number: u32,
    pub lap_time_ms: i64,
    /// Running position when the lap was completed. `UNKNOWN_POSITION` when
    /// the feed did not carry one.
    pub position: u32,
    pub flag: FlagStatus,
    pub total_elapsed_ms: i64,
}

/// Which providers have contributed to a unified competitor. Additive only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFlags {
    pub trackside: bool,
    pub rmonitor: bool,
}

impl SourceFlags {
    pub fn union(self, other: SourceFlags) -> SourceFlags {
        SourceFlags {
            trackside: self.trackside || other.trackside,
            rmonitor: self.rmonitor || other.rmonitor,
        }
    }
}

/// Canonical merged representation of one physical car.
///
/// Exactly one of these exists per transponder id at any instant. Created on
/// first sighting from either provider, updated on every snapshot, never
/// deleted during a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedCompetitor {
    pub transponder_id: Option<String>,
    pub car_number: Option<String>,
    pub driver_name: Option<String>,
    pub team_name: Option<String>,
    pub class_name: Option<String>,
    pub position: Option<u32>,
    pub class_position: Option<u32>,
    pub laps: u32,
    pub last_lap_ms: Option<i64>,
    pub best_lap_ms: Option<i64>,
    pub total_elapsed_ms: Option<i64>,
    pub pit_count: Option<u32>,
    pub in_pit: Option<bool>,
    pub flag: Option<FlagStatus>,
    pub lap_history: Vec<LapRecord>,
    #[serde(default)]
    pub sources: SourceFlags,
}

/// Durable transponder -> identity mapping, the join key across sessions and
/// providers. At most one row per transponder id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransponderMapping {
    pub transponder_id: String,
    pub car_number: String,
    pub driver_name: Option<String>,
    pub team_name: Option<String>,
    pub class_name: Option<String>,
}

/// One row of a reconstructed standings table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayEntry {
    pub car_number: String,
    /// Reassigned sequentially after the sort; the recorded position from
    /// the source data is discarded once the order is fixed.
    pub position: u32,
    pub lap_time_ms: i64,
    pub flag: FlagStatus,
    /// The lap this entry's data actually comes from. Less than the
    /// requested lap for cars running laps down (carried forward).
    pub data_lap: u32,
}

/// Reconstructed, fully ordered standings for one lap number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySnapshot {
    pub lap_number: u32,
    pub entries: Vec<ReplayEntry>,
}

/// Application configuration, loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub trackside_base_url: String,
    pub trackside_hub_url: String,
    pub rmonitor_base_url: String,
    pub rmonitor_api_token: Option<String>,
    pub identity_token_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub rmonitor_poll_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_path: env::var("PITWALL_DB_PATH")
                .unwrap_or_else(|_| "pitwall.db".to_string()),
            trackside_base_url: env::var("TRACKSIDE_BASE_URL")
                .unwrap_or_else(|_| "https://api.trackside.example/v2".to_string()),
            trackside_hub_url: env::var("TRACKSIDE_HUB_URL")
                .unwrap_or_else(|_| "wss://live.trackside.example/hub".to_string()),
            rmonitor_base_url: env::var("RMONITOR_BASE_URL")
                .unwrap_or_else(|_| "https://api.race-monitor.example/v2".to_string()),
            rmonitor_api_token: env::var("RMONITOR_API_TOKEN").ok(),
            identity_token_url: env::var("IDENTITY_TOKEN_URL")
                .unwrap_or_else(|_| "https://id.trackside.example/connect/token".to_string()),
            client_id: env::var("TRACKSIDE_CLIENT_ID").ok(),
            client_secret: env::var("TRACKSIDE_CLIENT_SECRET").ok(),
            // Free tier allows 6 requests/minute; default stays inside it.
            rmonitor_poll_interval_secs: env::var("RMONITOR_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&v| v >= 10)
                .unwrap_or(15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_parse_spellings() {
        assert_eq!(FlagStatus::from_provider("Green"), FlagStatus::Green);
        assert_eq!(FlagStatus::from_provider("caution"), FlagStatus::Yellow);
        assert_eq!(FlagStatus::from_provider("9"), FlagStatus::Checkered);
        assert_eq!(FlagStatus::from_provider("purple"), FlagStatus::Unknown);
    }

    #[test]
    fn test_source_flags_union_is_additive() {
        let a = SourceFlags { trackside: true, rmonitor: false };
        let b = SourceFlags { trackside: false, rmonitor: true };
        let u = a.union(b);
        assert!(u.trackside && u.rmonitor);
        // union never resets
        assert_eq!(u.union(SourceFlags::default()), u);
    }
}
