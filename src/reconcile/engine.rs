//! Cross-Source Reconciliation Engine
//! Mission: One canonical record per physical car, no matter who reported it
//!
//! Two producers race into this engine: the trackside live channel (plus its
//! REST polling fallback) and the rmonitor feed. The per-field merge policy
//! is commutative and idempotent across providers (max, min,
//! prefer-non-null, conflicts resolved by the incoming record's provenance),
//! so the canonical outcome does not depend on which provider reported
//! first, and every later snapshot keeps updating the canonical record. The
//! merge itself is a pure function; the engine is the single owner of the
//! canonical map.
//!
//! Correlation key: transponder id when both records carry one and they
//! match, car number as the fallback. Every successful correlation upserts
//! the durable transponder mapping so the next session re-identifies the car
//! before rmonitor has said a word.

use crate::errors::Result;
use crate::models::{
    FlagStatus, LapRecord, SourceFlags, TransponderMapping, UnifiedCompetitor, UNKNOWN_POSITION,
};
use crate::providers::rmonitor_rest::RmCompetitor;
use crate::providers::rmonitor_stream::RmRecord;
use crate::store::RecordStore;
use crate::timing::{format_race_time, parse_lap_time};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Merge the existing canonical record `a` with an incoming partial `b`.
///
/// `b` is always a single-provider record; its source flags carry its
/// provenance, and conflicts resolve by that provenance, never by which
/// side has accumulated more flags:
/// - identity fields: prefer non-null; on conflict the incoming side wins
///   when it is rmonitor-sourced (the documented source of truth for
///   identity) or when the existing record has never heard from rmonitor
/// - position/lap/time instantaneous fields: prefer non-null; on conflict
///   the incoming side wins when it is trackside-sourced (lower latency) or
///   when the existing record has never heard from trackside, so a fresh
///   snapshot always replaces its own provider's previous value
/// - `laps`: max of the two counts
/// - `best_lap_ms`: min of the non-zero values
/// - `lap_history`: wholesale from the rmonitor side when present (it is the
///   only source carrying per-lap flag color), never interleaved
/// - `sources`: additive union, never reset
pub fn merge(a: &UnifiedCompetitor, b: &UnifiedCompetitor) -> UnifiedCompetitor {
    let identity = |av: &Option<String>, bv: &Option<String>| -> Option<String> {
        prefer(av, bv, b.sources.rmonitor || !a.sources.rmonitor)
    };
    let live_u32 = |av: &Option<u32>, bv: &Option<u32>| -> Option<u32> {
        prefer(av, bv, b.sources.trackside || !a.sources.trackside)
    };
    let live_i64 = |av: &Option<i64>, bv: &Option<i64>| -> Option<i64> {
        prefer(av, bv, b.sources.trackside || !a.sources.trackside)
    };

    let lap_history = if b.sources.rmonitor && !b.lap_history.is_empty() {
        b.lap_history.clone()
    } else if a.sources.rmonitor && !a.lap_history.is_empty() {
        a.lap_history.clone()
    } else if !a.lap_history.is_empty() {
        a.lap_history.clone()
    } else {
        b.lap_history.clone()
    };

    UnifiedCompetitor {
        transponder_id: prefer(&a.transponder_id, &b.transponder_id, false),
        car_number: identity(&a.car_number, &b.car_number),
        driver_name: identity(&a.driver_name, &b.driver_name),
        team_name: identity(&a.team_name, &b.team_name),
        class_name: identity(&a.class_name, &b.class_name),
        position: live_u32(&a.position, &b.position),
        class_position: live_u32(&a.class_position, &b.class_position),
        laps: a.laps.max(b.laps),
        last_lap_ms: live_i64(&a.last_lap_ms, &b.last_lap_ms),
        best_lap_ms: min_non_zero(a.best_lap_ms, b.best_lap_ms),
        total_elapsed_ms: live_i64(&a.total_elapsed_ms, &b.total_elapsed_ms),
        pit_count: live_u32(&a.pit_count, &b.pit_count),
        in_pit: prefer(&a.in_pit, &b.in_pit, b.sources.trackside || !a.sources.trackside),
        // rmonitor is the source of truth for flag state
        flag: prefer(&a.flag, &b.flag, b.sources.rmonitor || !a.sources.rmonitor),
        lap_history,
        sources: a.sources.union(b.sources),
    }
}

/// Prefer-non-null; when both are non-null, `b_wins` decides.
fn prefer<T: Clone>(a: &Option<T>, b: &Option<T>, b_wins: bool) -> Option<T> {
    match (a, b) {
        (Some(_), None) => a.clone(),
        (None, Some(_)) => b.clone(),
        (Some(_), Some(_)) => {
            if b_wins {
                b.clone()
            } else {
                a.clone()
            }
        }
        (None, None) => None,
    }
}

/// Fastest-known-time-so-far semantics: zero is "no time yet", not a record.
fn min_non_zero(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a.filter(|&t| t > 0), b.filter(|&t| t > 0)) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) => Some(x),
        (None, Some(y)) => Some(y),
        (None, None) => None,
    }
}

/// Convert a trackside per-car snapshot record (abbreviated field codes)
/// into a partial unified competitor.
pub fn to_unified_trackside(record: &Map<String, Value>) -> UnifiedCompetitor {
    UnifiedCompetitor {
        transponder_id: get_string(record, "T"),
        car_number: get_string(record, "N"),
        driver_name: get_string(record, "D"),
        team_name: None,
        class_name: get_string(record, "C"),
        position: get_u32(record, "P"),
        class_position: get_u32(record, "PC"),
        laps: get_u32(record, "L").unwrap_or(0),
        last_lap_ms: get_time_ms(record, "LL"),
        best_lap_ms: get_time_ms(record, "BL"),
        total_elapsed_ms: get_time_ms(record, "ET"),
        pit_count: get_u32(record, "PS"),
        in_pit: get_bool(record, "PIT"),
        flag: get_string(record, "F").map(|f| FlagStatus::from_provider(&f)),
        lap_history: Vec::new(),
        sources: SourceFlags {
            trackside: true,
            rmonitor: false,
        },
    }
}

/// Convert an rmonitor competitor record (plus optional lap history) into a
/// partial unified competitor.
pub fn to_unified_rmonitor(
    comp: &RmCompetitor,
    lap_history: Option<Vec<LapRecord>>,
) -> UnifiedCompetitor {
    UnifiedCompetitor {
        transponder_id: comp.transponder.clone(),
        car_number: Some(comp.number.clone()),
        driver_name: comp.driver_name(),
        team_name: comp.team.clone(),
        class_name: comp.class.clone(),
        position: comp.position,
        class_position: comp.class_position,
        laps: comp.laps.unwrap_or(0),
        last_lap_ms: comp.last_lap_time.as_deref().and_then(parse_lap_time),
        best_lap_ms: comp.best_lap_time.as_deref().and_then(parse_lap_time),
        total_elapsed_ms: comp.total_time.as_deref().and_then(crate::timing::parse_race_time),
        pit_count: comp.pit_stops,
        in_pit: comp.in_pit,
        flag: None,
        lap_history: lap_history.unwrap_or_default(),
        sources: SourceFlags {
            trackside: false,
            rmonitor: true,
        },
    }
}

/// Per-registration state accumulated from the rmonitor line protocol.
#[derive(Debug, Clone, Default)]
struct RmAccum {
    number: Option<String>,
    transponder: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    class: Option<String>,
    team: Option<String>,
    position: Option<u32>,
    laps: Option<u32>,
    total_time_ms: Option<i64>,
    best_lap_ms: Option<i64>,
    lap_history: Vec<LapRecord>,
}

impl RmAccum {
    fn to_competitor(&self) -> Option<RmCompetitor> {
        Some(RmCompetitor {
            number: self.number.clone()?,
            transponder: self.transponder.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            team: self.team.clone(),
            class: self.class.clone(),
            position: self.position,
            class_position: None,
            laps: self.laps,
            last_lap_time: None,
            best_lap_time: self.best_lap_ms.map(crate::timing::format_lap_time),
            total_time: self.total_time_ms.map(format_race_time),
            pit_stops: None,
            in_pit: None,
        })
    }
}

/// Single owner of the canonical competitor map.
pub struct ReconciliationEngine {
    store: RecordStore,
    competitors: Mutex<HashMap<String, UnifiedCompetitor>>,
    rm_session: Mutex<HashMap<String, RmAccum>>,
    session_flag: Mutex<FlagStatus>,
}

impl ReconciliationEngine {
    pub fn new(store: RecordStore) -> Self {
        Self {
            store,
            competitors: Mutex::new(HashMap::new()),
            rm_session: Mutex::new(HashMap::new()),
            session_flag: Mutex::new(FlagStatus::Unknown),
        }
    }

    pub fn session_flag(&self) -> FlagStatus {
        *self.session_flag.lock()
    }

    /// Ingest one trackside per-car snapshot record.
    pub fn ingest_trackside(&self, record: &Map<String, Value>) -> Result<UnifiedCompetitor> {
        let mut incoming = to_unified_trackside(record);
        self.hydrate_identity(&mut incoming)?;
        self.correlate_and_merge(incoming)
    }

    /// Ingest one rmonitor competitor record (REST or accumulated stream
    /// state), with its lap history when the caller has one.
    pub fn ingest_rmonitor(
        &self,
        comp: &RmCompetitor,
        lap_history: Option<Vec<LapRecord>>,
    ) -> Result<UnifiedCompetitor> {
        let incoming = to_unified_rmonitor(comp, lap_history);
        self.correlate_and_merge(incoming)
    }

    /// Ingest one decoded rmonitor line-protocol record.
    pub fn ingest_rmonitor_record(&self, record: &RmRecord) -> Result<()> {
        let ready = {
            let mut session = self.rm_session.lock();
            match record {
                RmRecord::Heartbeat { flag, .. } => {
                    *self.session_flag.lock() = *flag;
                    None
                }
                RmRecord::Competitor {
                    reg_id,
                    number,
                    transponder,
                    first_name,
                    last_name,
                    class,
                } => {
                    let accum = session.entry(reg_id.clone()).or_default();
                    accum.number = Some(number.clone());
                    if transponder.is_some() {
                        accum.transponder = transponder.clone();
                    }
                    if first_name.is_some() {
                        accum.first_name = first_name.clone();
                    }
                    if last_name.is_some() {
                        accum.last_name = last_name.clone();
                    }
                    if class.is_some() {
                        accum.class = class.clone();
                    }
                    accum.to_competitor().map(|c| (c, None))
                }
                RmRecord::CompetitorExtra { reg_id, number, team } => {
                    let accum = session.entry(reg_id.clone()).or_default();
                    accum.number = Some(number.clone());
                    if team.is_some() {
                        accum.team = team.clone();
                    }
                    accum.to_competitor().map(|c| (c, None))
                }
                RmRecord::RacePosition {
                    position,
                    reg_id,
                    laps,
                    total_time_ms,
                } => {
                    let accum = session.entry(reg_id.clone()).or_default();
                    accum.position = Some(*position);
                    if laps.is_some() {
                        accum.laps = *laps;
                    }
                    if total_time_ms.is_some() {
                        accum.total_time_ms = *total_time_ms;
                    }
                    accum.to_competitor().map(|c| (c, None))
                }
                RmRecord::BestLap {
                    reg_id,
                    best_time_ms,
                    ..
                } => {
                    let accum = session.entry(reg_id.clone()).or_default();
                    if best_time_ms.is_some() {
                        accum.best_lap_ms = *best_time_ms;
                    }
                    accum.to_competitor().map(|c| (c, None))
                }
                RmRecord::LapHistory {
                    reg_id,
                    lap,
                    position,
                    lap_time_ms,
                    flag,
                    total_time_ms,
                } => {
                    let accum = session.entry(reg_id.clone()).or_default();
                    let record = LapRecord {
                        lap_number: *lap,
                        lap_time_ms: *lap_time_ms,
                        position: *position,
                        flag: *flag,
                        total_elapsed_ms: *total_time_ms,
                    };
                    // replace-or-append keeps the history monotonic in lap
                    // number at insertion time
                    match accum.lap_history.iter_mut().find(|l| l.lap_number == *lap) {
                        Some(existing) => *existing = record,
                        None => {
                            accum.lap_history.push(record);
                            accum.lap_history.sort_by_key(|l| l.lap_number);
                        }
                    }
                    accum.laps = Some(accum.laps.unwrap_or(0).max(*lap));
                    let history = accum.lap_history.clone();
                    accum.to_competitor().map(|c| (c, Some(history)))
                }
                RmRecord::Unknown(tag) => {
                    debug!("ignoring rmonitor record {}", tag);
                    None
                }
            }
        };

        if let Some((comp, history)) = ready {
            self.ingest_rmonitor(&comp, history)?;
        }
        Ok(())
    }

    /// Current canonical view, ordered by overall position (unknowns last).
    pub fn snapshot(&self) -> Vec<UnifiedCompetitor> {
        let mut all: Vec<UnifiedCompetitor> = self.competitors.lock().values().cloned().collect();
        all.sort_by_key(|c| (c.position.unwrap_or(UNKNOWN_POSITION), c.car_number.clone()));
        all
    }

    pub fn competitor_by_number(&self, car_number: &str) -> Option<UnifiedCompetitor> {
        self.competitors
            .lock()
            .values()
            .find(|c| c.car_number.as_deref() == Some(car_number))
            .cloned()
    }

    /// Per-car lap histories from the canonical view, keyed by car number.
    /// This is the replay reconstructor's input for the live session.
    pub fn lap_histories(&self) -> HashMap<String, Vec<LapRecord>> {
        self.competitors
            .lock()
            .values()
            .filter_map(|c| {
                let number = c.car_number.clone()?;
                Some((number, c.lap_history.clone()))
            })
            .collect()
    }

    /// Fill identity fields from the durable mapping so a car is recognized
    /// before rmonitor has reported it this session.
    fn hydrate_identity(&self, competitor: &mut UnifiedCompetitor) -> Result<()> {
        let Some(transponder) = competitor.transponder_id.clone() else {
            return Ok(());
        };
        let Some(mapping) = self.store.get_transponder_mapping(&transponder)? else {
            return Ok(());
        };
        if competitor.car_number.is_none() {
            competitor.car_number = Some(mapping.car_number);
        }
        if competitor.driver_name.is_none() {
            competitor.driver_name = mapping.driver_name;
        }
        if competitor.team_name.is_none() {
            competitor.team_name = mapping.team_name;
        }
        if competitor.class_name.is_none() {
            competitor.class_name = mapping.class_name;
        }
        Ok(())
    }

    /// Find the canonical record this partial belongs to, merge, and persist
    /// the transponder mapping learned from the result.
    fn correlate_and_merge(&self, incoming: UnifiedCompetitor) -> Result<UnifiedCompetitor> {
        let merged = {
            let mut map = self.competitors.lock();
            let existing_key = find_correlated(&map, &incoming);

            let merged = match &existing_key {
                Some(key) => {
                    let existing = map.remove(key).unwrap_or_default();
                    merge(&existing, &incoming)
                }
                None => incoming,
            };

            let key = canonical_key(&merged);
            let Some(key) = key else {
                warn!("dropping competitor with neither transponder nor car number");
                return Ok(merged);
            };
            map.insert(key, merged.clone());
            merged
        };

        // Durable join key: survives restarts and providers' timing skew.
        if let (Some(transponder), Some(number)) =
            (merged.transponder_id.clone(), merged.car_number.clone())
        {
            self.store.upsert_transponder_mapping(&TransponderMapping {
                transponder_id: transponder,
                car_number: number,
                driver_name: merged.driver_name.clone(),
                team_name: merged.team_name.clone(),
                class_name: merged.class_name.clone(),
            })?;
        }
        Ok(merged)
    }
}

fn canonical_key(c: &UnifiedCompetitor) -> Option<String> {
    c.transponder_id
        .as_ref()
        .map(|t| format!("tx:{}", t))
        .or_else(|| c.car_number.as_ref().map(|n| format!("car:{}", n)))
}

/// Correlation key resolution: transponder match first, car number second.
fn find_correlated(
    map: &HashMap<String, UnifiedCompetitor>,
    incoming: &UnifiedCompetitor,
) -> Option<String> {
    if let Some(tx) = &incoming.transponder_id {
        if let Some((key, _)) = map
            .iter()
            .find(|(_, c)| c.transponder_id.as_ref() == Some(tx))
        {
            return Some(key.clone());
        }
    }
    if let Some(number) = &incoming.car_number {
        if let Some((key, _)) = map
            .iter()
            .find(|(_, c)| c.car_number.as_ref() == Some(number))
        {
            return Some(key.clone());
        }
    }
    None
}

fn get_string(record: &Map<String, Value>, key: &str) -> Option<String> {
    match record.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn get_u32(record: &Map<String, Value>, key: &str) -> Option<u32> {
    match record.get(key) {
        Some(Value::Number(n)) => n.as_u64().map(|v| v as u32),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn get_bool(record: &Map<String, Value>, key: &str) -> Option<bool> {
    match record.get(key) {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::Number(n)) => n.as_i64().map(|v| v != 0),
        _ => None,
    }
}

/// Lap/elapsed times arrive as `MM:SS.mmm` strings from some deployments
/// and as raw milliseconds from others.
fn get_time_ms(record: &Map<String, Value>, key: &str) -> Option<i64> {
    match record.get(key) {
        Some(Value::String(s)) => {
            crate::timing::parse_race_time(s).or_else(|| parse_lap_time(s))
        }
        Some(Value::Number(n)) => n.as_i64().filter(|&v| v > 0),
        _ => None,
    }
}
