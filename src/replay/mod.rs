//! Replay Reconstructor
//! Mission: A complete, strictly ordered standings table for any lap
//!
//! Lap histories are per-car, append-only and sparse: cars running laps down
//! simply have no record for the requested lap, fields go missing, and the
//! occasional feed hiccup reorders entries. This module rebuilds a total
//! order anyway. It is a pure function of (lap number, histories): no hidden
//! state, identical output for identical input, re-run in full for every
//! request.

use crate::models::{LapRecord, ReplayEntry, ReplaySnapshot, UNKNOWN_POSITION};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Outcome of looking up one car's record for a lap. Explicit so the sort
/// and the display layer never re-derive which case occurred.
#[derive(Debug, Clone, PartialEq)]
pub enum LapLookup<'a> {
    /// The car has a record for exactly this lap.
    Found(&'a LapRecord),
    /// The car's history ends before this lap; its most recent completed
    /// record stands in, annotated with the lap it actually comes from.
    CarriedForward {
        record: &'a LapRecord,
        last_lap: u32,
    },
    /// The car has no usable data for this lap and is omitted.
    NoData,
}

/// Locate a car's record for `lap`: direct index first (array position =
/// lap − 1), then a linear search on the explicit lap-number field, then
/// carry-forward when the history is shorter than the requested lap.
pub fn lookup_lap(history: &[LapRecord], lap: u32) -> LapLookup<'_> {
    if lap == 0 || history.is_empty() {
        return LapLookup::NoData;
    }

    // Array-position convention, verified against the explicit field.
    if let Some(record) = history.get(lap as usize - 1) {
        if record.lap_number == lap {
            return LapLookup::Found(record);
        }
    }
    if let Some(record) = history.iter().find(|r| r.lap_number == lap) {
        return LapLookup::Found(record);
    }

    // Laps down: the car simply hasn't completed this lap yet.
    if lap as usize > history.len() {
        if let Some(last) = history.last() {
            return LapLookup::CarriedForward {
                record: last,
                last_lap: last.lap_number,
            };
        }
    }

    // History is long enough but holds no record for this lap (early-session
    // gap). Carrying future data backwards would be wrong; omit instead.
    LapLookup::NoData
}

/// Reconstruct the full standings at `lap`.
///
/// Ordering: laps completed descending, then recorded position ascending
/// (a known position always outranks the unknown sentinel), then lap time
/// ascending, then car number for total determinism. After the sort,
/// positions are reassigned 1..n; the recorded position field is only used
/// to order, never displayed.
pub fn positions_at_lap(lap: u32, histories: &HashMap<String, Vec<LapRecord>>) -> ReplaySnapshot {
    struct Candidate<'a> {
        car_number: &'a str,
        record: &'a LapRecord,
        laps_completed: u32,
        data_lap: u32,
    }

    let mut candidates: Vec<Candidate> = histories
        .iter()
        .filter_map(|(car_number, history)| match lookup_lap(history, lap) {
            LapLookup::Found(record) => Some(Candidate {
                car_number,
                record,
                laps_completed: lap,
                data_lap: lap,
            }),
            LapLookup::CarriedForward { record, last_lap } => Some(Candidate {
                car_number,
                record,
                laps_completed: last_lap,
                data_lap: last_lap,
            }),
            LapLookup::NoData => None,
        })
        .collect();

    candidates.sort_by(|a, b| {
        // more laps completed = better position
        b.laps_completed
            .cmp(&a.laps_completed)
            .then_with(|| compare_recorded_positions(a.record.position, b.record.position))
            .then_with(|| a.record.lap_time_ms.cmp(&b.record.lap_time_ms))
            .then_with(|| a.car_number.cmp(b.car_number))
    });

    let entries = candidates
        .into_iter()
        .enumerate()
        .map(|(i, c)| ReplayEntry {
            car_number: c.car_number.to_string(),
            position: i as u32 + 1,
            lap_time_ms: c.record.lap_time_ms,
            flag: c.record.flag,
            data_lap: c.data_lap,
        })
        .collect();

    ReplaySnapshot {
        lap_number: lap,
        entries,
    }
}

/// Secondary sort key. The unknown sentinel never outranks a known
/// position; two unknowns are equal here and fall through to lap time.
fn compare_recorded_positions(a: u32, b: u32) -> Ordering {
    match (a == UNKNOWN_POSITION, b == UNKNOWN_POSITION) {
        (false, false) => a.cmp(&b),
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
        (true, true) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FlagStatus;

    fn lap(n: u32, ms: i64, position: u32) -> LapRecord {
        LapRecord {
            lap_number: n,
            lap_time_ms: ms,
            position,
            flag: FlagStatus::Green,
            total_elapsed_ms: ms * n as i64,
        }
    }

    fn history(laps: &[(u32, i64, u32)]) -> Vec<LapRecord> {
        laps.iter().map(|&(n, ms, p)| lap(n, ms, p)).collect()
    }

    #[test]
    fn test_replay_totality_with_carry_forward() {
        let mut histories = HashMap::new();
        histories.insert(
            "A".to_string(),
            history(&[(1, 90_000, 1), (2, 90_100, 1), (3, 90_200, 1), (4, 90_300, 1), (5, 90_400, 1)]),
        );
        histories.insert(
            "B".to_string(),
            history(&[(1, 95_000, 2), (2, 95_100, 2), (3, 95_200, 2)]),
        );
        histories.insert("C".to_string(), Vec::new());

        let snapshot = positions_at_lap(4, &histories);

        // A and B appear, C (no history) is omitted
        assert_eq!(snapshot.entries.len(), 2);
        let a = &snapshot.entries[0];
        let b = &snapshot.entries[1];
        assert_eq!(a.car_number, "A");
        assert_eq!(a.position, 1);
        assert_eq!(a.data_lap, 4); // its real lap-4 record
        assert_eq!(b.car_number, "B");
        assert_eq!(b.position, 2);
        assert_eq!(b.data_lap, 3); // carried forward from lap 3
        assert_eq!(b.lap_time_ms, 95_200);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let mut histories = HashMap::new();
        for car in ["5", "12", "24", "7", "99"] {
            histories.insert(
                car.to_string(),
                history(&[(1, 91_000, UNKNOWN_POSITION), (2, 91_000, UNKNOWN_POSITION)]),
            );
        }
        let first = positions_at_lap(2, &histories);
        let second = positions_at_lap(2, &histories);
        assert_eq!(first, second);
        // identical inputs, byte-identical serialized output
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn test_tie_break_recorded_position_then_lap_time() {
        let mut histories = HashMap::new();
        // both on lap 10, recorded positions 5 and 3
        histories.insert("X".to_string(), {
            let mut h = history(&[(9, 90_000, 5)]);
            h.push(lap(10, 89_000, 5));
            h
        });
        histories.insert("Y".to_string(), {
            let mut h = history(&[(9, 90_000, 3)]);
            h.push(lap(10, 91_000, 3));
            h
        });
        // direct index lookup fails (short arrays), linear search finds lap 10
        let snapshot = positions_at_lap(10, &histories);
        assert_eq!(snapshot.entries[0].car_number, "Y"); // recorded pos 3
        assert_eq!(snapshot.entries[1].car_number, "X"); // recorded pos 5

        // both unknown: faster lap wins
        let mut unknowns = HashMap::new();
        unknowns.insert("F".to_string(), history(&[(10, 88_000, UNKNOWN_POSITION)]));
        unknowns.insert("S".to_string(), history(&[(10, 92_000, UNKNOWN_POSITION)]));
        let snapshot = positions_at_lap(10, &unknowns);
        assert_eq!(snapshot.entries[0].car_number, "F");

        // known position outranks the unknown sentinel
        let mut mixed = HashMap::new();
        mixed.insert("K".to_string(), history(&[(10, 99_000, 8)]));
        mixed.insert("U".to_string(), history(&[(10, 80_000, UNKNOWN_POSITION)]));
        let snapshot = positions_at_lap(10, &mixed);
        assert_eq!(snapshot.entries[0].car_number, "K");
    }

    #[test]
    fn test_more_laps_always_outranks_position_and_time() {
        let mut histories = HashMap::new();
        histories.insert("leader".to_string(), history(&[(1, 99_000, 9), (2, 99_000, 9)]));
        histories.insert("lapped".to_string(), history(&[(1, 80_000, 1)]));
        let snapshot = positions_at_lap(2, &histories);
        assert_eq!(snapshot.entries[0].car_number, "leader");
        assert_eq!(snapshot.entries[1].data_lap, 1);
    }

    #[test]
    fn test_explicit_lap_number_beats_array_position() {
        // array slot 3 (index 3) holds lap 5: the explicit field wins and a
        // linear search finds lap 4 elsewhere
        let shuffled = vec![
            lap(1, 90_000, 1),
            lap(2, 90_000, 1),
            lap(4, 90_500, 1),
            lap(5, 90_000, 1),
        ];
        match lookup_lap(&shuffled, 4) {
            LapLookup::Found(r) => assert_eq!(r.lap_time_ms, 90_500),
            other => panic!("unexpected lookup: {:?}", other),
        }
    }

    #[test]
    fn test_early_gap_is_omitted_not_carried_backward() {
        // history long enough for lap 1 but holding no lap-1 record
        let h = history(&[(2, 90_000, 1), (3, 90_000, 1)]);
        assert_eq!(lookup_lap(&h, 1), LapLookup::NoData);
    }

    #[test]
    fn test_lap_zero_and_empty_history() {
        assert_eq!(lookup_lap(&[], 3), LapLookup::NoData);
        let h = history(&[(1, 90_000, 1)]);
        assert_eq!(lookup_lap(&h, 0), LapLookup::NoData);
    }
}
