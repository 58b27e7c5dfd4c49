//! Durable record store
//!
//! Thin upsert-by-natural-key layer over SQLite. The rest of the system
//! treats persistence as `upsert(table, record, conflict_keys)` plus reads;
//! no component issues SQL of its own. WAL mode so the pollers can write
//! while the replay paths read.

use crate::errors::{PitwallError, Result};
use crate::models::{FlagStatus, LapRecord, TransponderMapping};
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Backends enforce batch limits; stay under them.
const UPSERT_CHUNK: usize = 500;
/// Page-size ceiling for bulk reads. `get_all` loops until a short page.
const READ_PAGE: usize = 1000;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS transponder_mappings (
    transponder_id TEXT PRIMARY KEY,
    car_number TEXT NOT NULL,
    driver_name TEXT,
    team_name TEXT,
    class_name TEXT,
    updated_at TEXT
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS lap_records (
    session_id TEXT NOT NULL,
    car_number TEXT NOT NULL,
    lap_number INTEGER NOT NULL,
    lap_time_ms INTEGER NOT NULL,
    position INTEGER NOT NULL,
    flag TEXT NOT NULL,
    total_elapsed_ms INTEGER NOT NULL,
    PRIMARY KEY (session_id, car_number, lap_number)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_lap_records_session
    ON lap_records(session_id, car_number, lap_number);
"#;

/// SQLite-backed store shared across tasks.
#[derive(Clone)]
pub struct RecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl RecordStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert-or-update one record by its natural key.
    ///
    /// Non-key fields are overwritten from the incoming record
    /// (last-write-wins at the row level; field-level merge policy lives in
    /// the reconciliation engine, not here).
    pub fn upsert(&self, table: &str, record: &Map<String, Value>, conflict_keys: &[&str]) -> Result<()> {
        let conn = self.conn.lock();
        upsert_row(&conn, table, record, conflict_keys)
    }

    /// Bulk upsert, chunked so large batches respect backend limits.
    /// Each chunk runs in its own transaction.
    pub fn upsert_many(
        &self,
        table: &str,
        records: &[Map<String, Value>],
        conflict_keys: &[&str],
    ) -> Result<usize> {
        let mut conn = self.conn.lock();
        let mut written = 0usize;
        for chunk in records.chunks(UPSERT_CHUNK) {
            let tx = conn.transaction()?;
            for record in chunk {
                upsert_row(&tx, table, record, conflict_keys)?;
            }
            tx.commit()?;
            written += chunk.len();
            debug!("upsert_many: {} rows into {} ({} total)", chunk.len(), table, written);
        }
        Ok(written)
    }

    /// Fetch a single record by one key column. Absence is `Ok(None)`.
    pub fn get(&self, table: &str, key_column: &str, key: &str) -> Result<Option<Map<String, Value>>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT * FROM {} WHERE {} = ?1", table, key_column);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_map(row)?)),
            None => Ok(None),
        }
    }

    /// Fetch every record in a table, paging until a short page is returned.
    pub fn get_all(&self, table: &str) -> Result<Vec<Map<String, Value>>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT * FROM {} LIMIT ?1 OFFSET ?2", table);
        let mut stmt = conn.prepare(&sql)?;
        let mut out = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut page = Vec::new();
            let mut rows = stmt.query(rusqlite::params![READ_PAGE as i64, offset as i64])?;
            while let Some(row) = rows.next()? {
                page.push(row_to_map(row)?);
            }
            let short = page.len() < READ_PAGE;
            offset += page.len();
            out.extend(page);
            if short {
                break;
            }
        }
        Ok(out)
    }

    // ---- typed convenience wrappers ------------------------------------

    pub fn upsert_transponder_mapping(&self, mapping: &TransponderMapping) -> Result<()> {
        let mut record = to_record(mapping)?;
        record.insert(
            "updated_at".into(),
            Value::from(chrono::Utc::now().to_rfc3339()),
        );
        self.upsert("transponder_mappings", &record, &["transponder_id"])
    }

    pub fn get_transponder_mapping(&self, transponder_id: &str) -> Result<Option<TransponderMapping>> {
        match self.get("transponder_mappings", "transponder_id", transponder_id)? {
            Some(map) => Ok(Some(from_record(map)?)),
            None => Ok(None),
        }
    }

    pub fn all_transponder_mappings(&self) -> Result<Vec<TransponderMapping>> {
        self.get_all("transponder_mappings")?
            .into_iter()
            .map(from_record)
            .collect()
    }

    /// Persist a car's lap history for a session.
    pub fn save_lap_history(
        &self,
        session_id: &str,
        car_number: &str,
        laps: &[LapRecord],
    ) -> Result<usize> {
        let records: Vec<Map<String, Value>> = laps
            .iter()
            .map(|lap| {
                let mut m = Map::new();
                m.insert("session_id".into(), Value::from(session_id));
                m.insert("car_number".into(), Value::from(car_number));
                m.insert("lap_number".into(), Value::from(lap.lap_number));
                m.insert("lap_time_ms".into(), Value::from(lap.lap_time_ms));
                m.insert("position".into(), Value::from(lap.position));
                m.insert("flag".into(), Value::from(lap.flag.as_str()));
                m.insert("total_elapsed_ms".into(), Value::from(lap.total_elapsed_ms));
                m
            })
            .collect();
        self.upsert_many(
            "lap_records",
            &records,
            &["session_id", "car_number", "lap_number"],
        )
    }

    /// Load every car's lap history for a session, ordered by lap number.
    pub fn load_lap_histories(&self, session_id: &str) -> Result<HashMap<String, Vec<LapRecord>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT car_number, lap_number, lap_time_ms, position, flag, total_elapsed_ms
             FROM lap_records WHERE session_id = ?1
             ORDER BY car_number, lap_number",
        )?;
        let mut rows = stmt.query([session_id])?;
        let mut histories: HashMap<String, Vec<LapRecord>> = HashMap::new();
        while let Some(row) = rows.next()? {
            let car: String = row.get(0)?;
            let flag: String = row.get(4)?;
            histories.entry(car).or_default().push(LapRecord {
                lap_number: row.get(1)?,
                lap_time_ms: row.get(2)?,
                position: row.get(3)?,
                flag: FlagStatus::from_provider(&flag),
                total_elapsed_ms: row.get(5)?,
            });
        }
        Ok(histories)
    }
}

fn upsert_row(
    conn: &Connection,
    table: &str,
    record: &Map<String, Value>,
    conflict_keys: &[&str],
) -> Result<()> {
    if record.is_empty() {
        return Err(PitwallError::Decode("empty record for upsert".into()));
    }
    let columns: Vec<&str> = record.keys().map(String::as_str).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !conflict_keys.contains(c))
        .map(|c| format!("{} = excluded.{}", c, c))
        .collect();
    let sql = if updates.is_empty() {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO NOTHING",
            table,
            columns.join(", "),
            placeholders.join(", "),
            conflict_keys.join(", "),
        )
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
            table,
            columns.join(", "),
            placeholders.join(", "),
            conflict_keys.join(", "),
            updates.join(", "),
        )
    };
    let values: Vec<rusqlite::types::Value> = record.values().map(json_to_sql).collect();
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

fn json_to_sql(v: &Value) -> rusqlite::types::Value {
    match v {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        // Nested structures persist as JSON text.
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

fn row_to_map(row: &rusqlite::Row<'_>) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for (i, name) in row.as_ref().column_names().iter().enumerate() {
        let value = match row.get_ref(i)? {
            rusqlite::types::ValueRef::Null => Value::Null,
            rusqlite::types::ValueRef::Integer(n) => Value::from(n),
            rusqlite::types::ValueRef::Real(f) => Value::from(f),
            rusqlite::types::ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).into_owned()),
            rusqlite::types::ValueRef::Blob(b) => Value::from(base64_blob(b)),
        };
        map.insert((*name).to_string(), value);
    }
    Ok(map)
}

fn base64_blob(b: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(b)
}

fn to_record<T: serde::Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(PitwallError::Decode("record did not serialize to an object".into())),
    }
}

fn from_record<T: serde::de::DeserializeOwned>(map: Map<String, Value>) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(map))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(id: &str, car: &str) -> TransponderMapping {
        TransponderMapping {
            transponder_id: id.to_string(),
            car_number: car.to_string(),
            driver_name: Some("A. Driver".to_string()),
            team_name: None,
            class_name: Some("GT3".to_string()),
        }
    }

    #[test]
    fn test_upsert_is_insert_or_update() {
        let store = RecordStore::open_in_memory().unwrap();
        store.upsert_transponder_mapping(&mapping("7781", "24")).unwrap();
        // same transponder, new driver: row is replaced, not duplicated
        let mut updated = mapping("7781", "24");
        updated.driver_name = Some("B. Driver".to_string());
        store.upsert_transponder_mapping(&updated).unwrap();

        let all = store.all_transponder_mappings().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].driver_name.as_deref(), Some("B. Driver"));
    }

    #[test]
    fn test_get_missing_returns_none() {
        let store = RecordStore::open_in_memory().unwrap();
        assert!(store.get_transponder_mapping("nope").unwrap().is_none());
    }

    #[test]
    fn test_upsert_many_chunks_and_get_all_pages() {
        let store = RecordStore::open_in_memory().unwrap();
        // 1203 rows: crosses both the 500-row upsert chunk and the 1000-row
        // read page boundaries.
        let records: Vec<Map<String, Value>> = (0..1203)
            .map(|i| {
                let mut m = Map::new();
                m.insert("transponder_id".into(), Value::from(format!("t{}", i)));
                m.insert("car_number".into(), Value::from(format!("{}", i)));
                m
            })
            .collect();
        let written = store
            .upsert_many("transponder_mappings", &records, &["transponder_id"])
            .unwrap();
        assert_eq!(written, 1203);

        let all = store.get_all("transponder_mappings").unwrap();
        assert_eq!(all.len(), 1203);
    }

    #[test]
    fn test_lap_history_round_trip() {
        let store = RecordStore::open_in_memory().unwrap();
        let laps = vec![
            LapRecord {
                lap_number: 1,
                lap_time_ms: 92_000,
                position: 3,
                flag: FlagStatus::Green,
                total_elapsed_ms: 92_000,
            },
            LapRecord {
                lap_number: 2,
                lap_time_ms: 91_500,
                position: 2,
                flag: FlagStatus::Yellow,
                total_elapsed_ms: 183_500,
            },
        ];
        store.save_lap_history("race-9", "24", &laps).unwrap();
        let histories = store.load_lap_histories("race-9").unwrap();
        assert_eq!(histories["24"], laps);
    }
}
