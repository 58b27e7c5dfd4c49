//! Live-channel envelope codec and typed dispatch
//!
//! The hub pushes either plain UTF-8 JSON or a compressed payload marked by
//! a fixed magic prefix. Compressed codec: strip prefix, base64-decode,
//! raw-deflate decompress, UTF-8 decode, JSON parse. A plain payload must
//! never be run through the decompressor, and vice versa.

use crate::errors::{PitwallError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde_json::Value;
use std::io::{Read, Write};
use tracing::debug;

/// Magic prefix marking a compressed envelope.
pub const COMPRESSED_PREFIX: &str = "z64:";

/// Cap on decompressed payload size. A full-session update is a few hundred
/// KB; anything near this is a corrupt or hostile frame.
const MAX_INFLATED_BYTES: u64 = 16 * 1024 * 1024;

/// Decode an inbound envelope, detecting the encoding by prefix.
pub fn decode_envelope(raw: &str) -> Result<Value> {
    match raw.strip_prefix(COMPRESSED_PREFIX) {
        Some(encoded) => {
            let compressed = BASE64.decode(encoded.trim())?;
            let mut inflated = String::new();
            DeflateDecoder::new(&compressed[..])
                .take(MAX_INFLATED_BYTES)
                .read_to_string(&mut inflated)
                .map_err(|e| PitwallError::Decode(format!("inflate failed: {}", e)))?;
            Ok(serde_json::from_str(&inflated)?)
        }
        None => Ok(serde_json::from_str(raw)?),
    }
}

/// Encode a value into the compressed envelope form. Production traffic is
/// inbound-only; this exists for round-trip tests and fixtures.
pub fn encode_envelope(value: &Value) -> Result<String> {
    let json = serde_json::to_vec(value)?;
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .and_then(|_| encoder.finish())
        .map(|compressed| format!("{}{}", COMPRESSED_PREFIX, BASE64.encode(compressed)))
        .map_err(|e| PitwallError::Decode(format!("deflate failed: {}", e)))
}

/// A decoded, classified live-channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Full-session state replacement.
    FullSession(Value),
    /// Incremental patch set against the current session state.
    PatchSet(Value),
    /// Batch of per-car position/timing records.
    CarPositionBatch(Vec<Value>),
    /// Batch of race-control log lines.
    ControlLogBatch(Vec<Value>),
    /// Per-car in-car payload.
    InCar(Value),
}

/// Classify a decoded payload by the channel that delivered it, falling back
/// to the payload's own discriminant field. Unknown shapes yield `None`
/// (skipped upstream with a debug log, never an error).
pub fn dispatch(channel: &str, payload: Value) -> Option<LiveEvent> {
    // Channel name wins; the payload's own discriminant field is the
    // fallback for hubs that multiplex everything over one channel.
    let kind = kind_of(channel).or_else(|| {
        payload
            .get("type")
            .and_then(Value::as_str)
            .and_then(kind_of)
    })?;

    let body = payload.get("data").cloned().unwrap_or(payload);
    match kind {
        "session" => Some(LiveEvent::FullSession(body)),
        "patch" => Some(LiveEvent::PatchSet(body)),
        "positions" => match body {
            Value::Array(cars) => Some(LiveEvent::CarPositionBatch(cars)),
            other => {
                debug!("positions payload was not an array: {}", other);
                None
            }
        },
        "controlLog" => match body {
            Value::Array(lines) => Some(LiveEvent::ControlLogBatch(lines)),
            single => Some(LiveEvent::ControlLogBatch(vec![single])),
        },
        "inCar" => Some(LiveEvent::InCar(body)),
        _ => None,
    }
}

fn kind_of(name: &str) -> Option<&'static str> {
    match name {
        "sessionUpdate" | "session" => Some("session"),
        "patch" | "delta" => Some("patch"),
        "positions" | "carPositions" => Some("positions"),
        "controlLog" => Some("controlLog"),
        "inCar" => Some("inCar"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compressed_round_trip() {
        let original = json!({
            "type": "session",
            "data": {"laps": 42, "flag": "green", "cars": [{"N": "24", "P": 1}]}
        });
        let encoded = encode_envelope(&original).unwrap();
        assert!(encoded.starts_with(COMPRESSED_PREFIX));
        let decoded = decode_envelope(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_plain_payload_skips_decompressor() {
        let raw = r#"{"type":"inCar","data":{"car":"24"}}"#;
        let decoded = decode_envelope(raw).unwrap();
        assert_eq!(decoded["data"]["car"], "24");
    }

    #[test]
    fn test_corrupt_compressed_payload_is_decode_error() {
        let err = decode_envelope("z64:!!!not-base64!!!").unwrap_err();
        assert!(matches!(err, PitwallError::Decode(_)));

        // valid base64 but not deflate data
        let bogus = format!("{}{}", COMPRESSED_PREFIX, BASE64.encode(b"plainly not deflate"));
        assert!(matches!(
            decode_envelope(&bogus).unwrap_err(),
            PitwallError::Decode(_)
        ));
    }

    #[test]
    fn test_dispatch_by_channel_name() {
        let event = dispatch("positions", json!([{"N": "24"}, {"N": "7"}])).unwrap();
        match event {
            LiveEvent::CarPositionBatch(cars) => assert_eq!(cars.len(), 2),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_by_discriminant_field() {
        let event = dispatch("", json!({"type": "patch", "data": {"laps": 12}})).unwrap();
        assert_eq!(event, LiveEvent::PatchSet(json!({"laps": 12})));
    }

    #[test]
    fn test_unknown_channel_is_skipped() {
        assert!(dispatch("heartbeat", json!({"seq": 1})).is_none());
    }
}
