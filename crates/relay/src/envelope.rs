use serde::Serialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Envelope: the unit broadcast to WebSocket subscribers
// ---------------------------------------------------------------------------

/// A normalized broker message. `ts` is relay receipt time in
/// milliseconds; device clocks are never trusted for ordering.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub data: Payload,
    pub ts: i64,
}

/// Either a successfully decoded JSON value or the raw payload text.
/// Untagged so the wire form stays plain `{topic, data, ts}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Payload {
    Json(Value),
    Text(String),
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            Payload::Text(_) => None,
        }
    }
}

impl Envelope {
    pub fn new(topic: impl Into<String>, data: Payload, ts: i64) -> Self {
        Self {
            topic: topic.into(),
            data,
            ts,
        }
    }

    /// Synthesized envelope carrying a JSON value (actuator echoes,
    /// device_status, and other relay-originated events).
    pub fn synthetic(topic: impl Into<String>, data: Value, ts: i64) -> Self {
        Self::new(topic, Payload::Json(data), ts)
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Convert an inbound `(topic, raw bytes)` pair into an Envelope. Never
/// fails: a payload that is not valid JSON is carried forward as its
/// (lossy UTF-8) text instead of being dropped.
pub fn normalize(topic: &str, payload: &[u8], now_ms: i64) -> Envelope {
    let data = match serde_json::from_slice::<Value>(payload) {
        Ok(v) => Payload::Json(v),
        Err(_) => Payload::Text(String::from_utf8_lossy(payload).into_owned()),
    };
    Envelope::new(topic, data, now_ms)
}

/// Cheap structural heuristic: does this decoded payload resemble a
/// telemetry record? Checks for a device identifier, temperature or
/// humidity field (canonical or short alias), not a full schema.
pub fn looks_like_telemetry(data: &Value) -> bool {
    let Some(obj) = data.as_object() else {
        return false;
    };
    ["deviceId", "device", "temperature", "temp", "humidity", "hum"]
        .iter()
        .any(|k| obj.contains_key(*k))
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -- normalize ----------------------------------------------------------

    #[test]
    fn normalize_valid_json_object() {
        let env = normalize("esp32/telemetry", br#"{"temperature":21.5}"#, 1000);
        assert_eq!(env.topic, "esp32/telemetry");
        assert_eq!(env.ts, 1000);
        assert_eq!(env.data, Payload::Json(json!({"temperature": 21.5})));
    }

    #[test]
    fn normalize_malformed_payload_falls_back_to_text() {
        let env = normalize("esp32/telemetry", b"not json at all", 1000);
        assert_eq!(env.data, Payload::Text("not json at all".to_string()));
    }

    #[test]
    fn normalize_scalar_json_is_json() {
        let env = normalize("t", b"42", 0);
        assert_eq!(env.data, Payload::Json(json!(42)));
    }

    #[test]
    fn normalize_invalid_utf8_is_lossy_text() {
        let env = normalize("t", &[0xff, 0xfe, b'x'], 0);
        match env.data {
            Payload::Text(s) => assert!(s.ends_with('x')),
            Payload::Json(_) => panic!("expected text fallback"),
        }
    }

    #[test]
    fn normalize_empty_payload_is_empty_text() {
        let env = normalize("t", b"", 0);
        assert_eq!(env.data, Payload::Text(String::new()));
    }

    // -- wire shape ---------------------------------------------------------

    #[test]
    fn envelope_serializes_flat() {
        let env = Envelope::new(
            "esp32/telemetry",
            Payload::Json(json!({"humidity": 55})),
            1234,
        );
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["topic"], "esp32/telemetry");
        assert_eq!(v["data"]["humidity"], 55);
        assert_eq!(v["ts"], 1234);
        assert_eq!(v.as_object().unwrap().len(), 3);
    }

    #[test]
    fn text_payload_serializes_as_plain_string() {
        let env = Envelope::new("t", Payload::Text("raw".into()), 1);
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["data"], "raw");
    }

    // -- looks_like_telemetry -----------------------------------------------

    #[test]
    fn telemetry_heuristic_matches_device_id() {
        assert!(looks_like_telemetry(&json!({"deviceId": "esp32-01"})));
        assert!(looks_like_telemetry(&json!({"device": "esp32-01"})));
    }

    #[test]
    fn telemetry_heuristic_matches_temperature_or_humidity() {
        assert!(looks_like_telemetry(&json!({"temperature": 24.3})));
        assert!(looks_like_telemetry(&json!({"temp": 24.3})));
        assert!(looks_like_telemetry(&json!({"humidity": 55})));
        assert!(looks_like_telemetry(&json!({"hum": 55})));
    }

    #[test]
    fn telemetry_heuristic_rejects_unrelated_object() {
        assert!(!looks_like_telemetry(&json!({"led": 1})));
    }

    #[test]
    fn telemetry_heuristic_rejects_non_objects() {
        assert!(!looks_like_telemetry(&json!("temperature")));
        assert!(!looks_like_telemetry(&json!(21.5)));
        assert!(!looks_like_telemetry(&json!(null)));
    }

    // -- now_ms -------------------------------------------------------------

    #[test]
    fn now_ms_is_recent() {
        let ts = now_ms();
        // After 2024-01-01 and before 2040-01-01, in milliseconds.
        assert!(ts > 1_704_067_200_000, "timestamp too old: {ts}");
        assert!(ts < 2_208_988_800_000, "timestamp too far in future: {ts}");
    }
}
