use serde::Serialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// TelemetrySample: the persisted, normalized view of a telemetry payload
// ---------------------------------------------------------------------------

/// Each sensor field accepts a canonical name and a short alias
/// (what the firmware actually emits varies by build):
///
/// | canonical   | alias  |
/// |-------------|--------|
/// | deviceId    | device |
/// | temperature | temp   |
/// | humidity    | hum    |
/// | soilPct     | soil   |
/// | ldrPct      | ldr    |
/// | relay1      | r1     |
/// | relay2      | r2     |
///
/// Missing numeric readings stay `None`, never coerced to zero, so
/// "no reading" and "reading of 0" remain distinguishable downstream.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TelemetrySample {
    pub device_id: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_pct: Option<f64>,
    pub ldr_pct: Option<f64>,
    pub relay1: i64,
    pub relay2: i64,
    /// Original payload, retained verbatim for forensic replay.
    pub raw: Value,
    /// Milliseconds since epoch; device-supplied `ts` if present,
    /// otherwise relay receipt time.
    pub created_at: i64,
}

const DEVICE_ALIASES: [&str; 2] = ["deviceId", "device"];

fn string_field(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(|v| v.as_str().map(str::to_string))
}

fn number_field(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().filter_map(|k| obj.get(*k)).find_map(Value::as_f64)
}

fn relay_field(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> i64 {
    number_field(obj, keys)
        .map(|v| if v != 0.0 { 1 } else { 0 })
        .unwrap_or(0)
}

impl TelemetrySample {
    /// Build a sample from a decoded telemetry payload. `received_ms` is the
    /// relay receipt time, used when the payload carries no `ts` field.
    /// Returns `None` for non-object payloads (nothing recognizable to keep).
    pub fn from_payload(data: &Value, received_ms: i64) -> Option<Self> {
        let obj = data.as_object()?;

        let created_at = obj
            .get("ts")
            .and_then(Value::as_i64)
            .unwrap_or(received_ms);

        Some(Self {
            device_id: string_field(obj, &DEVICE_ALIASES)
                .unwrap_or_else(|| "unknown".to_string()),
            temperature: number_field(obj, &["temperature", "temp"]),
            humidity: number_field(obj, &["humidity", "hum"]),
            soil_pct: number_field(obj, &["soilPct", "soil"]),
            ldr_pct: number_field(obj, &["ldrPct", "ldr"]),
            relay1: relay_field(obj, &["relay1", "r1"]),
            relay2: relay_field(obj, &["relay2", "r2"]),
            raw: data.clone(),
            created_at,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
