use serde_json::Value;

use crate::hub::ActuatorState;

// ---------------------------------------------------------------------------
// Client-originated commands
// ---------------------------------------------------------------------------

/// Actuator command topics, taken from config. Commands on any other
/// topic are published as-is with no echo (and no allow-listing:
/// access control is explicitly out of scope).
#[derive(Debug, Clone)]
pub struct CommandTopics {
    pub led: String,
    pub relay1: String,
    pub relay2: String,
}

/// A parsed `{topic, payload}` command frame. The payload has already
/// been flattened to its broker wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub topic: String,
    pub payload: String,
}

/// Parse an inbound WebSocket text frame into a Command. Objects and
/// arrays are serialized to JSON text, primitives to their bare string
/// form. Frames without a non-empty string topic are rejected.
pub fn parse_command(text: &str) -> Option<Command> {
    let frame: Value = serde_json::from_str(text).ok()?;
    let topic = frame.get("topic")?.as_str()?.trim();
    if topic.is_empty() {
        return None;
    }
    let payload = frame.get("payload").map(payload_text).unwrap_or_default();
    Some(Command {
        topic: topic.to_string(),
        payload,
    })
}

fn payload_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// "ON"/"1" style payloads map to 1, everything else to 0.
fn on_value(payload: &str) -> i64 {
    if payload == "ON" || payload == "1" {
        1
    } else {
        0
    }
}

/// Optimistic acknowledgment for well-known actuator topics: the state
/// envelope is synthesized from the *requested* value, before any device
/// confirmation. True state is reconciled only when the device reports
/// it back over telemetry.
///
/// Returns the state topic (`led_state` / `relay1_state` / `relay2_state`)
/// and the echoed value, or None for topics without an echo.
pub fn optimistic_echo(
    topics: &CommandTopics,
    cmd: &Command,
    now_ms: i64,
) -> Option<(&'static str, ActuatorState)> {
    let state_topic = if cmd.topic == topics.led {
        "led_state"
    } else if cmd.topic == topics.relay1 {
        "relay1_state"
    } else if cmd.topic == topics.relay2 {
        "relay2_state"
    } else {
        return None;
    };
    Some((
        state_topic,
        ActuatorState {
            value: on_value(&cmd.payload),
            ts: now_ms,
        },
    ))
}

// ===========================================================================
// Tests
// ===========================================================================
