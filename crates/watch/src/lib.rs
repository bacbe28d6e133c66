//! Consuming side of the AG360 feed: a dual-transport telemetry tracker
//! with time-windowed online/offline determination.
//!
//! [`liveness`] holds the pure state machine (message staleness window,
//! per-transport close grace); [`transport`] runs the actual
//! MQTT-over-WebSocket and relay-WebSocket connections and feeds it.

pub mod liveness;
pub mod transport;
