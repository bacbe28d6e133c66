use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::envelope::Envelope;

// ---------------------------------------------------------------------------
// Public type aliases
// ---------------------------------------------------------------------------

pub type SharedHub = Arc<Hub>;
pub type ClientId = u64;

/// Per-client send buffer. A client that stops draining gets its
/// overflow dropped once this fills; memory per client stays capped.
pub const CLIENT_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Last acknowledged (or optimistically echoed) actuator state.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActuatorState {
    pub value: i64,
    pub ts: i64,
}

/// Snapshot served by `/api/last`.
#[derive(Debug, Serialize)]
pub struct LastSnapshot {
    pub online: bool,
    pub telemetry: Option<Value>,
    pub led: Option<ActuatorState>,
}

struct HubInner {
    next_id: ClientId,
    clients: HashMap<ClientId, mpsc::Sender<String>>,
    /// Single-writer caches: overwritten by the message-handling path,
    /// snapshotted for late joiners. Never mutated elsewhere.
    last_envelope: Option<Envelope>,
    actuators: HashMap<String, ActuatorState>,
    last_telemetry: Option<Value>,
    last_telemetry_at: Option<i64>,
    device_online: bool,
}

/// Fan-out hub for WebSocket subscribers, plus the process-wide
/// "last known state" cache handed to newly connecting clients.
///
/// Delivery is best-effort: a client whose channel is gone is skipped,
/// never buffered for. Per-client ordering equals hub processing order.
pub struct Hub {
    staleness_ms: i64,
    inner: RwLock<HubInner>,
}

impl Hub {
    pub fn new(staleness_ms: i64) -> SharedHub {
        Arc::new(Self {
            staleness_ms,
            inner: RwLock::new(HubInner {
                next_id: 0,
                clients: HashMap::new(),
                last_envelope: None,
                actuators: HashMap::new(),
                last_telemetry: None,
                last_telemetry_at: None,
                device_online: false,
            }),
        })
    }

    // -- client lifecycle ---------------------------------------------------

    /// Register a new subscriber and immediately queue the catch-up
    /// snapshot: device status, the last broadcast envelope (if any),
    /// then the known actuator states. A late joiner therefore sees
    /// current state without waiting for the next broker message.
    pub async fn register(&self, now_ms: i64) -> (ClientId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let mut inner = self.inner.write().await;

        let online = inner.online_at(now_ms, self.staleness_ms);
        let mut seed: Vec<Envelope> = Vec::new();
        seed.push(Envelope::synthetic(
            "device_status",
            json!({ "online": online }),
            now_ms,
        ));
        if let Some(env) = &inner.last_envelope {
            seed.push(env.clone());
        }
        let mut topics: Vec<&String> = inner.actuators.keys().collect();
        topics.sort();
        for topic in topics {
            let state = &inner.actuators[topic];
            seed.push(Envelope::synthetic(
                topic.clone(),
                json!({ "value": state.value, "ts": state.ts }),
                now_ms,
            ));
        }
        for env in &seed {
            if let Ok(text) = serde_json::to_string(env) {
                let _ = tx.try_send(text);
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.clients.insert(id, tx);
        debug!(client_id = id, clients = inner.clients.len(), "ws client registered");
        (id, rx)
    }

    pub async fn unregister(&self, id: ClientId) {
        let mut inner = self.inner.write().await;
        inner.clients.remove(&id);
        debug!(client_id = id, clients = inner.clients.len(), "ws client unregistered");
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    // -- broadcast ----------------------------------------------------------

    /// Serialize once and deliver to every connected client. Clients whose
    /// receive side is gone, or whose buffer is full, are skipped rather
    /// than buffered for; a stalled client costs at most `CLIENT_BUFFER`
    /// queued messages and never delays the others. The envelope becomes
    /// the new "last known" slot for late joiners.
    pub async fn broadcast(&self, envelope: &Envelope) {
        let text = match serde_json::to_string(envelope) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("envelope serialization failed: {e}");
                return;
            }
        };

        let mut inner = self.inner.write().await;
        inner.last_envelope = Some(envelope.clone());
        for tx in inner.clients.values() {
            let _ = tx.try_send(text.clone());
        }
    }

    // -- last-known-state cache ---------------------------------------------

    /// Record a telemetry arrival. Returns true when this flips the
    /// derived device status from offline to online (the caller then
    /// broadcasts a `device_status` envelope).
    pub async fn record_telemetry(&self, data: &Value, now_ms: i64) -> bool {
        let mut inner = self.inner.write().await;
        inner.last_telemetry = Some(data.clone());
        inner.last_telemetry_at = Some(now_ms);
        let came_online = !inner.device_online;
        inner.device_online = true;
        came_online
    }

    /// Record an actuator state (optimistic echo or device-reported).
    pub async fn record_actuator(&self, topic: &str, state: ActuatorState) {
        let mut inner = self.inner.write().await;
        inner.actuators.insert(topic.to_string(), state);
    }

    pub async fn actuator(&self, topic: &str) -> Option<ActuatorState> {
        self.inner.read().await.actuators.get(topic).cloned()
    }

    /// Flip the derived device status to offline when the last telemetry
    /// is older than the staleness window. Returns true on the transition
    /// (the caller broadcasts the `device_status` envelope).
    pub async fn mark_stale(&self, now_ms: i64) -> bool {
        let mut inner = self.inner.write().await;
        if inner.device_online && !inner.online_at(now_ms, self.staleness_ms) {
            inner.device_online = false;
            return true;
        }
        false
    }

    pub async fn snapshot(&self, now_ms: i64) -> LastSnapshot {
        let inner = self.inner.read().await;
        LastSnapshot {
            online: inner.online_at(now_ms, self.staleness_ms),
            telemetry: inner.last_telemetry.clone(),
            led: inner.actuators.get("led_state").cloned(),
        }
    }
}

impl HubInner {
    fn online_at(&self, now_ms: i64, staleness_ms: i64) -> bool {
        self.last_telemetry_at
            .map(|t| now_ms - t <= staleness_ms)
            .unwrap_or(false)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
