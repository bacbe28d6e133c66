//! Dual-transport feed runner: direct MQTT-over-WebSocket when a broker
//! URL is configured, the relay's WebSocket feed as fallback. Each
//! transport retries on its own fixed interval forever; only explicit
//! `shutdown()` stops them.

use futures_util::StreamExt;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::liveness::{Liveness, LivenessConfig, TransportKind};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Broker websocket URL (e.g. "ws://10.1.1.113:8080/mqtt"). None
    /// means relay-only mode: the fallback starts immediately.
    pub mqtt_ws_url: Option<String>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    /// Relay feed URL, e.g. "ws://127.0.0.1:8080/ws".
    pub relay_ws_url: String,
    pub telemetry_topic: String,
    pub liveness: LivenessConfig,
    pub direct_retry: Duration,
    pub relay_retry: Duration,
    /// How long the fallback waits before its first attempt while the
    /// preferred transport gets a chance to come up.
    pub fallback_delay: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            mqtt_ws_url: None,
            mqtt_username: None,
            mqtt_password: None,
            relay_ws_url: "ws://127.0.0.1:8080/ws".to_string(),
            telemetry_topic: "esp32/telemetry".to_string(),
            liveness: LivenessConfig::default(),
            direct_retry: Duration::from_secs(4),
            relay_retry: Duration::from_secs(3),
            fallback_delay: Duration::from_millis(1500),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state between transport tasks
// ---------------------------------------------------------------------------

struct Shared {
    liveness: Mutex<Liveness>,
    latest: Mutex<Option<Value>>,
    online_tx: watch::Sender<bool>,
}

impl Shared {
    fn on_connecting(&self, kind: TransportKind) {
        self.liveness.lock().unwrap().on_connecting(kind);
    }

    fn on_open(&self, kind: TransportKind) {
        self.liveness.lock().unwrap().on_open(kind);
        self.recompute();
    }

    fn on_close(&self, kind: TransportKind) {
        self.liveness.lock().unwrap().on_close(kind, Instant::now());
        self.recompute();
    }

    fn record_message(&self, data: Value) {
        self.liveness.lock().unwrap().on_message(Instant::now());
        *self.latest.lock().unwrap() = Some(data);
        self.recompute();
    }

    fn transport_up(&self, kind: TransportKind) -> bool {
        self.liveness.lock().unwrap().transport_up(kind, Instant::now())
    }

    fn recompute(&self) {
        let online = self.liveness.lock().unwrap().online(Instant::now());
        self.online_tx.send_if_modified(|current| {
            if *current != online {
                *current = online;
                true
            } else {
                false
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Handle over the running feed. Dropping it does NOT stop the tasks;
/// call `shutdown()`.
pub struct Tracker {
    shared: Arc<Shared>,
    online_rx: watch::Receiver<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Tracker {
    pub fn start(cfg: WatchConfig) -> Tracker {
        let (online_tx, online_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            liveness: Mutex::new(Liveness::new(cfg.liveness)),
            latest: Mutex::new(None),
            online_tx,
        });

        let mut tasks = Vec::new();
        if cfg.mqtt_ws_url.is_some() {
            tasks.push(tokio::spawn(run_direct(cfg.clone(), Arc::clone(&shared))));
        }
        tasks.push(tokio::spawn(run_relay(cfg.clone(), Arc::clone(&shared))));

        // The staleness window expires without any transport event
        // firing, so the online signal is re-derived on a short tick.
        let tick_shared = Arc::clone(&shared);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            loop {
                ticker.tick().await;
                tick_shared.recompute();
            }
        }));

        Tracker {
            shared,
            online_rx,
            tasks,
        }
    }

    pub fn online(&self) -> bool {
        *self.online_rx.borrow()
    }

    pub fn online_rx(&self) -> watch::Receiver<bool> {
        self.online_rx.clone()
    }

    pub fn latest(&self) -> Option<Value> {
        self.shared.latest.lock().unwrap().clone()
    }

    pub fn source(&self) -> Option<TransportKind> {
        self.shared.liveness.lock().unwrap().source(Instant::now())
    }

    /// Synchronous teardown: every transport task and pending retry
    /// timer is cancelled; a partially-constructed connection cannot
    /// leak a reconnect.
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Direct MQTT-over-WebSocket (preferred)
// ---------------------------------------------------------------------------

async fn run_direct(cfg: WatchConfig, shared: Arc<Shared>) {
    let url = cfg.mqtt_ws_url.clone().unwrap_or_default();
    let client_id = format!("ag360-watch-{}", std::process::id());

    // For websocket transport rumqttc takes the full URL; the port
    // argument is unused.
    let mut options = MqttOptions::new(client_id, &url, 80);
    options.set_transport(Transport::Ws);
    options.set_keep_alive(Duration::from_secs(30));
    if let Some(user) = &cfg.mqtt_username {
        options.set_credentials(user, cfg.mqtt_password.clone().unwrap_or_default());
    }

    let (client, mut eventloop) = AsyncClient::new(options, 16);
    shared.on_connecting(TransportKind::Direct);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(url = %url, "direct transport connected");
                shared.on_open(TransportKind::Direct);
                if let Err(e) = client.subscribe(&cfg.telemetry_topic, QoS::AtMostOnce).await {
                    warn!("direct subscribe failed: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                // Only JSON payloads count as telemetry on this path.
                if let Ok(data) = serde_json::from_slice::<Value>(&p.payload) {
                    shared.record_message(data);
                }
            }
            Ok(_) => {}
            Err(e) => {
                debug!("direct transport error: {e}");
                shared.on_close(TransportKind::Direct);
                sleep(cfg.direct_retry).await;
                shared.on_connecting(TransportKind::Direct);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Relay WebSocket (fallback)
// ---------------------------------------------------------------------------

/// Gate for the fallback's next connect attempt. With a preferred
/// direct transport configured, the relay holds off until the startup
/// delay has elapsed, and then only attempts while direct is not up;
/// a healthy direct feed is never doubled by a relay connection.
/// Relay-only mode attempts immediately and always.
fn fallback_ready(
    direct_configured: bool,
    started_at: Instant,
    fallback_delay: Duration,
    direct_up: bool,
    now: Instant,
) -> bool {
    if !direct_configured {
        return true;
    }
    if now.duration_since(started_at) < fallback_delay {
        return false;
    }
    !direct_up
}

async fn run_relay(cfg: WatchConfig, shared: Arc<Shared>) {
    let direct_configured = cfg.mqtt_ws_url.is_some();
    let started_at = Instant::now();

    loop {
        let now = Instant::now();
        if !fallback_ready(
            direct_configured,
            started_at,
            cfg.fallback_delay,
            shared.transport_up(TransportKind::Direct),
            now,
        ) {
            let elapsed = now.duration_since(started_at);
            let wait = if elapsed < cfg.fallback_delay {
                cfg.fallback_delay - elapsed
            } else {
                cfg.relay_retry
            };
            sleep(wait).await;
            continue;
        }

        shared.on_connecting(TransportKind::Relay);
        match tokio_tungstenite::connect_async(&cfg.relay_ws_url).await {
            Ok((ws, _response)) => {
                info!(url = %cfg.relay_ws_url, "relay transport connected");
                shared.on_open(TransportKind::Relay);

                let (_write, mut read) = ws.split();
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                            handle_relay_frame(&cfg.telemetry_topic, &shared, text.as_str());
                        }
                        Ok(tokio_tungstenite::tungstenite::Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!("relay transport read error: {e}");
                            break;
                        }
                    }
                }
                shared.on_close(TransportKind::Relay);
            }
            Err(e) => {
                debug!("relay transport connect failed: {e}");
                shared.on_close(TransportKind::Relay);
            }
        }
        sleep(cfg.relay_retry).await;
    }
}

/// The relay speaks raw envelopes `{topic, data, ts}`, but older
/// deployments emit bare telemetry objects; tolerate both.
fn handle_relay_frame(telemetry_topic: &str, shared: &Shared, text: &str) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        return;
    };
    match (frame.get("topic").and_then(Value::as_str), frame.get("data")) {
        (Some(topic), Some(data)) => {
            if topic == telemetry_topic {
                shared.record_message(data.clone());
            }
        }
        _ => {
            if frame.get("temperature").is_some() || frame.get("humidity").is_some() {
                shared.record_message(frame);
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shared() -> (Arc<Shared>, watch::Receiver<bool>) {
        let (online_tx, online_rx) = watch::channel(false);
        (
            Arc::new(Shared {
                liveness: Mutex::new(Liveness::new(LivenessConfig::default())),
                latest: Mutex::new(None),
                online_tx,
            }),
            online_rx,
        )
    }

    // -- frame handling -----------------------------------------------------

    #[test]
    fn envelope_frame_records_inner_data() {
        let (shared, rx) = test_shared();
        handle_relay_frame(
            "esp32/telemetry",
            &shared,
            r#"{"topic":"esp32/telemetry","data":{"temperature":24.3},"ts":1}"#,
        );
        assert_eq!(
            shared.latest.lock().unwrap().as_ref().unwrap()["temperature"],
            24.3
        );
        assert!(*rx.borrow());
    }

    #[test]
    fn bare_telemetry_frame_is_tolerated() {
        let (shared, _rx) = test_shared();
        handle_relay_frame("esp32/telemetry", &shared, r#"{"temperature":20.1,"humidity":60}"#);
        assert_eq!(
            shared.latest.lock().unwrap().as_ref().unwrap()["humidity"],
            60
        );
    }

    #[test]
    fn other_topic_envelopes_are_ignored() {
        let (shared, rx) = test_shared();
        handle_relay_frame(
            "esp32/telemetry",
            &shared,
            r#"{"topic":"led_state","data":{"value":1,"ts":1},"ts":1}"#,
        );
        assert!(shared.latest.lock().unwrap().is_none());
        assert!(!*rx.borrow());
    }

    #[test]
    fn garbage_frame_is_ignored() {
        let (shared, rx) = test_shared();
        handle_relay_frame("esp32/telemetry", &shared, "{{nope");
        handle_relay_frame("esp32/telemetry", &shared, r#"{"led":1}"#);
        assert!(shared.latest.lock().unwrap().is_none());
        assert!(!*rx.borrow());
    }

    // -- online signal ------------------------------------------------------

    #[test]
    fn transport_open_flips_online_signal() {
        let (shared, rx) = test_shared();
        assert!(!*rx.borrow());
        shared.on_open(TransportKind::Relay);
        assert!(*rx.borrow());
    }

    #[test]
    fn close_without_grace_history_flips_offline() {
        let (shared, rx) = test_shared();
        shared.on_connecting(TransportKind::Relay);
        // failed connect attempt: no grace, still offline
        shared.on_close(TransportKind::Relay);
        assert!(!*rx.borrow());
    }

    #[tokio::test]
    async fn established_close_keeps_online_through_grace() {
        let (shared, rx) = test_shared();
        shared.on_open(TransportKind::Direct);
        shared.on_close(TransportKind::Direct);
        // within the 4s grace window the signal must not flap
        assert!(*rx.borrow());
    }

    // -- fallback gate ------------------------------------------------------

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn fallback_waits_out_the_startup_delay() {
        let t0 = Instant::now();
        let delay = ms(1_500);
        assert!(!fallback_ready(true, t0, delay, false, t0));
        assert!(!fallback_ready(true, t0, delay, false, t0 + ms(1_400)));
        assert!(fallback_ready(true, t0, delay, false, t0 + ms(1_600)));
    }

    #[test]
    fn fallback_skips_attempts_while_direct_is_up() {
        let t0 = Instant::now();
        let delay = ms(1_500);
        assert!(!fallback_ready(true, t0, delay, true, t0 + ms(5_000)));
        // direct dropping re-opens the gate
        assert!(fallback_ready(true, t0, delay, false, t0 + ms(5_000)));
    }

    #[test]
    fn direct_up_during_delay_keeps_gate_closed_either_way() {
        let t0 = Instant::now();
        assert!(!fallback_ready(true, t0, ms(1_500), true, t0 + ms(1_000)));
    }

    #[test]
    fn relay_only_mode_attempts_immediately() {
        let t0 = Instant::now();
        assert!(fallback_ready(false, t0, ms(1_500), false, t0));
        assert!(fallback_ready(false, t0, ms(1_500), true, t0 + ms(10_000)));
    }

    // -- tracker lifecycle --------------------------------------------------

    #[tokio::test]
    async fn tracker_starts_offline_and_shuts_down_cleanly() {
        let cfg = WatchConfig {
            relay_ws_url: "ws://127.0.0.1:1/ws".to_string(), // nothing there
            relay_retry: Duration::from_millis(50),
            ..Default::default()
        };
        let tracker = Tracker::start(cfg);
        assert!(!tracker.online());
        assert!(tracker.latest().is_none());
        assert_eq!(tracker.source(), None);

        sleep(Duration::from_millis(120)).await;
        tracker.shutdown();
    }
}
