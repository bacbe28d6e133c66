mod bridge;
mod command;
mod config;
mod db;
mod envelope;
mod hub;
mod telemetry;
mod web;

use anyhow::Result;
use serde_json::{json, Value};
use std::{env, sync::Arc};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bridge::{Bridge, BridgeConfig, InboundMessage};
use command::CommandTopics;
use db::Db;
use envelope::{looks_like_telemetry, normalize, now_ms, Envelope};
use hub::{ActuatorState, Hub, SharedHub};
use telemetry::TelemetrySample;
use web::AppState;

// ---------------------------------------------------------------------------
// Ingest path: broker message -> envelope -> {broadcast, persistence}
// ---------------------------------------------------------------------------

/// Handle one inbound broker message. Never fails: a malformed payload
/// still becomes a (text) envelope and is still broadcast.
async fn handle_inbound(hub: &SharedHub, db: &Db, msg: InboundMessage) {
    let now = now_ms();
    let env = normalize(&msg.topic, &msg.payload, now);
    hub.broadcast(&env).await;

    let Some(data) = env.data.as_json() else {
        return;
    };
    if !looks_like_telemetry(data) {
        return;
    }

    // Persistence is fire-and-forget; the sink never stalls this path.
    if let Some(sample) = TelemetrySample::from_payload(data, now) {
        db::spawn_save(db, sample);
    }

    if hub.record_telemetry(data, now).await {
        hub.broadcast(&Envelope::synthetic(
            "device_status",
            json!({ "online": true }),
            now,
        ))
        .await;
    }

    // Device-reported actuator state supersedes any optimistic echo.
    if let Some(led) = data.get("led") {
        let value = match led {
            Value::Bool(b) => i64::from(*b),
            Value::Number(n) => i64::from(n.as_f64().unwrap_or(0.0) != 0.0),
            _ => 0,
        };
        let state = ActuatorState { value, ts: now };
        hub.record_actuator("led_state", state.clone()).await;
        hub.broadcast(&Envelope::synthetic(
            "led_state",
            json!({ "value": state.value, "ts": state.ts }),
            now,
        ))
        .await;
    }
}

/// Flip the derived device status to offline once telemetry goes stale.
fn start_staleness_sweep(hub: SharedHub) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let now = now_ms();
            if hub.mark_stale(now).await {
                info!("device went stale, broadcasting offline");
                hub.broadcast(&Envelope::synthetic(
                    "device_status",
                    json!({ "online": false }),
                    now,
                ))
                .await;
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Config file + env overrides ─────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = config::load(&config_path)?;
    if let Ok(host) = env::var("MQTT_HOST") {
        cfg.mqtt.host = host;
    }
    if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
        cfg.mqtt.port = port;
    }
    if let Ok(user) = env::var("MQTT_USER") {
        cfg.mqtt.username = Some(user);
    }
    if let Ok(pass) = env::var("MQTT_PASS") {
        cfg.mqtt.password = Some(pass);
    }
    if let Some(port) = env::var("WEB_PORT").ok().and_then(|s| s.parse().ok()) {
        cfg.web.port = port;
    }
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:ag360.db?mode=rwc".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Hub + broker bridge ─────────────────────────────────────────
    let hub = Hub::new(cfg.staleness_ms());

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<InboundMessage>();
    let bridge = Bridge::start(
        BridgeConfig {
            host: cfg.mqtt.host.clone(),
            port: cfg.mqtt.port,
            username: cfg.mqtt.username.clone(),
            password: cfg.mqtt.password.clone(),
            client_id: cfg.mqtt.client_id.clone(),
            topics: cfg.mqtt.topics.clone(),
            status_topic: if cfg.mqtt.status_topic.is_empty() {
                None
            } else {
                Some(cfg.mqtt.status_topic.clone())
            },
            keep_alive: cfg.keep_alive(),
            reconnect_backoff: cfg.reconnect_backoff(),
        },
        move |msg| {
            let _ = inbound_tx.send(msg);
        },
    );

    let ingest_hub = Arc::clone(&hub);
    let ingest_db = db.clone();
    tokio::spawn(async move {
        while let Some(msg) = inbound_rx.recv().await {
            handle_inbound(&ingest_hub, &ingest_db, msg).await;
        }
    });

    // ── Web server + background sweeps ──────────────────────────────
    let state = AppState {
        hub: Arc::clone(&hub),
        mqtt: bridge.client(),
        topics: Arc::new(CommandTopics {
            led: cfg.commands.led_topic.clone(),
            relay1: cfg.commands.relay1_topic.clone(),
            relay2: cfg.commands.relay2_topic.clone(),
        }),
    };
    let web_port = cfg.web.port;
    tokio::spawn(web::serve(state, web_port));

    let _retention = db::start_retention_sweep(db.clone(), cfg.retention_window(), cfg.sweep_interval());
    let _staleness = start_staleness_sweep(Arc::clone(&hub));

    info!(
        broker = %cfg.mqtt.host,
        topics = ?cfg.mqtt.topics,
        "relay running, ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    bridge.stop().await;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db(name: &str) -> Db {
        let url = format!("sqlite:file:{name}?mode=memory&cache=shared");
        let db = Db::connect(&url).await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn inbound(topic: &str, payload: &[u8]) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn telemetry_message_broadcasts_and_persists() {
        let hub = Hub::new(12_000);
        let db = test_db("main_scenario").await;
        let (_id, mut rx) = hub.register(0).await;
        drain(&mut rx);

        handle_inbound(
            &hub,
            &db,
            inbound(
                "esp32/telemetry",
                br#"{"deviceId":"esp32-01","temperature":24.3,"humidity":55,"soilPct":40,"relay1":1}"#,
            ),
        )
        .await;

        let msgs = drain(&mut rx);
        let tele: Vec<_> = msgs.iter().filter(|m| m["topic"] == "esp32/telemetry").collect();
        assert_eq!(tele.len(), 1);
        assert_eq!(tele[0]["data"]["temperature"], 24.3);
        assert_eq!(tele[0]["data"]["soilPct"], 40);
        // first telemetry also flips device_status online
        assert!(msgs.iter().any(|m| m["topic"] == "device_status"
            && m["data"]["online"] == true));

        // fire-and-forget write: wait for the detached task
        tokio::task::yield_now().await;
        for _ in 0..50 {
            if db.sample_count().await.unwrap() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let s = db.latest_sample_for("esp32-01").await.unwrap().unwrap();
        assert_eq!(s.temperature, Some(24.3));
        assert_eq!(s.humidity, Some(55.0));
        assert_eq!(s.soil_pct, Some(40.0));
        assert_eq!(s.relay1, 1);
        assert_eq!(s.relay2, 0);
    }

    #[tokio::test]
    async fn malformed_payload_still_broadcast_not_persisted() {
        let hub = Hub::new(12_000);
        let db = test_db("main_malformed").await;
        let (_id, mut rx) = hub.register(0).await;
        drain(&mut rx);

        handle_inbound(&hub, &db, inbound("esp32/telemetry", b"##garbage##")).await;

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["data"], "##garbage##");

        tokio::task::yield_now().await;
        assert_eq!(db.sample_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn non_telemetry_json_broadcasts_without_persisting() {
        let hub = Hub::new(12_000);
        let db = test_db("main_nontele").await;
        let (_id, mut rx) = hub.register(0).await;
        drain(&mut rx);

        handle_inbound(&hub, &db, inbound("ag360/status", br#""online""#)).await;

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["topic"], "ag360/status");
        tokio::task::yield_now().await;
        assert_eq!(db.sample_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn device_reported_led_updates_actuator_cache() {
        let hub = Hub::new(12_000);
        let db = test_db("main_led").await;

        handle_inbound(
            &hub,
            &db,
            inbound("esp32/telemetry", br#"{"deviceId":"a","led":1}"#),
        )
        .await;

        let led = hub.actuator("led_state").await.unwrap();
        assert_eq!(led.value, 1);
    }

    #[tokio::test]
    async fn device_status_broadcast_only_on_transition() {
        let hub = Hub::new(12_000);
        let db = test_db("main_status").await;
        let (_id, mut rx) = hub.register(0).await;
        drain(&mut rx);

        handle_inbound(&hub, &db, inbound("esp32/telemetry", br#"{"temperature":1}"#)).await;
        handle_inbound(&hub, &db, inbound("esp32/telemetry", br#"{"temperature":2}"#)).await;

        let statuses = drain(&mut rx)
            .into_iter()
            .filter(|m| m["topic"] == "device_status")
            .count();
        assert_eq!(statuses, 1);
    }
}
