use anyhow::Result;
use std::env;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ag360_watch::transport::{Tracker, WatchConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Env config
    let cfg = WatchConfig {
        mqtt_ws_url: env::var("MQTT_WS_URL").ok(),
        mqtt_username: env::var("MQTT_USER").ok(),
        mqtt_password: env::var("MQTT_PASS").ok(),
        relay_ws_url: env::var("RELAY_WS_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string()),
        telemetry_topic: env::var("TELEMETRY_TOPIC")
            .unwrap_or_else(|_| "esp32/telemetry".to_string()),
        ..Default::default()
    };

    match &cfg.mqtt_ws_url {
        Some(url) => info!(direct = %url, fallback = %cfg.relay_ws_url, "watching feed"),
        None => info!(relay = %cfg.relay_ws_url, "watching feed (relay only)"),
    }

    let tracker = Tracker::start(cfg);
    let mut online_rx = tracker.online_rx();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = online_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = *online_rx.borrow_and_update();
                if online {
                    match tracker.latest() {
                        Some(data) => info!(source = ?tracker.source(), %data, "online"),
                        None => info!(source = ?tracker.source(), "online (no telemetry yet)"),
                    }
                } else {
                    warn!("offline: no live transport and last message went stale");
                }
            }
        }
    }

    info!("shutting down");
    tracker.shutdown();
    Ok(())
}
