use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Broker connection manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    /// Topics to (re)subscribe on every successful connect.
    pub topics: Vec<String>,
    /// Retained "online"/"offline" marker topic, if any.
    pub status_topic: Option<String>,
    pub keep_alive: Duration,
    /// Fixed delay before re-polling after a connection error, so a
    /// broker actively refusing connections is not hot-looped against.
    pub reconnect_backoff: Duration,
}

/// An inbound broker message, handed to the `start` callback.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Owns the single logical broker connection for this process.
///
/// The event loop task keeps the connection alive across transient
/// failures; every failure becomes a log line plus a backoff retry,
/// never a panic or an error surfaced to the caller.
pub struct Bridge {
    client: AsyncClient,
    status_topic: Option<String>,
    stopped: Arc<AtomicBool>,
}

impl Bridge {
    /// Connect and spawn the event loop. `on_message` is invoked with
    /// every inbound publish, from the event loop task.
    ///
    /// The returned handle owns the process's single logical broker
    /// connection; "start while already connected" is unrepresentable.
    /// Reconnecting an existing bridge is the event loop's job, never a
    /// second `start`.
    pub fn start<F>(cfg: BridgeConfig, on_message: F) -> Bridge
    where
        F: Fn(InboundMessage) + Send + 'static,
    {
        let mut options = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
        options.set_keep_alive(cfg.keep_alive);
        if let Some(user) = &cfg.username {
            options.set_credentials(user, cfg.password.clone().unwrap_or_default());
        }
        if let Some(topic) = &cfg.status_topic {
            // Broker-side fallback for ungraceful exits.
            options.set_last_will(LastWill::new(topic, "offline", QoS::AtLeastOnce, true));
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let stopped = Arc::new(AtomicBool::new(false));
        let status_topic = cfg.status_topic.clone();

        tokio::spawn(run_loop(
            eventloop,
            client.clone(),
            cfg,
            Arc::clone(&stopped),
            on_message,
        ));

        Bridge {
            client,
            status_topic,
            stopped,
        }
    }

    /// Clone of the publish handle, for the command channel.
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Publish a best-effort retained "offline" marker and terminate the
    /// connection. Idempotent: subsequent calls are no-ops, safe to race
    /// with an in-flight reconnect.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(topic) = &self.status_topic {
            if let Err(e) = self
                .client
                .publish(topic, QoS::AtLeastOnce, true, "offline")
                .await
            {
                warn!("offline status publish failed: {e}");
            }
        }
        if let Err(e) = self.client.disconnect().await {
            debug!("disconnect request failed: {e}");
        }
        info!("mqtt bridge stopped");
    }
}

async fn run_loop<F>(
    mut eventloop: EventLoop,
    client: AsyncClient,
    cfg: BridgeConfig,
    stopped: Arc<AtomicBool>,
    on_message: F,
) where
    F: Fn(InboundMessage) + Send + 'static,
{
    loop {
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(host = %cfg.host, port = cfg.port, "mqtt connected");
                // Subscription state does not survive a reconnect; redo it
                // on every ConnAck. A rejected subscribe leaves the bridge
                // running on whichever topics did go through.
                for topic in &cfg.topics {
                    if let Err(e) = client.subscribe(topic, QoS::AtMostOnce).await {
                        warn!(topic = %topic, "subscribe request failed: {e}");
                    }
                }
                if let Some(topic) = &cfg.status_topic {
                    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, true, "online").await {
                        warn!("online status publish failed: {e}");
                    }
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .filter(|c| {
                        matches!(c, rumqttc::mqttbytes::v4::SubscribeReasonCode::Failure)
                    })
                    .count();
                if rejected > 0 {
                    warn!(rejected, "broker rejected subscription(s)");
                } else {
                    debug!(pkid = ack.pkid, "subscription acknowledged");
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                on_message(InboundMessage {
                    topic: p.topic.clone(),
                    payload: p.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected by broker");
            }
            Ok(_) => {}
            Err(e) => {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                warn!(
                    "mqtt connection error: {e}; reconnecting in {:?}",
                    cfg.reconnect_backoff
                );
                sleep(cfg.reconnect_backoff).await;
            }
        }
    }
    debug!("mqtt event loop exited");
}

// ===========================================================================
// Tests
// ===========================================================================
