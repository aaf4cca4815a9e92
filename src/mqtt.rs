//! MQTT client (C5): broker connection lifecycle, reconnect, and delivery of
//! raw `(topic, payload)` pairs to a worker task that never blocks the
//! network loop.
//!
//! Grounded in `other_examples/.../ottendorfcipher-LORA-Comms.../mqtt/mod.rs`
//! for the `rumqttc::AsyncClient`/`EventLoop` connect/poll/resubscribe shape;
//! liveness classification follows `original_source/src/mqtt_handler.py`'s
//! `is_connected`/status helpers (SPEC_FULL §4.4/§10.1).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::model::now_unix;

/// Coarse connection/traffic state reported by C5 for status surfaces only —
/// never consulted for routing decisions (§4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Disconnected,
    Connecting,
    ConnectedToServer,
    ReceivingPackets,
    StaleData,
}

struct LivenessState {
    client_exists: AtomicBool,
    broker_confirmed: AtomicBool,
    packets_received: AtomicBool,
    last_packet_time_bits: AtomicU64,
}

impl LivenessState {
    fn new() -> Self {
        Self {
            client_exists: AtomicBool::new(false),
            broker_confirmed: AtomicBool::new(false),
            packets_received: AtomicBool::new(false),
            last_packet_time_bits: AtomicU64::new(0.0f64.to_bits()),
        }
    }

    fn record_packet(&self, now: f64) {
        self.packets_received.store(true, Ordering::Relaxed);
        self.last_packet_time_bits.store(now.to_bits(), Ordering::Relaxed);
    }

    fn classify(&self, now: f64, staleness_secs: f64) -> Liveness {
        if !self.client_exists.load(Ordering::Relaxed) {
            return Liveness::Disconnected;
        }
        if !self.broker_confirmed.load(Ordering::Relaxed) {
            return Liveness::Connecting;
        }
        if !self.packets_received.load(Ordering::Relaxed) {
            return Liveness::ConnectedToServer;
        }
        let last = f64::from_bits(self.last_packet_time_bits.load(Ordering::Relaxed));
        if now - last < staleness_secs {
            Liveness::ReceivingPackets
        } else {
            Liveness::StaleData
        }
    }
}

pub struct MqttClient {
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    liveness: Arc<LivenessState>,
}

impl MqttClient {
    pub fn new(config: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        Self { config, metrics, liveness: Arc::new(LivenessState::new()) }
    }

    pub fn liveness(&self, now: f64) -> Liveness {
        self.liveness.classify(now, self.config.liveness_staleness_secs())
    }

    fn subscription_topic(&self) -> String {
        format!("{}/{}/#", self.config.mqtt.root_topic, self.config.mqtt.channel_name)
    }

    /// Connect, subscribe, and poll until `shutdown` fires. Decoded-nothing
    /// here: raw `(topic, payload)` pairs are forwarded to `raw_tx` for the
    /// worker task to decrypt/decode/process (§5: network loop MUST NOT
    /// perform blocking work).
    pub async fn run(&self, raw_tx: mpsc::Sender<(String, Vec<u8>)>, mut shutdown: watch::Receiver<bool>) {
        let client_id = format!("buoy-tracker-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, self.config.mqtt.broker.clone(), self.config.mqtt.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(username) = &self.config.mqtt.username {
            options.set_credentials(username, self.config.mqtt.password.as_deref().unwrap_or(""));
        }

        let (client, mut eventloop) = AsyncClient::new(options, 256);
        self.liveness.client_exists.store(true, Ordering::Relaxed);
        let topic = self.subscription_topic();

        if let Err(e) = client.subscribe(&topic, QoS::AtMostOnce).await {
            warn!(error = %e, topic = %topic, "initial mqtt subscribe failed, will retry on reconnect");
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("mqtt client shutting down");
                        let _ = client.disconnect().await;
                        break;
                    }
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            self.liveness.broker_confirmed.store(true, Ordering::Relaxed);
                            info!(broker = %self.config.mqtt.broker, topic = %topic, "connected to mqtt broker");
                            if let Err(e) = client.subscribe(&topic, QoS::AtMostOnce).await {
                                warn!(error = %e, "resubscribe after (re)connect failed");
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let now = now_unix();
                            self.liveness.record_packet(now);
                            self.metrics.packets_received();
                            if raw_tx.try_send((publish.topic.clone(), publish.payload.to_vec())).is_err() {
                                warn!(topic = %publish.topic, "processor worker backlogged, dropping message");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            self.liveness.broker_confirmed.store(false, Ordering::Relaxed);
                            self.metrics.mqtt_reconnects();
                            warn!(error = %e, "mqtt event loop error, backing off before retry");
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_progresses_through_states() {
        let state = LivenessState::new();
        assert_eq!(state.classify(100.0, 300.0), Liveness::Disconnected);

        state.client_exists.store(true, Ordering::Relaxed);
        assert_eq!(state.classify(100.0, 300.0), Liveness::Connecting);

        state.broker_confirmed.store(true, Ordering::Relaxed);
        assert_eq!(state.classify(100.0, 300.0), Liveness::ConnectedToServer);

        state.record_packet(100.0);
        assert_eq!(state.classify(150.0, 300.0), Liveness::ReceivingPackets);
        assert_eq!(state.classify(500.0, 300.0), Liveness::StaleData);
    }
}
