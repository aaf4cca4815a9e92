//! Packet processor (C4): per-portnum handling, dedup, gateway inference,
//! movement/battery alert triggers, history append/prune.
//!
//! Grounded in `original_source/src/mqtt_handler.py`'s `on_position`,
//! `on_telemetry`, `on_nodeinfo`, `on_mapreport`, `on_neighborinfo`,
//! `_track_special_node_packet`, and `_extract_gateway_from_packet`. The
//! per-packet try/catch-everything shape that file uses around each handler
//! is replaced with `Option`/`Result` short-circuits (§7 "never re-throws"):
//! a malformed field skips that field's update, never the rest of the
//! packet, and a malformed packet never kills the worker loop.

use std::sync::Arc;

use prost::Message;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::alerts::{AlertDispatcher, BatteryAlertReading};
use crate::config::Config;
use crate::crypto;
use crate::geo::haversine_m;
use crate::metrics::Metrics;
use crate::model::{
    battery_from_voltage, modem_preset_name, now_unix, GatewayConfidence, GatewayEdge,
    HistoryPoint, NodeId, PacketArchiveEntry,
};
use crate::proto::{Data, MapReport, Position, PortNum, ServiceEnvelope, Telemetry, User};
use crate::store::StateStore;
use crate::topic;

/// Common per-packet facts pulled out of the envelope/topic before any
/// port-specific handler runs (§4.4 steps 1-3).
struct PacketContext {
    topic: String,
    channel_name: Option<String>,
    sender: NodeId,
    channel: u32,
    packet_id: Option<u32>,
    hop_start: Option<u32>,
    hop_limit: Option<u32>,
    rx_rssi: Option<i32>,
    rx_snr: Option<f32>,
    rx_time: Option<u32>,
    is_special: bool,
}

pub struct Processor {
    store: Arc<StateStore>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    alerts: Arc<AlertDispatcher>,
}

impl Processor {
    pub fn new(
        store: Arc<StateStore>,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
        alerts: Arc<AlertDispatcher>,
    ) -> Self {
        Self { store, config, metrics, alerts }
    }

    /// Entry point: raw `(topic, payload)` as handed off by the MQTT worker
    /// task. Infallible from the caller's point of view.
    pub fn process_raw(&self, mqtt_topic: &str, payload: &[u8]) {
        let envelope = match ServiceEnvelope::decode(payload) {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "dropping packet: bad ServiceEnvelope");
                self.metrics.decode_errors();
                return;
            }
        };
        let Some(mut mp) = envelope.packet else {
            debug!("dropping packet: ServiceEnvelope carries no MeshPacket");
            return;
        };

        if mp.is_encrypted() {
            let plaintext = crypto::decrypt(&self.config.mqtt.channel_key, mp.id, mp.from, &mp.encrypted);
            match Data::decode(plaintext.as_slice()) {
                Ok(data) => mp.decoded = Some(data),
                Err(e) => {
                    debug!(error = %e, "dropping packet: decryption did not yield a valid Data message");
                    self.metrics.crypto_errors();
                    return;
                }
            }
        }

        let Some(data) = mp.decoded.clone() else {
            debug!("dropping packet: no decoded payload and not encrypted");
            return;
        };

        let ctx = PacketContext {
            topic: mqtt_topic.to_string(),
            channel_name: topic::channel_name(mqtt_topic)
                .map(str::to_string)
                .or_else(|| (!envelope.channel_id.is_empty()).then(|| envelope.channel_id.clone())),
            sender: mp.from,
            channel: mp.channel,
            packet_id: (mp.id != 0).then_some(mp.id),
            hop_start: (mp.hop_start != 0).then_some(mp.hop_start),
            hop_limit: Some(mp.hop_limit).filter(|_| mp.hop_start != 0 || mp.hop_limit != 0),
            rx_rssi: (mp.rx_rssi != 0).then_some(mp.rx_rssi),
            rx_snr: (mp.rx_snr != 0.0).then_some(mp.rx_snr),
            rx_time: (mp.rx_time != 0).then_some(mp.rx_time),
            is_special: self.config.special_nodes.contains_key(&mp.from),
        };

        let now = now_unix();

        if ctx.is_special {
            self.store.record_last_packet_seen(ctx.sender, now);
        }

        let portnum = PortNum::try_from(data.portnum).unwrap_or(PortNum::UnknownApp);
        let portnum_name = format!("{portnum:?}");

        // Archive first (§4.4 step 3: "archival must not be skipped by
        // downstream failure") — build the generic envelope plus whatever
        // type-specific extras we can parse, independent of whether the
        // type-specific handler below succeeds.
        let extra = self.build_extra_fields(portnum, &data.payload);
        let is_best_copy = self.archive_packet(&ctx, &portnum_name, &extra, now);

        if ctx.is_special && is_best_copy {
            self.infer_gateway_edge(&ctx, now);
        }

        match portnum {
            PortNum::PositionApp => self.handle_position(&ctx, &data.payload, now),
            PortNum::NodeinfoApp => self.handle_nodeinfo(&ctx, &data.payload, now),
            PortNum::TelemetryApp => self.handle_telemetry(&ctx, &data.payload, now),
            PortNum::MapReportApp => self.handle_mapreport(&ctx, &data.payload, now),
            PortNum::NeighborinfoApp | PortNum::AdminApp => {
                // accepted and archived above; no further state change (§4.4)
            }
            _ => {
                debug!(portnum = ?portnum, "ignoring unhandled portnum");
            }
        }
    }

    fn build_extra_fields(&self, portnum: PortNum, payload: &[u8]) -> Map<String, Value> {
        let mut extra = Map::new();
        match portnum {
            PortNum::PositionApp => {
                if let Ok(p) = Position::decode(payload) {
                    if p.latitude_i != 0 || p.longitude_i != 0 {
                        extra.insert("lat".into(), json!(p.latitude_i as f64 / 1e7));
                        extra.insert("lon".into(), json!(p.longitude_i as f64 / 1e7));
                        extra.insert("altitude".into(), json!(p.altitude));
                    }
                }
            }
            PortNum::NodeinfoApp => {
                if let Ok(u) = User::decode(payload) {
                    extra.insert("role".into(), json!(u.role));
                    extra.insert("hw_model".into(), json!(u.hw_model));
                    extra.insert("long_name".into(), json!(u.long_name));
                    extra.insert("short_name".into(), json!(u.short_name));
                }
            }
            PortNum::TelemetryApp => {
                if let Ok(t) = Telemetry::decode(payload) {
                    if let Some(dm) = t.device_metrics {
                        extra.insert("battery_level".into(), json!(dm.battery_level));
                        extra.insert("voltage".into(), json!(dm.voltage));
                        extra.insert("channel_utilization".into(), json!(dm.channel_utilization));
                        extra.insert("air_util_tx".into(), json!(dm.air_util_tx));
                    }
                    if let Some(pm) = t.power_metrics {
                        extra.insert("power_voltage".into(), json!(pm.ch3_voltage.or(pm.ch1_voltage)));
                        extra.insert("power_current".into(), json!(pm.ch3_current));
                    }
                }
            }
            PortNum::MapReportApp => {
                if let Ok(m) = MapReport::decode(payload) {
                    extra.insert("modem_preset".into(), json!(modem_preset_name(m.modem_preset)));
                    extra.insert("region".into(), json!(m.region));
                    extra.insert("firmware_version".into(), json!(m.firmware_version));
                }
            }
            _ => {}
        }
        extra
    }

    /// Archive a packet for a special node with packet-id dedup (§4.4/§8
    /// property 3). Returns whether this copy is now the stored (possibly
    /// replacing) one — only a `true` result should feed gateway inference.
    /// Non-special senders are never archived (§3 PacketArchiveEntry is
    /// per-special-node).
    fn archive_packet(
        &self,
        ctx: &PacketContext,
        portnum_name: &str,
        extra: &Map<String, Value>,
        now: f64,
    ) -> bool {
        if !ctx.is_special {
            return false;
        }
        let is_direct = matches!((ctx.hop_start, ctx.hop_limit), (Some(s), Some(l)) if s == l);
        let score = crate::store::signal_quality_score(is_direct, ctx.rx_snr, ctx.rx_rssi);
        let entry = PacketArchiveEntry {
            timestamp: now,
            packet_type: portnum_name.to_string(),
            id: ctx.packet_id,
            channel: Some(ctx.channel),
            channel_name: ctx.channel_name.clone(),
            portnum_name: Some(portnum_name.to_string()),
            hop_start: ctx.hop_start,
            hop_limit: ctx.hop_limit,
            rx_rssi: ctx.rx_rssi,
            rx_snr: ctx.rx_snr,
            mqtt_topic: Some(ctx.topic.clone()),
            extra: extra.clone(),
        };
        let is_best_copy = self.store.record_packet(ctx.sender, entry, ctx.packet_id, score);
        if !is_best_copy {
            self.metrics.dedup_drops();
        }
        is_best_copy
    }

    /// §4.4 step 5: only special-node senders produce gateway edges, and
    /// only the best-signal copy of each packet id is allowed to.
    fn infer_gateway_edge(&self, ctx: &PacketContext, now: f64) {
        let is_direct = matches!((ctx.hop_start, ctx.hop_limit), (Some(s), Some(l)) if s == l);
        if !is_direct {
            return;
        }
        let Some(gateway_id) = topic::gateway_node_id(&ctx.topic) else {
            return;
        };
        let gateway_name = self.store.get_node(gateway_id).and_then(|r| r.long_name);
        let gateway_position = self.store.get_node(gateway_id).and_then(|r| r.lat.zip(r.lon));
        let edge = GatewayEdge {
            name: gateway_name,
            lat: gateway_position.map(|(lat, _)| lat),
            lon: gateway_position.map(|(_, lon)| lon),
            rssi: ctx.rx_rssi,
            snr: ctx.rx_snr,
            last_seen: now,
            confidence: GatewayConfidence::Direct,
            hop_start: ctx.hop_start,
            hop_limit: ctx.hop_limit,
        };
        self.store.record_gateway(ctx.sender, gateway_id, edge, now);
        self.metrics.gateway_edges_recorded();
    }

    fn handle_position(&self, ctx: &PacketContext, payload: &[u8], now: f64) {
        let Ok(pos) = Position::decode(payload) else {
            self.metrics.decode_errors();
            return;
        };
        if pos.latitude_i == 0 && pos.longitude_i == 0 {
            // open question 3 (§9): a real fix never reports null island.
            return;
        }
        let lat = pos.latitude_i as f64 / 1e7;
        let lon = pos.longitude_i as f64 / 1e7;
        let alt = pos.altitude;

        let sender = ctx.sender;
        let special_cfg = self.config.special_nodes.get(&sender).cloned();

        self.store.upsert_node(sender, now, |r| {
            r.channel = Some(ctx.channel);
            if let Some(name) = &ctx.channel_name {
                r.channel_name = Some(name.clone());
            }
            r.lat = Some(lat);
            r.lon = Some(lon);
            r.alt = Some(alt);
            r.last_position_update = Some(now);
            if let Some(rssi) = ctx.rx_rssi {
                r.rx_rssi = Some(rssi);
            }
            if let Some(snr) = ctx.rx_snr {
                r.rx_snr = Some(snr);
            }
            if ctx.is_special {
                r.is_special = true;
                if let Some(sp) = &special_cfg {
                    if let (Some(hlat), Some(hlon)) = (sp.home_lat, sp.home_lon) {
                        r.origin_lat = Some(hlat);
                        r.origin_lon = Some(hlon);
                    } else if r.origin_lat.is_none() {
                        r.origin_lat = Some(lat);
                        r.origin_lon = Some(lon);
                    }
                    r.has_power_sensor = sp.has_power_sensor;
                } else if r.origin_lat.is_none() {
                    r.origin_lat = Some(lat);
                    r.origin_lon = Some(lon);
                }
            }
        });

        let Some(rec) = self.store.get_node(sender) else { return };

        if rec.is_gateway {
            self.store.propagate_gateway_position(sender, lat, lon, now);
        }

        if ctx.is_special {
            if let (Some(olat), Some(olon)) = (rec.origin_lat, rec.origin_lon) {
                if let Some(dist) = haversine_m(olat, olon, lat, lon) {
                    let moved_far = dist >= self.config.movement_threshold_meters;
                    self.store.upsert_node(sender, now, |r| {
                        r.distance_from_origin_m = Some(dist);
                        r.moved_far = moved_far;
                    });
                    if moved_far {
                        self.alerts.try_send_movement_alert(sender, &rec, dist, now);
                    }
                }
            }

            if self.store.try_mark_position_seen(sender, ctx.rx_time) {
                self.store.append_history(
                    sender,
                    HistoryPoint {
                        ts: now,
                        lat,
                        lon,
                        alt: Some(alt),
                        battery: rec.battery,
                        rssi: ctx.rx_rssi,
                        snr: ctx.rx_snr,
                    },
                    now,
                );
            }
        }
    }

    fn handle_nodeinfo(&self, ctx: &PacketContext, payload: &[u8], now: f64) {
        let Ok(user) = User::decode(payload) else {
            self.metrics.decode_errors();
            return;
        };
        let sender = ctx.sender;

        self.store.upsert_node(sender, now, |r| {
            r.channel = Some(ctx.channel);
            if let Some(name) = &ctx.channel_name {
                r.channel_name = Some(name.clone());
            }
            if !user.long_name.is_empty() {
                r.long_name = Some(user.long_name.clone());
            }
            if !user.short_name.is_empty() {
                r.short_name = Some(user.short_name.clone());
            }
            if user.hw_model != 0 {
                r.hw_model = Some(user.hw_model);
            }
            if user.role != 0 {
                r.role = Some(user.role);
            }
            if let Some(rssi) = ctx.rx_rssi {
                r.rx_rssi = Some(rssi);
            }
            if let Some(snr) = ctx.rx_snr {
                r.rx_snr = Some(snr);
            }
            if ctx.is_special {
                r.is_special = true;
            }
        });

        if let Some(rec) = self.store.get_node(sender) {
            if rec.is_gateway {
                if let Some(name) = &rec.long_name {
                    self.store.propagate_gateway_name(sender, name);
                }
            }
        }
    }

    fn handle_telemetry(&self, ctx: &PacketContext, payload: &[u8], now: f64) {
        let Ok(telemetry) = Telemetry::decode(payload) else {
            self.metrics.decode_errors();
            return;
        };
        let sender = ctx.sender;
        let has_power_sensor = self
            .config
            .special_nodes
            .get(&sender)
            .map(|s| s.has_power_sensor)
            .unwrap_or(false);

        let device_metrics = telemetry.device_metrics.clone();
        let power_metrics = telemetry.power_metrics.clone();

        self.store.upsert_node(sender, now, |r| {
            if let Some(name) = &ctx.channel_name {
                r.channel_name = Some(name.clone());
            }
            if let Some(dm) = &device_metrics {
                r.telemetry.merge_device_metrics(
                    dm.battery_level,
                    dm.voltage,
                    dm.channel_utilization,
                    dm.air_util_tx,
                    dm.uptime_seconds,
                );
            }
            if let Some(pm) = &power_metrics {
                r.telemetry.merge_power_metrics(pm.ch1_voltage, pm.ch1_current, pm.ch3_voltage, pm.ch3_current);
            }

            if has_power_sensor {
                if let Some(v) = r.telemetry.ch3_voltage {
                    r.voltage = Some(v);
                    r.battery = Some(battery_from_voltage(v));
                }
                r.power_current = r.telemetry.ch3_current;
            } else {
                r.voltage = r.telemetry.voltage;
                r.battery = r
                    .telemetry
                    .battery_level
                    .map(|b| b.clamp(0, 100))
                    .or_else(|| r.telemetry.voltage.map(battery_from_voltage));
            }
            if let Some(rssi) = ctx.rx_rssi {
                r.rx_rssi = Some(rssi);
            }
            if let Some(snr) = ctx.rx_snr {
                r.rx_snr = Some(snr);
            }
            if ctx.is_special {
                r.is_special = true;
                r.has_power_sensor = has_power_sensor;
            }
        });

        let Some(rec) = self.store.get_node(sender) else { return };

        if ctx.is_special {
            if let (Some(lat), Some(lon)) = (rec.lat, rec.lon) {
                if !(lat == 0.0 && lon == 0.0) {
                    self.store.append_history(
                        sender,
                        HistoryPoint {
                            ts: now,
                            lat,
                            lon,
                            alt: rec.alt,
                            battery: rec.battery,
                            rssi: ctx.rx_rssi,
                            snr: ctx.rx_snr,
                        },
                        now,
                    );
                }
            }

            if has_power_sensor {
                if let Some(v) = rec.voltage {
                    if v < 3.5 {
                        self.alerts.try_send_battery_alert(sender, &rec, BatteryAlertReading::Voltage(v), now);
                    }
                }
            } else if let Some(pct) = rec.battery {
                if (pct as f64) < self.config.low_battery_threshold_percent {
                    self.alerts.try_send_battery_alert(sender, &rec, BatteryAlertReading::Percent(pct), now);
                }
            }
        }
    }

    fn handle_mapreport(&self, ctx: &PacketContext, payload: &[u8], now: f64) {
        let Ok(report) = MapReport::decode(payload) else {
            self.metrics.decode_errors();
            return;
        };
        let sender = ctx.sender;
        self.store.upsert_node(sender, now, |r| {
            if let Some(name) = modem_preset_name(report.modem_preset) {
                r.modem_preset = Some(name.to_string());
            }
            r.region = Some(report.region);
            if !report.firmware_version.is_empty() {
                r.firmware_version = Some(report.firmware_version.clone());
            }
            if !report.long_name.is_empty() {
                r.long_name = Some(report.long_name.clone());
            }
            if !report.short_name.is_empty() {
                r.short_name = Some(report.short_name.clone());
            }
            if report.hw_model != 0 {
                r.hw_model = Some(report.hw_model);
            }
            if ctx.is_special {
                r.is_special = true;
            }
        });
    }
}
