//! Data model (§3): NodeRecord, HistoryPoint, PacketArchiveEntry, GatewayEdge,
//! GatewayReliability, and the merged telemetry snapshot.
//!
//! Grounded in `original_source/src/mqtt_handler.py::_build_node_info_from_data`
//! and the module-level dicts it reads from (`nodes_data`, `special_history`,
//! `special_node_packets`, `special_node_gateways`, `gateway_reliability_cache`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A 32-bit mesh node identifier.
pub type NodeId = u32;

/// Current wall-clock time as Unix seconds (floating point), matching the
/// teacher's `chrono::Utc::now()` idiom rather than reaching for `SystemTime`.
pub fn now_unix() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayConfidence {
    #[default]
    Partial,
    Direct,
}

impl GatewayConfidence {
    pub fn from_hops(hop_start: Option<u32>, hop_limit: Option<u32>) -> Self {
        match (hop_start, hop_limit) {
            (Some(s), Some(l)) if s == l => GatewayConfidence::Direct,
            _ => GatewayConfidence::Partial,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayConfidence::Direct => "direct",
            GatewayConfidence::Partial => "partial",
        }
    }
}

/// Per-device merged telemetry. Fields arrive piecemeal across packets and are
/// merged, never overwritten wholesale (§4.4 Telemetry handler).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "batteryLevel")]
    pub battery_level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "channelUtilization")]
    pub channel_utilization: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "airUtilTx")]
    pub air_util_tx: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "uptimeSeconds")]
    pub uptime_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "ch1Voltage")]
    pub ch1_voltage: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "ch1Current")]
    pub ch1_current: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "ch3Voltage")]
    pub ch3_voltage: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "ch3Current")]
    pub ch3_current: Option<f32>,
}

impl TelemetrySnapshot {
    /// Merge in a new `device_metrics` report; only overwrite fields the new
    /// report actually carries.
    pub fn merge_device_metrics(
        &mut self,
        battery_level: Option<u32>,
        voltage: Option<f32>,
        channel_utilization: Option<f32>,
        air_util_tx: Option<f32>,
        uptime_seconds: Option<u32>,
    ) {
        if battery_level.is_some() {
            self.battery_level = battery_level;
        }
        if voltage.is_some() {
            self.voltage = voltage;
        }
        if channel_utilization.is_some() {
            self.channel_utilization = channel_utilization;
        }
        if air_util_tx.is_some() {
            self.air_util_tx = air_util_tx;
        }
        if uptime_seconds.is_some() {
            self.uptime_seconds = uptime_seconds;
        }
    }

    pub fn merge_power_metrics(
        &mut self,
        ch1_voltage: Option<f32>,
        ch1_current: Option<f32>,
        ch3_voltage: Option<f32>,
        ch3_current: Option<f32>,
    ) {
        if ch1_voltage.is_some() {
            self.ch1_voltage = ch1_voltage;
        }
        if ch1_current.is_some() {
            self.ch1_current = ch1_current;
        }
        if ch3_voltage.is_some() {
            self.ch3_voltage = ch3_voltage;
        }
        if ch3_current.is_some() {
            self.ch3_current = ch3_current;
        }
    }
}

/// One observed node. Lazily created on first sighting (§3 Lifecycle).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeRecord {
    // identity
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "longName")]
    pub long_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "shortName")]
    pub short_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "hwModel")]
    pub hw_model: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "firmwareVersion")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<u32>,

    // position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "lastPositionUpdate")]
    pub last_position_update: Option<f64>,

    // radio
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "channelName")]
    pub channel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "modemPreset")]
    pub modem_preset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "rxRssi")]
    pub rx_rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "rxSnr")]
    pub rx_snr: Option<f32>,

    // power
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "powerCurrent")]
    pub power_current: Option<f32>,
    #[serde(default)]
    pub telemetry: TelemetrySnapshot,

    // origin / movement (special nodes only)
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "originLat")]
    pub origin_lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "originLon")]
    pub origin_lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "distanceFromOriginM")]
    pub distance_from_origin_m: Option<f64>,
    #[serde(default, alias = "movedFar")]
    pub moved_far: bool,

    // liveness
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "lastSeen")]
    pub last_seen: Option<f64>,

    // role flags
    #[serde(default, alias = "isSpecial")]
    pub is_special: bool,
    #[serde(default, alias = "isGateway")]
    pub is_gateway: bool,
    #[serde(default, alias = "hasPowerSensor")]
    pub has_power_sensor: bool,

    // gateway topology, mirrored onto the record for persistence roundtrips
    // (§4.6 "info.gateway_connections"); the live source of truth is
    // `StateStore::gateways`.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "bestGateway")]
    pub best_gateway: Option<GatewayEdge>,

    /// Populated only at persistence save-time from the store's live
    /// `gateways` map and consumed only at load-time to restore those edges
    /// (§4.6 "Gateway edges found in a saved info.gateway_connections
    /// entry are restored"); always empty on a record living in the store
    /// between saves, since the store's `gateways` map is the source of
    /// truth while the process is running.
    #[serde(default, skip_serializing_if = "HashMap::is_empty", alias = "gatewayConnections")]
    pub gateway_connections: HashMap<NodeId, GatewayEdge>,
}

/// One archived position/telemetry sample for a special node (§3 HistoryPoint).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub ts: f64,
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<f32>,
}

/// One archived packet for a special node (§3 PacketArchiveEntry).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PacketArchiveEntry {
    pub timestamp: f64,
    pub packet_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "channelName")]
    pub channel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "portnumName")]
    pub portnum_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "hopStart")]
    pub hop_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "hopLimit")]
    pub hop_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "rxRssi")]
    pub rx_rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "rxSnr")]
    pub rx_snr: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "mqttTopic")]
    pub mqtt_topic: Option<String>,
    /// Type-specific extra fields (lat/lon for Position, battery for
    /// Telemetry, names for NodeInfo, ...) kept as a JSON blob — mirrors the
    /// original source's dict-of-dicts packet record.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PacketArchiveEntry {
    pub fn is_direct_hop(&self) -> bool {
        matches!((self.hop_start, self.hop_limit), (Some(s), Some(l)) if s == l)
    }
}

/// Gateway → special-node edge (§3 GatewayEdge).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayEdge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<f32>,
    pub last_seen: f64,
    pub confidence: GatewayConfidence,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "hopStart")]
    pub hop_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "hopLimit")]
    pub hop_limit: Option<u32>,
}

/// Cached reliability score for a gateway, rebuilt on every edge update
/// (§3 GatewayReliability, formula in SPEC_FULL §10.1).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayReliability {
    pub score: u32,
    pub detection_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_rssi: Option<f64>,
    pub confidence_level: String,
    pub last_updated: f64,
}

/// Kind of alert, used as half the cooldown-map key (§3 AlertCooldownMap).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    Movement,
    Battery,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Movement => "movement",
            AlertKind::Battery => "battery",
        }
    }
}

/// Linear battery-from-voltage curve (§4.4, formula in SPEC_FULL §10.1):
/// 2.8V -> 0%, 4.25V -> 100%, clamped and truncated (not rounded) in between.
pub fn battery_from_voltage(voltage: f32) -> u32 {
    let voltage = voltage as f64;
    if voltage >= 4.25 {
        100
    } else if voltage <= 2.8 {
        0
    } else {
        (((voltage - 2.8) / 1.45) * 100.0).trunc().clamp(0.0, 100.0) as u32
    }
}

/// Canonical LoRa modem preset table (§4.4 MapReport handler).
pub fn modem_preset_name(preset: u32) -> Option<&'static str> {
    const NAMES: [&str; 9] = [
        "LongFast",
        "LongSlow",
        "VeryLongSlow",
        "MediumSlow",
        "MediumFast",
        "ShortSlow",
        "ShortFast",
        "LongModerate",
        "ShortTurbo",
    ];
    NAMES.get(preset as usize).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_camelcase_field_deserializes_snake_case_serializes() {
        // Open question 1 (§9): tolerate both spellings on read, always emit
        // snake_case on write.
        let json = r#"{"longName": "Buoy One", "isSpecial": true}"#;
        let rec: NodeRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.long_name.as_deref(), Some("Buoy One"));
        assert!(rec.is_special);

        let out = serde_json::to_string(&rec).unwrap();
        assert!(out.contains("\"long_name\""));
        assert!(!out.contains("\"longName\""));
    }

    #[test]
    fn gateway_confidence_from_hops() {
        assert_eq!(GatewayConfidence::from_hops(Some(3), Some(3)), GatewayConfidence::Direct);
        assert_eq!(GatewayConfidence::from_hops(Some(3), Some(2)), GatewayConfidence::Partial);
        assert_eq!(GatewayConfidence::from_hops(None, Some(2)), GatewayConfidence::Partial);
    }

    #[test]
    fn modem_preset_table_matches_spec() {
        assert_eq!(modem_preset_name(0), Some("LongFast"));
        assert_eq!(modem_preset_name(8), Some("ShortTurbo"));
        assert_eq!(modem_preset_name(9), None);
    }

    #[test]
    fn scenario_s4_battery_from_voltage() {
        assert_eq!(battery_from_voltage(3.7), 62);
        assert_eq!(battery_from_voltage(2.8), 0);
        assert_eq!(battery_from_voltage(4.25), 100);
        assert_eq!(battery_from_voltage(5.0), 100);
        assert_eq!(battery_from_voltage(1.0), 0);
    }

    #[test]
    fn telemetry_merge_preserves_unset_fields() {
        let mut t = TelemetrySnapshot::default();
        t.merge_device_metrics(Some(80), None, None, None, None);
        t.merge_power_metrics(None, None, Some(3.9), None);
        assert_eq!(t.battery_level, Some(80));
        assert_eq!(t.ch3_voltage, Some(3.9));
        t.merge_device_metrics(None, Some(3.7), None, None, None);
        assert_eq!(t.battery_level, Some(80));
        assert_eq!(t.voltage, Some(3.7));
    }
}
