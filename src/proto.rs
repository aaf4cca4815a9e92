//! Protobuf types for the upstream Meshtastic wire schema.
//!
//! Defined by hand rather than generated from a vendored `.proto` file —
//! matches the teacher's "manual types for faster iteration" convention (see
//! build.rs). Field tags follow the upstream `meshtastic/protobufs` schema
//! (`mesh.proto`, `telemetry.proto`, `mqtt.proto`, `portnums.proto`).

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum PortNum {
    UnknownApp = 0,
    TextMessageApp = 1,
    RemoteHardwareApp = 2,
    PositionApp = 3,
    NodeinfoApp = 4,
    RoutingApp = 5,
    AdminApp = 6,
    TextMessageCompressedApp = 7,
    WaypointApp = 8,
    AudioApp = 9,
    DetectionSensorApp = 10,
    ReplyApp = 32,
    IpTunnelApp = 33,
    PaxcounterApp = 34,
    SerialApp = 64,
    StoreForwardApp = 65,
    RangeTestApp = 66,
    TelemetryApp = 67,
    ZpsApp = 68,
    SimulatorApp = 69,
    TracerouteApp = 70,
    NeighborinfoApp = 71,
    AtakPluginApp = 72,
    MapReportApp = 73,
    PowerstressApp = 74,
    PrivateApp = 256,
    AtakForwarderApp = 257,
}

#[derive(Clone, prost::Message)]
pub struct ServiceEnvelope {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<MeshPacket>,
    #[prost(string, tag = "2")]
    pub channel_id: String,
    #[prost(string, tag = "3")]
    pub gateway_id: String,
}

#[derive(Clone, prost::Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(message, optional, tag = "4")]
    pub decoded: Option<Data>,
    #[prost(bytes, tag = "5")]
    pub encrypted: Vec<u8>,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
    #[prost(bool, tag = "14")]
    pub via_mqtt: bool,
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
}

impl MeshPacket {
    pub fn is_encrypted(&self) -> bool {
        self.decoded.is_none() && !self.encrypted.is_empty()
    }

    /// `hop_start == hop_limit` and both present — the Meshtastic-spec
    /// definition of a direct (unrelayed) reception.
    pub fn is_direct_hop(&self) -> bool {
        self.hop_start == self.hop_limit
    }
}

#[derive(Clone, prost::Message)]
pub struct Data {
    #[prost(enumeration = "PortNum", tag = "1")]
    pub portnum: i32,
    #[prost(bytes, tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
}

#[derive(Clone, prost::Message)]
pub struct Position {
    #[prost(sfixed32, tag = "1")]
    pub latitude_i: i32,
    #[prost(sfixed32, tag = "2")]
    pub longitude_i: i32,
    #[prost(int32, tag = "3")]
    pub altitude: i32,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
    #[prost(fixed32, tag = "7")]
    pub timestamp: u32,
    #[prost(uint32, tag = "14")]
    pub gps_accuracy: u32,
    #[prost(uint32, tag = "19")]
    pub sats_in_view: u32,
}

#[derive(Clone, prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    #[prost(uint32, tag = "5")]
    pub hw_model: u32,
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
    #[prost(uint32, tag = "7")]
    pub role: u32,
}

#[derive(Clone, prost::Message)]
pub struct DeviceMetrics {
    #[prost(uint32, optional, tag = "1")]
    pub battery_level: Option<u32>,
    #[prost(float, optional, tag = "2")]
    pub voltage: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub channel_utilization: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub air_util_tx: Option<f32>,
    #[prost(uint32, optional, tag = "5")]
    pub uptime_seconds: Option<u32>,
}

#[derive(Clone, prost::Message)]
pub struct PowerMetrics {
    #[prost(float, optional, tag = "1")]
    pub ch1_voltage: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub ch1_current: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub ch2_voltage: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub ch2_current: Option<f32>,
    #[prost(float, optional, tag = "5")]
    pub ch3_voltage: Option<f32>,
    #[prost(float, optional, tag = "6")]
    pub ch3_current: Option<f32>,
}

#[derive(Clone, prost::Message)]
pub struct Telemetry {
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    #[prost(message, optional, tag = "2")]
    pub device_metrics: Option<DeviceMetrics>,
    #[prost(message, optional, tag = "5")]
    pub power_metrics: Option<PowerMetrics>,
}

#[derive(Clone, prost::Message)]
pub struct MapReport {
    #[prost(string, tag = "1")]
    pub long_name: String,
    #[prost(string, tag = "2")]
    pub short_name: String,
    #[prost(uint32, tag = "3")]
    pub role: u32,
    #[prost(uint32, tag = "4")]
    pub hw_model: u32,
    #[prost(string, tag = "5")]
    pub firmware_version: String,
    #[prost(uint32, tag = "6")]
    pub region: u32,
    #[prost(uint32, tag = "7")]
    pub modem_preset: u32,
    #[prost(sfixed32, tag = "9")]
    pub latitude_i: i32,
    #[prost(sfixed32, tag = "10")]
    pub longitude_i: i32,
    #[prost(int32, tag = "11")]
    pub altitude: i32,
}

#[derive(Clone, prost::Message)]
pub struct Neighbor {
    #[prost(fixed32, tag = "1")]
    pub node_id: u32,
    #[prost(float, tag = "2")]
    pub snr: f32,
}

#[derive(Clone, prost::Message)]
pub struct NeighborInfo {
    #[prost(fixed32, tag = "1")]
    pub node_id: u32,
    #[prost(fixed32, tag = "2")]
    pub last_sent_by_id: u32,
    #[prost(uint32, tag = "3")]
    pub node_broadcast_interval_secs: u32,
    #[prost(message, repeated, tag = "4")]
    pub neighbors: Vec<Neighbor>,
}

/// Admin messages carry a large, frequently-extended oneof of remote-control
/// payloads this system never acts on (§4.4: "accepted and archived but no
/// state change beyond liveness"). Unknown field numbers are skipped by
/// `prost` on decode, so this minimal shape still decodes any real-world
/// Admin message without error; we only need enough to log/archive it.
#[derive(Clone, prost::Message)]
pub struct Admin {
    #[prost(string, tag = "11")]
    pub session_passkey: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn mesh_packet_direct_hop() {
        let mp = MeshPacket { hop_start: 3, hop_limit: 3, ..Default::default() };
        assert!(mp.is_direct_hop());
    }

    #[test]
    fn mesh_packet_relayed() {
        let mp = MeshPacket { hop_start: 3, hop_limit: 2, ..Default::default() };
        assert!(!mp.is_direct_hop());
    }

    #[test]
    fn position_roundtrip() {
        let p = Position { latitude_i: 375_637_125, longitude_i: -1_222_189_855, altitude: 0, ..Default::default() };
        let mut buf = Vec::new();
        p.encode(&mut buf).unwrap();
        let decoded = Position::decode(buf.as_slice()).unwrap();
        assert_eq!(decoded.latitude_i, 375_637_125);
        assert_eq!(decoded.longitude_i, -1_222_189_855);
    }

    #[test]
    fn unknown_fields_are_skipped_not_rejected() {
        // An Admin message with fields our minimal struct doesn't model must
        // still decode cleanly — prost skips unrecognized field numbers.
        let data = Data { portnum: PortNum::AdminApp as i32, payload: vec![0x08, 0x01, 0x12, 0x02, b'h', b'i'], ..Default::default() };
        let mut buf = Vec::new();
        data.encode(&mut buf).unwrap();
        let decoded = Data::decode(buf.as_slice()).unwrap();
        assert_eq!(decoded.portnum, PortNum::AdminApp as i32);
    }
}
