//! Persistence (C6): coalesced atomic snapshot write and best-effort
//! cold-start restore of special-node state.
//!
//! No surviving reference implementation covers save/load in
//! `original_source/` — only the schema and policy text in the contract
//! (§4.6) ground this module. Built the way the rest of this crate treats
//! atomic file replacement and config reconciliation: temp-file + rename,
//! and a reconcile pass that prefers current config over stale snapshot
//! data, matching the `config.rs` precedence the special-nodes loader
//! already establishes.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Result;
use crate::geo::haversine_m;
use crate::metrics::Metrics;
use crate::model::{battery_from_voltage, now_unix, GatewayEdge, HistoryPoint, NodeId, NodeRecord, PacketArchiveEntry};
use crate::store::StateStore;

const COALESCE_SECS: f64 = 5.0;
const RETENTION_SECS: f64 = 7.0 * 24.0 * 3600.0;

#[derive(Default, Serialize, Deserialize)]
struct PersistedNode {
    #[serde(default)]
    info: NodeRecord,
    #[serde(default, alias = "positionHistory")]
    position_history: Vec<HistoryPoint>,
    #[serde(default)]
    packets: Vec<PacketArchiveEntry>,
}

/// `{ "<node_id>": { info, position_history, packets } }`, one entry per
/// special node (§4.6 schema). No schema version field; extra/missing keys
/// are tolerated on read.
type PersistedDocument = HashMap<String, PersistedNode>;

pub struct Persistence {
    store: Arc<StateStore>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    last_write_bits: AtomicU64,
}

impl Persistence {
    pub fn new(store: Arc<StateStore>, config: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        Self { store, config, metrics, last_write_bits: AtomicU64::new(0) }
    }

    fn path(&self) -> &Path {
        &self.config.persist_path
    }

    /// Honor a save request, subject to the 5 s coalescing window unless
    /// `force` is set (§4.6 write policy, and the shutdown sequence's final
    /// forced snapshot, §5).
    pub fn maybe_save(&self, now: f64, force: bool) {
        if !force {
            let last = f64::from_bits(self.last_write_bits.load(Ordering::Relaxed));
            if now - last < COALESCE_SECS {
                return;
            }
        }
        if let Err(e) = self.save(now) {
            warn!(error = %e, "failed to persist state, in-memory state remains authoritative");
            self.metrics.persist_errors();
            return;
        }
        self.last_write_bits.store(now.to_bits(), Ordering::Relaxed);
    }

    /// Prune both history and the packet archive to the 7-day retention
    /// window (the only place the packet archive is pruned, §4.6), snapshot
    /// the pruned state, and atomically replace the persistence file.
    fn save(&self, now: f64) -> Result<()> {
        let mut doc: PersistedDocument = HashMap::new();
        for id in self.store.special_node_ids_with_packets() {
            self.store.prune_packet_archive(id, now, RETENTION_SECS);
        }
        for id in self.config.special_nodes.keys().copied() {
            self.store.prune_history(id, now, RETENTION_SECS);
            let Some(mut info) = self.store.get_node(id) else { continue };
            info.gateway_connections = self
                .store
                .get_gateway_connections(Some(id))
                .into_iter()
                .map(|(_, gateway_id, edge)| (gateway_id, edge))
                .collect();
            let position_history = self.store.history_snapshot(id);
            let packets = self.store.packets_snapshot(id);
            doc.insert(id.to_string(), PersistedNode { info, position_history, packets });
        }

        let json = serde_json::to_vec_pretty(&doc)?;
        self.atomic_write(&json)?;
        self.metrics.persist_writes();
        debug!(nodes = doc.len(), path = %self.path().display(), "persisted special-node state");
        Ok(())
    }

    fn atomic_write(&self, bytes: &[u8]) -> Result<()> {
        let path = self.path();
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Best-effort cold-start restore (§4.6 "Read on startup"). Any error —
    /// missing file, unparseable JSON — produces a warning and an empty
    /// starting state, never a crash.
    pub fn load(&self) {
        let path = self.path();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no persisted state file, starting fresh");
                return;
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to read persisted state, starting fresh");
                return;
            }
        };
        let doc: PersistedDocument = match serde_json::from_slice(&bytes) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "persisted state is not valid json, starting fresh");
                return;
            }
        };

        let now = now_unix();
        let mut restored = 0usize;
        for (key, persisted) in doc {
            let Ok(id) = key.parse::<NodeId>() else {
                warn!(key, "skipping persisted entry with a non-numeric node id");
                continue;
            };
            self.restore_node(id, persisted, now);
            restored += 1;
        }
        debug!(restored, path = %path.display(), "restored special-node state from disk");
    }

    fn restore_node(&self, id: NodeId, persisted: PersistedNode, now: f64) {
        let PersistedNode { mut info, mut position_history, mut packets } = persisted;

        // reconcile against current config rather than trust the snapshot
        // (§4.6 "reconciled with current config")
        if let Some(special) = self.config.special_nodes.get(&id) {
            if let (Some(home_lat), Some(home_lon)) = (special.home_lat, special.home_lon) {
                info.origin_lat = Some(home_lat);
                info.origin_lon = Some(home_lon);
            }
            info.has_power_sensor = special.has_power_sensor;
        }
        info.is_special = true;

        if let (Some(lat), Some(lon), Some(olat), Some(olon)) = (info.lat, info.lon, info.origin_lat, info.origin_lon) {
            info.distance_from_origin_m = haversine_m(olat, olon, lat, lon);
            info.moved_far = info
                .distance_from_origin_m
                .map(|d| d >= self.config.movement_threshold_meters)
                .unwrap_or(false);
        }

        if info.last_position_update.is_none() {
            info.last_position_update = position_history.iter().map(|p| p.ts).fold(None, |acc, ts| {
                Some(acc.map_or(ts, |a: f64| a.max(ts)))
            });
        }

        if info.battery.is_none() {
            if let Some(v) = info.voltage {
                info.battery = Some(battery_from_voltage(v));
            }
        }

        let gateway_connections: HashMap<NodeId, GatewayEdge> = std::mem::take(&mut info.gateway_connections);
        position_history.retain(|p| now - p.ts < RETENTION_SECS);
        packets.retain(|p| now - p.timestamp < RETENTION_SECS);

        self.store.restore_node(id, info);
        self.store.restore_history(id, position_history);
        self.store.restore_packets(id, packets);

        for (gateway_id, edge) in gateway_connections {
            self.store.restore_gateway_edge(id, gateway_id, edge);
        }
        self.store.invalidate_reliability(id, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlertConfig, MqttConfig, SecurityConfig, SpecialNodeConfig, WebappConfig};
    use crate::model::GatewayConfidence;
    use crate::store::StoreConfig;
    use std::collections::HashMap as Map;

    fn test_config(persist_path: PathBuf, home: Option<(f64, f64)>) -> Config {
        let mut special_nodes = Map::new();
        special_nodes.insert(
            100,
            SpecialNodeConfig {
                label: Some("Buoy One".into()),
                home_lat: home.map(|h| h.0),
                home_lon: home.map(|h| h.1),
                has_power_sensor: false,
            },
        );
        Config {
            app_title: "t".into(),
            app_version: "0".into(),
            mqtt: MqttConfig {
                broker: "x".into(),
                port: 1883,
                root_topic: "msh/US".into(),
                channel_name: "LongFast".into(),
                username: None,
                password: None,
                channel_key: [0u8; 16],
            },
            special_nodes,
            movement_threshold_meters: 50.0,
            history_hours: 24.0,
            stale_after_seconds: 3600.0,
            data_limit_time_hours: 1.0,
            persist_path,
            show_all_nodes: true,
            show_gateways: true,
            show_position_trails: true,
            trail_history_hours: 24.0,
            alerts: AlertConfig {
                enabled: false,
                cooldown_secs: 3600.0,
                tracker_url: None,
                smtp_host: "localhost".into(),
                smtp_port: 25,
                smtp_ssl: false,
                smtp_username: None,
                smtp_password: None,
                email_from: "tracker@example.com".into(),
                email_to: vec![],
            },
            low_battery_threshold_percent: 20.0,
            webapp: WebappConfig {
                host: "0.0.0.0".into(),
                port: 8080,
                default_center: (0.0, 0.0),
                default_zoom: 8,
                status_blue_threshold_secs: 3600.0,
                status_orange_threshold_secs: 43200.0,
                api_polling_interval_secs: 10,
                api_key: None,
            },
            debug_log_level: None,
            recent_message_buffer_size: 200,
            security: SecurityConfig { environment: "test".into(), trusted_proxies: vec![], allowed_origins: vec![] },
        }
    }

    #[test]
    fn save_then_load_round_trips_into_a_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let config = Arc::new(test_config(path.clone(), Some((37.5637125, -122.2189855))));
        let store = Arc::new(StateStore::new(StoreConfig { show_all_nodes: true, ..StoreConfig::default() }));
        let metrics = Arc::new(Metrics::new());

        store.upsert_node(100, 1000.0, |r| {
            r.is_special = true;
            r.lat = Some(37.58);
            r.lon = Some(-122.22);
            r.origin_lat = Some(37.5637125);
            r.origin_lon = Some(-122.2189855);
        });
        store.append_history(100, HistoryPoint { ts: 1000.0, lat: 37.58, lon: -122.22, alt: None, battery: None, rssi: None, snr: None }, 1000.0);
        store.record_packet(
            100,
            PacketArchiveEntry { timestamp: 1000.0, packet_type: "PositionApp".into(), id: Some(1), ..Default::default() },
            Some(1),
            10.0,
        );
        store.record_gateway(100, 200, GatewayEdge { confidence: GatewayConfidence::Direct, last_seen: 1000.0, rssi: Some(-70), ..Default::default() }, 1000.0);

        let persistence = Persistence::new(store.clone(), config.clone(), metrics.clone());
        persistence.maybe_save(1000.0, true);
        assert!(path.exists());

        let fresh_store = Arc::new(StateStore::new(StoreConfig { show_all_nodes: true, ..StoreConfig::default() }));
        let fresh_persistence = Persistence::new(fresh_store.clone(), config, metrics);
        fresh_persistence.load();

        let rec = fresh_store.get_node(100).unwrap();
        assert_eq!(rec.lat, Some(37.58));
        assert!(rec.is_special);
        assert_eq!(fresh_store.history_snapshot(100).len(), 1);
        assert_eq!(fresh_store.packets_snapshot(100).len(), 1);
        let edges = fresh_store.get_gateway_connections(Some(100));
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].1, 200);
    }

    #[test]
    fn load_missing_file_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does_not_exist.json");
        let config = Arc::new(test_config(path, None));
        let store = Arc::new(StateStore::new(StoreConfig::default()));
        let metrics = Arc::new(Metrics::new());
        Persistence::new(store, config, metrics).load();
    }

    #[test]
    fn load_reconciles_origin_from_current_config_not_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        // snapshot carries a stale home position
        let mut doc: PersistedDocument = HashMap::new();
        doc.insert(
            "100".to_string(),
            PersistedNode {
                info: NodeRecord {
                    is_special: true,
                    lat: Some(37.58),
                    lon: Some(-122.22),
                    origin_lat: Some(0.0),
                    origin_lon: Some(0.0),
                    ..Default::default()
                },
                position_history: vec![],
                packets: vec![],
            },
        );
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let config = Arc::new(test_config(path, Some((37.5637125, -122.2189855))));
        let store = Arc::new(StateStore::new(StoreConfig::default()));
        let metrics = Arc::new(Metrics::new());
        Persistence::new(store.clone(), config, metrics).load();

        let rec = store.get_node(100).unwrap();
        assert_eq!(rec.origin_lat, Some(37.5637125));
        assert!(rec.distance_from_origin_m.unwrap() > 0.0);
    }

    #[test]
    fn coalescing_window_skips_unforced_repeat_saves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let config = Arc::new(test_config(path.clone(), None));
        let store = Arc::new(StateStore::new(StoreConfig::default()));
        let metrics = Arc::new(Metrics::new());
        let persistence = Persistence::new(store, config, metrics);

        persistence.maybe_save(1000.0, true);
        std::fs::remove_file(&path).unwrap();
        persistence.maybe_save(1001.0, false);
        assert!(!path.exists());
        persistence.maybe_save(1006.0, false);
        assert!(path.exists());
    }
}
