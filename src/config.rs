//! Typed configuration loader (C9): INI parsing, coordinate grammar, and
//! secret overlay/env-var overrides.
//!
//! Grounded in `original_source/src/config.py` (`load_config`, `_parse_coord`,
//! `_parse_special_nodes`); the public/secret file split and env-var override
//! list are carried over verbatim (SPEC_FULL.md §10.2).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{BuoyError, Result};
use crate::model::NodeId;

const ENV_OVERRIDES: &[(&str, &str, &str)] = &[
    ("MQTT_USERNAME", "mqtt", "username"),
    ("MQTT_PASSWORD", "mqtt", "password"),
    ("MQTT_KEY", "mqtt", "encryption_key"),
    ("ALERT_SMTP_USERNAME", "alerts", "smtp_username"),
    ("ALERT_SMTP_PASSWORD", "alerts", "smtp_password"),
];

#[derive(Clone, Debug)]
pub struct SpecialNodeConfig {
    pub label: Option<String>,
    pub home_lat: Option<f64>,
    pub home_lon: Option<f64>,
    pub has_power_sensor: bool,
}

#[derive(Clone, Debug)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub root_topic: String,
    pub channel_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub channel_key: [u8; 16],
}

#[derive(Clone, Debug)]
pub struct AlertConfig {
    pub enabled: bool,
    pub cooldown_secs: f64,
    pub tracker_url: Option<String>,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_ssl: bool,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub email_from: String,
    pub email_to: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct WebappConfig {
    pub host: String,
    pub port: u16,
    pub default_center: (f64, f64),
    pub default_zoom: u32,
    pub status_blue_threshold_secs: f64,
    pub status_orange_threshold_secs: f64,
    pub api_polling_interval_secs: u32,
    pub api_key: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SecurityConfig {
    pub environment: String,
    pub trusted_proxies: Vec<String>,
    pub allowed_origins: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub app_title: String,
    pub app_version: String,
    pub mqtt: MqttConfig,
    pub special_nodes: HashMap<NodeId, SpecialNodeConfig>,
    pub movement_threshold_meters: f64,
    pub history_hours: f64,
    pub stale_after_seconds: f64,
    pub data_limit_time_hours: f64,
    pub persist_path: PathBuf,
    pub show_all_nodes: bool,
    pub show_gateways: bool,
    pub show_position_trails: bool,
    pub trail_history_hours: f64,
    pub alerts: AlertConfig,
    pub low_battery_threshold_percent: f64,
    pub webapp: WebappConfig,
    pub debug_log_level: Option<String>,
    pub recent_message_buffer_size: usize,
    pub security: SecurityConfig,
}

impl Config {
    /// MQTT liveness staleness threshold (§4.4 / §10.1): 300s when subscribed
    /// broadly, 3600s when subscribed to special nodes only.
    pub fn liveness_staleness_secs(&self) -> f64 {
        if self.show_all_nodes || self.show_gateways {
            300.0
        } else {
            3600.0
        }
    }
}

/// Parse a coordinate string: plain decimal first, else `N/S/E/W deg° min'`.
pub fn parse_coordinate(s: &str) -> Result<f64> {
    let s = s.trim();
    if let Ok(v) = s.parse::<f64>() {
        return Ok(v);
    }

    let bytes = s.as_bytes();
    if bytes.is_empty() {
        return Err(BuoyError::Config("empty coordinate string".to_string()));
    }
    let hemisphere = bytes[0].to_ascii_uppercase() as char;
    if !matches!(hemisphere, 'N' | 'S' | 'E' | 'W') {
        return Err(BuoyError::Config(format!("unrecognized coordinate format: {s}")));
    }
    let rest = &s[1..];
    let deg_idx = rest
        .find('°')
        .ok_or_else(|| BuoyError::Config(format!("missing degree marker in coordinate: {s}")))?;
    let degrees_str = rest[..deg_idx].trim();
    let minutes_str = rest[deg_idx + '°'.len_utf8()..].trim().trim_end_matches('\'').trim();

    let degrees: f64 = degrees_str
        .parse()
        .map_err(|_| BuoyError::Config(format!("bad degree value in coordinate: {s}")))?;
    let minutes: f64 = minutes_str
        .parse()
        .map_err(|_| BuoyError::Config(format!("bad minute value in coordinate: {s}")))?;

    if !(0.0..=180.0).contains(&degrees) {
        return Err(BuoyError::Config(format!("degrees out of range in coordinate: {s}")));
    }
    if !(0.0..60.0).contains(&minutes) {
        return Err(BuoyError::Config(format!("minutes out of range in coordinate: {s}")));
    }

    let magnitude = degrees + minutes / 60.0;
    Ok(if matches!(hemisphere, 'S' | 'W') { -magnitude } else { magnitude })
}

fn parse_coordinate_pair(s: &str) -> Result<(f64, f64)> {
    let mut parts = s.split(',');
    let lat = parts
        .next()
        .ok_or_else(|| BuoyError::Config(format!("missing latitude in coordinate pair: {s}")))?;
    let lon = parts
        .next()
        .ok_or_else(|| BuoyError::Config(format!("missing longitude in coordinate pair: {s}")))?;
    Ok((parse_coordinate(lat)?, parse_coordinate(lon)?))
}

fn get<'a>(ini: &'a ini::Ini, section: &str, key: &str) -> Option<&'a str> {
    ini.get_from(Some(section), key)
}

fn get_owned(ini: &ini::Ini, section: &str, key: &str) -> Option<String> {
    get(ini, section, key).map(|s| s.to_string())
}

fn get_f64(ini: &ini::Ini, section: &str, key: &str, default: f64) -> f64 {
    get(ini, section, key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u32(ini: &ini::Ini, section: &str, key: &str, default: u32) -> u32 {
    get(ini, section, key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u16(ini: &ini::Ini, section: &str, key: &str, default: u16) -> u16 {
    get(ini, section, key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_bool(ini: &ini::Ini, section: &str, key: &str, default: bool) -> bool {
    get(ini, section, key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn get_list(ini: &ini::Ini, section: &str, key: &str) -> Vec<String> {
    get(ini, section, key)
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn parse_special_nodes(ini: &ini::Ini) -> HashMap<NodeId, SpecialNodeConfig> {
    let mut out = HashMap::new();
    let Some(section) = ini.section(Some("special_nodes")) else {
        return out;
    };
    for (key, value) in section.iter() {
        let Ok(node_id) = key.parse::<NodeId>() else {
            // non-numeric stray members (e.g. a `movement_threshold` left in
            // the wrong section) are skipped, not fatal.
            continue;
        };
        if out.contains_key(&node_id) {
            tracing::warn!(node_id, "duplicate special_nodes entry, keeping the first");
            continue;
        }
        let mut parts = value.splitn(3, ',').map(str::trim);
        let label = parts.next().filter(|s| !s.is_empty()).map(String::from);
        let mut home_lat = None;
        let mut home_lon = None;
        if let (Some(lat_s), Some(lon_s)) = (parts.next(), parts.next()) {
            match (parse_coordinate(lat_s), parse_coordinate(lon_s)) {
                (Ok(lat), Ok(lon)) => {
                    home_lat = Some(lat);
                    home_lon = Some(lon);
                }
                _ => {
                    tracing::warn!(node_id, "could not parse home position, origin will be learned from first fix");
                }
            }
        }
        let has_power_sensor = ini
            .get_from(Some("special_nodes_power"), key)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        out.insert(node_id, SpecialNodeConfig { label, home_lat, home_lon, has_power_sensor });
    }
    out
}

fn merge_ini(base: &mut ini::Ini, overlay: ini::Ini) {
    for (section, props) in overlay.iter() {
        for (key, value) in props.iter() {
            base.set_to(section, key.to_string(), value.to_string());
        }
    }
}

fn apply_env_overrides(ini: &mut ini::Ini) {
    for (env_var, section, key) in ENV_OVERRIDES {
        if let Ok(value) = std::env::var(env_var) {
            ini.set_to(Some(*section), key.to_string(), value);
        }
    }
}

/// Load configuration from `public_path` (falling back to a `.template`
/// sibling if it is missing) and an optional `secret_path` overlay, applying
/// environment overrides last. Fatal per §10.2: missing public config file,
/// unparseable `default_center`, or an encryption key that doesn't base64
/// decode.
pub fn load(public_path: &Path, secret_path: Option<&Path>) -> Result<Config> {
    let resolved_public = if public_path.exists() {
        public_path.to_path_buf()
    } else {
        let template = public_path.with_extension(
            format!("{}.template", public_path.extension().and_then(|e| e.to_str()).unwrap_or("config")),
        );
        if template.exists() {
            template
        } else {
            return Err(BuoyError::Config(format!(
                "config file not found: {} (and no .template fallback)",
                public_path.display()
            )));
        }
    };

    let mut ini = ini::Ini::load_from_file(&resolved_public)
        .map_err(|e| BuoyError::Config(format!("failed to parse {}: {e}", resolved_public.display())))?;

    if let Some(secret_path) = secret_path {
        if secret_path.exists() {
            let overlay = ini::Ini::load_from_file(secret_path)
                .map_err(|e| BuoyError::Config(format!("failed to parse {}: {e}", secret_path.display())))?;
            merge_ini(&mut ini, overlay);
        }
    }

    apply_env_overrides(&mut ini);

    let encryption_key_str = get_owned(&ini, "mqtt", "encryption_key").unwrap_or_else(|| "AQ==".to_string());
    let channel_key = crate::crypto::decode_channel_key(&encryption_key_str)?;

    let default_center_str = get_owned(&ini, "webapp", "default_center").unwrap_or_else(|| "0,0".to_string());
    let default_center = parse_coordinate_pair(&default_center_str)
        .map_err(|e| BuoyError::Config(format!("invalid webapp.default_center: {e}")))?;

    let api_polling_interval_secs = get_u32(&ini, "webapp", "api_polling_interval", 10).clamp(5, 60);

    let alert_cooldown_hours = get_f64(&ini, "alerts", "alert_cooldown", 1.0);

    Ok(Config {
        app_title: get_owned(&ini, "app", "title").unwrap_or_else(|| "Buoy Tracker".to_string()),
        app_version: get_owned(&ini, "app", "version").unwrap_or_else(|| "0.0.0".to_string()),
        mqtt: MqttConfig {
            broker: get_owned(&ini, "mqtt", "broker").unwrap_or_else(|| "mqtt.meshtastic.org".to_string()),
            port: get_u16(&ini, "mqtt", "port", 1883),
            root_topic: get_owned(&ini, "mqtt", "root_topic").unwrap_or_else(|| "msh/US".to_string()),
            channel_name: get_owned(&ini, "mqtt", "channel_name").unwrap_or_else(|| "LongFast".to_string()),
            username: get_owned(&ini, "mqtt", "username"),
            password: get_owned(&ini, "mqtt", "password"),
            channel_key,
        },
        special_nodes: parse_special_nodes(&ini),
        movement_threshold_meters: get_f64(&ini, "special_nodes_settings", "movement_threshold_meters", 50.0),
        history_hours: get_f64(&ini, "special_nodes_settings", "history_hours", 24.0),
        stale_after_seconds: get_f64(&ini, "special_nodes_settings", "stale_after_hours", 12.0) * 3600.0,
        data_limit_time_hours: get_f64(&ini, "special_nodes_settings", "data_limit_time", 1.0),
        persist_path: PathBuf::from(
            get_owned(&ini, "special_nodes_settings", "persist_path").unwrap_or_else(|| "buoy_state.json".to_string()),
        ),
        show_all_nodes: get_bool(&ini, "app_features", "show_all_nodes", false),
        show_gateways: get_bool(&ini, "app_features", "show_gateways", false),
        show_position_trails: get_bool(&ini, "app_features", "show_position_trails", true),
        trail_history_hours: get_f64(&ini, "app_features", "trail_history_hours", 24.0),
        alerts: AlertConfig {
            enabled: get_bool(&ini, "alerts", "enabled", false),
            cooldown_secs: alert_cooldown_hours * 3600.0,
            tracker_url: get_owned(&ini, "alerts", "tracker_url"),
            smtp_host: get_owned(&ini, "alerts", "smtp_host").unwrap_or_else(|| "localhost".to_string()),
            smtp_port: get_u16(&ini, "alerts", "smtp_port", 587),
            smtp_ssl: get_bool(&ini, "alerts", "smtp_ssl", false),
            smtp_username: get_owned(&ini, "alerts", "smtp_username"),
            smtp_password: get_owned(&ini, "alerts", "smtp_password"),
            email_from: get_owned(&ini, "alerts", "email_from").unwrap_or_else(|| "buoy-tracker@localhost".to_string()),
            email_to: get_list(&ini, "alerts", "email_to"),
        },
        low_battery_threshold_percent: get_f64(&ini, "battery", "low_battery_threshold", 20.0),
        webapp: WebappConfig {
            host: get_owned(&ini, "webapp", "host").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: get_u16(&ini, "webapp", "port", 8080),
            default_center,
            default_zoom: get_u32(&ini, "webapp", "default_zoom", 8),
            status_blue_threshold_secs: get_f64(&ini, "webapp", "status_blue_threshold", 1.0) * 3600.0,
            status_orange_threshold_secs: get_f64(&ini, "webapp", "status_orange_threshold", 12.0) * 3600.0,
            api_polling_interval_secs,
            api_key: get_owned(&ini, "webapp", "api_key"),
        },
        debug_log_level: get_owned(&ini, "debug", "log_level"),
        recent_message_buffer_size: get_u32(&ini, "debug", "recent_message_buffer_size", 200) as usize,
        security: SecurityConfig {
            environment: get_owned(&ini, "security", "environment").unwrap_or_else(|| "production".to_string()),
            trusted_proxies: get_list(&ini, "security", "trusted_proxies"),
            allowed_origins: get_list(&ini, "security", "allowed_origins"),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_coordinate_plain_decimal() {
        assert!((parse_coordinate("37.5637125").unwrap() - 37.5637125).abs() < 1e-9);
        assert!((parse_coordinate("-122.219").unwrap() - (-122.219)).abs() < 1e-9);
    }

    #[test]
    fn parse_coordinate_degrees_minutes() {
        let lat = parse_coordinate("N37° 33.8228'").unwrap();
        assert!((lat - 37.563713).abs() < 1e-4);
        let lon = parse_coordinate("W122° 13.139'").unwrap();
        assert!(lon < 0.0);
    }

    #[test]
    fn parse_coordinate_rejects_out_of_range_minutes() {
        assert!(parse_coordinate("N10° 61.0'").is_err());
    }

    #[test]
    fn parse_coordinate_rejects_garbage() {
        assert!(parse_coordinate("not-a-coordinate").is_err());
    }

    #[test]
    fn special_nodes_skip_stray_non_numeric_keys() {
        let mut ini = ini::Ini::new();
        ini.with_section(Some("special_nodes"))
            .set("movement_threshold", "50")
            .set("3663493692", "Buoy One,37.5637125,-122.2189855");
        let parsed = parse_special_nodes(&ini);
        assert_eq!(parsed.len(), 1);
        let node = parsed.get(&3663493692).unwrap();
        assert_eq!(node.label.as_deref(), Some("Buoy One"));
        assert!((node.home_lat.unwrap() - 37.5637125).abs() < 1e-6);
    }

    #[test]
    fn special_nodes_label_only_degrades_gracefully() {
        let mut ini = ini::Ini::new();
        ini.with_section(Some("special_nodes")).set("100", "Label Only");
        let parsed = parse_special_nodes(&ini);
        let node = parsed.get(&100).unwrap();
        assert_eq!(node.label.as_deref(), Some("Label Only"));
        assert!(node.home_lat.is_none());
    }

    #[test]
    fn env_override_takes_precedence() {
        std::env::set_var("MQTT_USERNAME", "env-user");
        let mut ini = ini::Ini::new();
        ini.with_section(Some("mqtt")).set("username", "file-user");
        apply_env_overrides(&mut ini);
        assert_eq!(get_owned(&ini, "mqtt", "username"), Some("env-user".to_string()));
        std::env::remove_var("MQTT_USERNAME");
    }

    #[test]
    fn api_polling_interval_clamped() {
        let mut ini = ini::Ini::new();
        ini.with_section(Some("webapp")).set("api_polling_interval", "1000");
        assert_eq!(get_u32(&ini, "webapp", "api_polling_interval", 10).clamp(5, 60), 60);
    }
}
