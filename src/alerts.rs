//! Alert dispatcher (C7): cooldown-gated SMTP notifications.
//!
//! `send_movement_alert` is grounded directly in
//! `original_source/src/alerts.py::send_movement_alert`/`_send_email`.
//! `send_battery_alert` has no surviving reference implementation in the
//! distilled source — `_check_battery_alert` calls a sibling of the same name
//! that was dropped from the retained revision — so it is authored here as a
//! first-class sibling built the same way: same cooldown policy, same
//! transport, a battery/voltage-specific subject and body (SPEC_FULL §4.7).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Message, SmtpTransport, Transport};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{BuoyError, Result};
use crate::metrics::Metrics;
use crate::model::{AlertKind, NodeId, NodeRecord};

/// What crossed the battery threshold — power-sensor nodes alert on raw
/// voltage, everything else on the derived percentage (§4.4).
pub enum BatteryAlertReading {
    Percent(u32),
    Voltage(f32),
}

pub struct AlertDispatcher {
    config: std::sync::Arc<Config>,
    metrics: std::sync::Arc<Metrics>,
    cooldown: Mutex<HashMap<(NodeId, AlertKind), f64>>,
}

impl AlertDispatcher {
    pub fn new(config: std::sync::Arc<Config>, metrics: std::sync::Arc<Metrics>) -> Self {
        Self { config, metrics, cooldown: Mutex::new(HashMap::new()) }
    }

    fn gc(&self, cooldown: &mut HashMap<(NodeId, AlertKind), f64>, now: f64) {
        let ttl = 3.0 * self.config.alerts.cooldown_secs;
        let special_nodes = &self.config.special_nodes;
        cooldown.retain(|(node_id, _), last| now - *last < ttl && special_nodes.contains_key(node_id));
    }

    fn should_send(&self, key: (NodeId, AlertKind), now: f64) -> bool {
        let mut cooldown = self.cooldown.lock().unwrap();
        self.gc(&mut cooldown, now);
        match cooldown.get(&key) {
            Some(&last) => now - last >= self.config.alerts.cooldown_secs,
            None => true,
        }
    }

    fn mark_sent(&self, key: (NodeId, AlertKind), now: f64) {
        self.cooldown.lock().unwrap().insert(key, now);
    }

    fn special_label(&self, node_id: NodeId, record: &NodeRecord) -> String {
        self.config
            .special_nodes
            .get(&node_id)
            .and_then(|s| s.label.clone())
            .or_else(|| record.long_name.clone())
            .unwrap_or_else(|| format!("node {node_id:08x}"))
    }

    /// Send a movement alert if the `(node_id, Movement)` cooldown has
    /// elapsed and alerting is enabled. Infallible from the caller's point of
    /// view (§7 "never re-throws") — failures are logged and counted, never
    /// propagated, and do not advance the cooldown.
    pub fn try_send_movement_alert(&self, node_id: NodeId, record: &NodeRecord, distance_m: f64, now: f64) {
        if !self.config.alerts.enabled {
            return;
        }
        let key = (node_id, AlertKind::Movement);
        if !self.should_send(key, now) {
            self.metrics.alerts_cooldown_skipped();
            return;
        }
        let (lat, lon) = match (record.lat, record.lon) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => {
                warn!(node_id, "movement alert requested without a current position");
                return;
            }
        };
        let origin_lat = record.origin_lat.unwrap_or(lat);
        let origin_lon = record.origin_lon.unwrap_or(lon);
        let label = self.special_label(node_id, record);

        let subject = format!("Movement Alert: {label} moved {distance_m:.0}m from home");
        let body = format!(
            "Movement Alert - Buoy Tracker\n\n\
             Node: {label}\n\n\
             ALERT: node has moved {distance_m:.0} meters from its home position\n\
             Threshold: {threshold:.0}m\n\n\
             Current position:\n  Latitude: {lat:.6}\n  Longitude: {lon:.6}\n  Map: https://www.google.com/maps?q={lat},{lon}\n\n\
             Home position:\n  Latitude: {origin_lat:.6}\n  Longitude: {origin_lon:.6}\n  Map: https://www.google.com/maps?q={origin_lat},{origin_lon}\n\n\
             Tracker: {tracker}\n\n\
             ---\nThis is an automated alert from Buoy Tracker.\n",
            threshold = self.config.movement_threshold_meters,
            tracker = self.config.alerts.tracker_url.as_deref().unwrap_or("http://localhost:5101"),
        );

        match self.send_email(&subject, &body) {
            Ok(()) => {
                self.mark_sent(key, now);
                self.metrics.movement_alerts_sent();
                info!(node_id, distance_m, %label, "sent movement alert");
            }
            Err(e) => {
                error!(node_id, error = %e, "failed to send movement alert");
            }
        }
    }

    /// Send a battery alert if the `(node_id, Battery)` cooldown has
    /// elapsed and alerting is enabled.
    pub fn try_send_battery_alert(
        &self,
        node_id: NodeId,
        record: &NodeRecord,
        reading: BatteryAlertReading,
        now: f64,
    ) {
        if !self.config.alerts.enabled {
            return;
        }
        let key = (node_id, AlertKind::Battery);
        if !self.should_send(key, now) {
            self.metrics.alerts_cooldown_skipped();
            return;
        }
        let label = self.special_label(node_id, record);

        let (subject, reading_line) = match reading {
            BatteryAlertReading::Percent(pct) => (
                format!("Low Battery Alert: {label} at {pct}%"),
                format!("Battery level: {pct}%"),
            ),
            BatteryAlertReading::Voltage(v) => (
                format!("Low Battery Alert: {label} at {v:.2}V"),
                format!("Battery voltage: {v:.2}V"),
            ),
        };
        let body = format!(
            "Low Battery Alert - Buoy Tracker\n\n\
             Node: {label}\n\n\
             ALERT: {reading_line}\n\n\
             Tracker: {tracker}\n\n\
             ---\nThis is an automated alert from Buoy Tracker.\n",
            tracker = self.config.alerts.tracker_url.as_deref().unwrap_or("http://localhost:5101"),
        );

        match self.send_email(&subject, &body) {
            Ok(()) => {
                self.mark_sent(key, now);
                self.metrics.battery_alerts_sent();
                info!(node_id, %label, "sent battery alert");
            }
            Err(e) => {
                error!(node_id, error = %e, "failed to send battery alert");
            }
        }
    }

    fn send_email(&self, subject: &str, body: &str) -> Result<()> {
        let cfg = &self.config.alerts;
        let from: Mailbox = cfg
            .email_from
            .parse()
            .map_err(|e| BuoyError::Config(format!("invalid alerts.email_from address: {e}")))?;

        let mut builder = Message::builder().from(from).subject(subject);
        for addr in &cfg.email_to {
            let to: Mailbox = addr
                .parse()
                .map_err(|e| BuoyError::Config(format!("invalid alerts.email_to address {addr}: {e}")))?;
            builder = builder.to(to);
        }
        let email = builder
            .body(body.to_string())
            .map_err(|e| BuoyError::Config(format!("could not build alert email: {e}")))?;

        let transport = self.build_transport()?;
        transport.send(&email)?;
        Ok(())
    }

    fn build_transport(&self) -> Result<SmtpTransport> {
        let cfg = &self.config.alerts;
        let mut builder = SmtpTransport::builder_dangerous(cfg.smtp_host.clone()).port(cfg.smtp_port);

        builder = if cfg.smtp_ssl {
            builder.tls(Tls::Wrapper(TlsParameters::new(cfg.smtp_host.clone())?))
        } else if cfg.smtp_host != "localhost" {
            builder.tls(Tls::Required(TlsParameters::new(cfg.smtp_host.clone())?))
        } else {
            builder
        };

        if let (Some(username), Some(password)) = (&cfg.smtp_username, &cfg.smtp_password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(builder.timeout(Some(Duration::from_secs(10))).build())
    }
}
