//! Ingest counters (C11), exposed read-only via the HTTP surface.
//!
//! Direct generalization of the teacher's `Metrics` struct in `main.rs`: one
//! `AtomicU64` per counted event, `Ordering::Relaxed` throughout since these
//! are monitoring counters, not synchronization primitives.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Metrics {
    packets_received: AtomicU64,
    decode_errors: AtomicU64,
    crypto_errors: AtomicU64,
    dedup_drops: AtomicU64,
    gateway_edges_recorded: AtomicU64,
    movement_alerts_sent: AtomicU64,
    battery_alerts_sent: AtomicU64,
    alerts_cooldown_skipped: AtomicU64,
    persist_writes: AtomicU64,
    persist_errors: AtomicU64,
    mqtt_reconnects: AtomicU64,
}

macro_rules! counter_accessors {
    ($($field:ident),+ $(,)?) => {
        $(
            pub fn $field(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )+
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter_accessors!(
        packets_received,
        decode_errors,
        crypto_errors,
        dedup_drops,
        gateway_edges_recorded,
        movement_alerts_sent,
        battery_alerts_sent,
        alerts_cooldown_skipped,
        persist_writes,
        persist_errors,
        mqtt_reconnects,
    );

    pub fn snapshot(&self) -> MetricsResponse {
        MetricsResponse {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            crypto_errors: self.crypto_errors.load(Ordering::Relaxed),
            dedup_drops: self.dedup_drops.load(Ordering::Relaxed),
            gateway_edges_recorded: self.gateway_edges_recorded.load(Ordering::Relaxed),
            movement_alerts_sent: self.movement_alerts_sent.load(Ordering::Relaxed),
            battery_alerts_sent: self.battery_alerts_sent.load(Ordering::Relaxed),
            alerts_cooldown_skipped: self.alerts_cooldown_skipped.load(Ordering::Relaxed),
            persist_writes: self.persist_writes.load(Ordering::Relaxed),
            persist_errors: self.persist_errors.load(Ordering::Relaxed),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub packets_received: u64,
    pub decode_errors: u64,
    pub crypto_errors: u64,
    pub dedup_drops: u64,
    pub gateway_edges_recorded: u64,
    pub movement_alerts_sent: u64,
    pub battery_alerts_sent: u64,
    pub alerts_cooldown_skipped: u64,
    pub persist_writes: u64,
    pub persist_errors: u64,
    pub mqtt_reconnects: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let m = Metrics::new();
        let snap = m.snapshot();
        assert_eq!(snap.packets_received, 0);

        m.packets_received();
        m.packets_received();
        m.decode_errors();

        let snap = m.snapshot();
        assert_eq!(snap.packets_received, 2);
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.crypto_errors, 0);
    }
}
