// =============================================================================
// buoy-tracker — Meshtastic MQTT buoy-tracking service
// =============================================================================
// Wiring only: config load, tracing init, the state store / metrics / alert
// dispatcher / persistence / mqtt client / processor graph, and graceful
// shutdown. All per-module behavior lives in its own file.
// =============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

mod alerts;
mod config;
mod crypto;
mod error;
mod geo;
mod http;
mod metrics;
mod model;
mod mqtt;
mod persistence;
mod processor;
mod proto;
mod store;
mod topic;

use crate::config::Config;
use crate::http::AppState;
use crate::metrics::Metrics;
use crate::model::now_unix;
use crate::mqtt::MqttClient;
use crate::persistence::Persistence;
use crate::processor::Processor;
use crate::store::{StateStore, StoreConfig};

const RAW_QUEUE_CAPACITY: usize = 10_000;
const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(10);
const PERSIST_TICK: Duration = Duration::from_secs(5);

fn store_config(config: &Config) -> StoreConfig {
    StoreConfig {
        history_hours: config.history_hours,
        data_limit_time_hours: config.data_limit_time_hours,
        stale_after_seconds: config.stale_after_seconds,
        status_blue_threshold_seconds: config.webapp.status_blue_threshold_secs,
        status_orange_threshold_seconds: config.webapp.status_orange_threshold_secs,
        show_all_nodes: config.show_all_nodes,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "buoy_tracker=info,tower_http=info".into()))
        .json()
        .init();

    let public_path = std::env::var("BUOY_CONFIG").unwrap_or_else(|_| "buoy_tracker.ini".to_string());
    let secret_path = std::env::var("BUOY_SECRETS").ok();
    let config = match config::load(std::path::Path::new(&public_path), secret_path.as_ref().map(std::path::Path::new))
    {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("[fatal] config load failed: {e}");
            std::process::exit(1);
        }
    };

    info!(version = %config.app_version, title = %config.app_title, "buoy tracker starting");

    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(StateStore::new(store_config(&config)));
    let alerts = Arc::new(alerts::AlertDispatcher::new(config.clone(), metrics.clone()));
    let persistence = Arc::new(Persistence::new(store.clone(), config.clone(), metrics.clone()));
    let mqtt_client = Arc::new(MqttClient::new(config.clone(), metrics.clone()));
    let processor = Arc::new(Processor::new(store.clone(), config.clone(), metrics.clone(), alerts.clone()));

    persistence.load();

    let (raw_tx, mut raw_rx) = mpsc::channel::<(String, Vec<u8>)>(RAW_QUEUE_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mqtt_task = {
        let mqtt_client = mqtt_client.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            mqtt_client.run(raw_tx, shutdown_rx).await;
        })
    };

    let (processor_done_tx, mut processor_done_rx) = mpsc::channel::<()>(1);
    let processor_task = {
        let processor = processor.clone();
        let persistence = persistence.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut persist_tick = tokio::time::interval(PERSIST_TICK);
            loop {
                tokio::select! {
                    Some((topic, payload)) = raw_rx.recv() => {
                        processor.process_raw(&topic, &payload);
                        persistence.maybe_save(now_unix(), false);
                    }
                    _ = persist_tick.tick() => {
                        persistence.maybe_save(now_unix(), false);
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            // drain whatever is already queued before the final snapshot
            while let Ok((topic, payload)) = raw_rx.try_recv() {
                processor.process_raw(&topic, &payload);
            }
            persistence.maybe_save(now_unix(), true);
            let _ = processor_done_tx.send(()).await;
        })
    };

    let app_state = AppState { store: store.clone(), metrics: metrics.clone(), mqtt: mqtt_client.clone() };
    let app = http::router(app_state);

    let port = config.webapp.port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        eprintln!("[fatal] could not bind {addr}: {e}");
        std::process::exit(1);
    });

    let http_shutdown_rx = shutdown_rx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let mut rx = http_shutdown_rx;
        let _ = rx.changed().await;
        info!("http server shutting down");
    });

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "http server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, starting graceful shutdown");
        }
    }

    // §5: stop accepting new mqtt messages, drain the processor with a
    // bounded deadline, force one final snapshot, close the broker.
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(SHUTDOWN_DRAIN_DEADLINE, processor_done_rx.recv()).await.is_err() {
        warn!("processor did not drain within the shutdown deadline, forcing final snapshot");
        persistence.maybe_save(now_unix(), true);
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), mqtt_task).await;
    processor_task.abort();

    info!("shutdown complete");
}
