//! Error taxonomy for the boundaries that can genuinely fail and must report
//! upward: config load, persistence, SMTP, MQTT transport. Per-packet decode
//! and processing failures are handled locally inside the processor and never
//! become a `BuoyError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuoyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("persistence error: {0}")]
    Persist(#[from] std::io::Error),

    #[error("persisted state is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("mqtt error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

pub type Result<T> = std::result::Result<T, BuoyError>;
