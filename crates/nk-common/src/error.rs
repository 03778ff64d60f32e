use thiserror::Error;

use crate::types::AdapterType;

#[derive(Error, Debug)]
pub enum NetkitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("Adapter '{adapter}' is {actual:?}, expected {expected:?}")]
    AdapterType {
        adapter: String,
        expected: AdapterType,
        actual: AdapterType,
    },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}
