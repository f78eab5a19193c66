use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HrError {
    #[error("No Bluetooth adapter found")]
    NoAdapter,

    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    #[error("Connecting to {0} timed out")]
    ConnectTimeout(String),

    #[error("No Heart Rate service on {0}")]
    NoHeartRateService(String),

    #[error("No Heart Rate characteristic on {0}")]
    NoHeartRateCharacteristic(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl HrError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HrError::Io { path: path.into(), source }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        HrError::Json { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, HrError>;
