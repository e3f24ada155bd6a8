use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SweepError {
    /// Malformed sweep, colliding labels or an out-of-range device.
    /// Raised before anything is provisioned.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("provisioning failed for {label} at {}: {source}", path.display())]
    Provisioning {
        label: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("launch failed for {label} ({program}): {reason}")]
    Launch {
        label: String,
        program: String,
        reason: String,
    },
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialize(String),
}

impl SweepError {
    pub fn config(message: impl Into<String>) -> Self {
        SweepError::Configuration(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            SweepError::Configuration(_) => "configuration_error",
            SweepError::Provisioning { .. } => "provisioning_error",
            SweepError::Launch { .. } => "launch_error",
            SweepError::Io { .. } => "io_error",
            SweepError::Serialize(_) => "serialization_error",
        }
    }
}

impl From<serde_json::Error> for SweepError {
    fn from(e: serde_json::Error) -> Self {
        SweepError::Serialize(e.to_string())
    }
}

impl From<serde_yaml::Error> for SweepError {
    fn from(e: serde_yaml::Error) -> Self {
        SweepError::Configuration(format!("invalid sweep file: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, SweepError>;
