use crate::model::CommandKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Precondition failed: {0}")]
    Precondition(#[from] Precondition),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Command failed: {0}")]
    CommandFailure(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a command was refused before anything went on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Precondition {
    #[error("Device is offline")]
    Offline,

    #[error("Device configuration is not known yet")]
    ConfigUnknown,

    #[error("Manual control is disabled while Auto mode is enabled")]
    AutoModeEnabled,

    #[error("Pump is already running")]
    PumpAlreadyRunning,

    #[error("Pump is not running")]
    PumpNotRunning,

    #[error("A {0} command is already in flight")]
    InFlight(CommandKind),
}

impl Error {
    /// Errors that a human must resolve by logging in again.
    pub fn requires_login(&self) -> bool {
        matches!(self, Error::Auth(_))
    }

    /// Errors raised before any network call was made.
    pub fn is_client_side(&self) -> bool {
        matches!(self, Error::Precondition(_) | Error::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
