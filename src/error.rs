//! Error types for the scale link.
//!
//! `ScaleError` is what callers see, either returned from a manager call or
//! carried inside an `error` event. `RadioError` wraps whatever the radio
//! stack reported.

use std::sync::Arc;
use thiserror::Error;

pub type Result<T, E = ScaleError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("a scan is already in progress")]
    AlreadyScanning,

    #[error("Bluetooth LE radio is not available on this host")]
    UnsupportedPlatform,

    #[error("device {0} has not been discovered")]
    DeviceNotFound(String),

    #[error("device {0} is already connected or connecting")]
    AlreadyConnected(String),

    #[error("failed to connect to {id}: {source}")]
    ConnectionFailed {
        id: String,
        #[source]
        source: RadioError,
    },

    #[error("scale manager has been destroyed")]
    Disposed,

    #[error("radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("failed to decode measurement: {0}")]
    Decode(#[from] DecodeError),

    #[error("connection to {0} was lost")]
    ConnectionLost(String),
}

/// Faults reported by the radio client
#[derive(Debug, Clone, Error)]
pub enum RadioError {
    #[error("radio unavailable")]
    Unavailable,

    #[error("device {0} is not connected")]
    NotConnected(String),

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(uuid::Uuid),

    #[error("{0}")]
    Backend(Arc<dyn std::error::Error + Send + Sync>),
}

impl RadioError {
    /// Wrap a fault from the underlying stack
    pub fn backend(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        RadioError::Backend(Arc::from(e.into()))
    }
}

#[cfg(feature = "bluez")]
impl From<bluer::Error> for RadioError {
    fn from(e: bluer::Error) -> Self {
        RadioError::backend(e)
    }
}

/// Why a raw characteristic payload could not be turned into a reading
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload is empty")]
    Empty,

    #[error("unexpected payload length: expected {expected} bytes, got {actual}")]
    UnexpectedLength { expected: usize, actual: usize },

    #[error("scale reported an unsuccessful measurement")]
    MeasurementUnsuccessful,

    #[error("weight must be positive")]
    NonPositiveWeight,
}

/// Invalid configuration values
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got '{value}'")]
    InvalidValue {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}
