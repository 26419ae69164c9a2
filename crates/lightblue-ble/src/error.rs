//! Error types for the btleplug binding

use lightblue_core::LightBlueError;
use thiserror::Error;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors specific to the btleplug binding
#[derive(Error, Debug)]
pub enum BleError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Failed to create BLE manager: {0}")]
    ManagerFailed(String),

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: Uuid },

    #[error("Failed to get BLE events: {0}")]
    EventStreamFailed(String),

    #[error("Failed to get notifications stream: {0}")]
    NotificationStreamFailed(String),

    #[error("Bluetooth error: {0}")]
    Btleplug(#[from] btleplug::Error),
}

impl From<BleError> for LightBlueError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::CharacteristicNotFound { characteristic } => {
                LightBlueError::CharacteristicNotFound { characteristic }
            }
            other => LightBlueError::Radio(other.to_string()),
        }
    }
}
