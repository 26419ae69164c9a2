//! Error types for the LightBlue lifecycle manager

use thiserror::Error;
use uuid::Uuid;

use crate::device::{Capability, DeviceAddress};

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors surfaced by devices, services and the lifecycle orchestrator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LightBlueError {
    /// Failure reported by the underlying radio binding
    #[error("Radio error: {0}")]
    Radio(String),

    #[error("Failed to connect to device {address}: {reason}")]
    ConnectionFailed {
        address: DeviceAddress,
        reason: String,
    },

    #[error("Connection to device {address} timed out")]
    ConnectionTimeout { address: DeviceAddress },

    #[error("Device {address} is not connected")]
    NotConnected { address: DeviceAddress },

    #[error("Failed to discover services on {address}: {reason}")]
    ServiceDiscoveryFailed {
        address: DeviceAddress,
        reason: String,
    },

    #[error("Failed to set up service {service}: {reason}")]
    ServiceSetup { service: Uuid, reason: String },

    #[error("Service {service} has not been set up")]
    ServiceNotReady { service: Uuid },

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: Uuid },

    #[error("Invalid value on characteristic {characteristic}: {reason}")]
    InvalidValue { characteristic: Uuid, reason: String },

    #[error("No response to command 0x{command:04x}")]
    CommandTimeout { command: u16 },

    #[error("Invalid response to command 0x{command:04x}: {reason}")]
    InvalidResponse { command: u16, reason: String },

    #[error("No device: {address}")]
    UnknownDevice { address: DeviceAddress },

    /// The device kind supports the capability but the service was never found
    #[error("Device {address} has no {capability} service")]
    ServiceAbsent {
        address: DeviceAddress,
        capability: Capability,
    },

    /// The device kind never offers the capability
    #[error("Device {address} does not support {capability}")]
    Unsupported {
        address: DeviceAddress,
        capability: Capability,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Firmware update error: {0}")]
    FirmwareUpdate(String),

    #[error("Sketch upload error: {0}")]
    SketchUpload(String),

    #[error("Channel closed")]
    ChannelClosed,
}

impl LightBlueError {
    /// Wrap any displayable radio-layer failure
    pub fn radio(err: impl std::fmt::Display) -> Self {
        LightBlueError::Radio(err.to_string())
    }
}

/// Result type for LightBlue operations
pub type Result<T> = std::result::Result<T, LightBlueError>;
