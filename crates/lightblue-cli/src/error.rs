//! Error handling for the LightBlue CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("LightBlue error: {0}")]
    LightBlue(#[from] lightblue_core::LightBlueError),

    #[error("Bluetooth error: {0}")]
    Ble(#[from] lightblue_ble::BleError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid service UUID: {0}")]
    InvalidUuid(String),

    #[error("No matching Bean found within {0} seconds")]
    NoBeanFound(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("Hex decoding error: {0}")]
    HexDecoding(#[from] hex::FromHexError),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_errors_convert() {
        let err = CliError::from(lightblue_ble::BleError::AdapterNotAvailable);
        assert!(matches!(err, CliError::Ble(_)));
        assert_eq!(err.to_string(), "Bluetooth error: BLE adapter not available");
    }
}
