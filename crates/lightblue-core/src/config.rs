//! Lifecycle manager configuration

use std::time::Duration;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the LightBlue lifecycle manager
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LightBlueConfig {
    /// Default scan duration, also used when scanning resumes after a connect
    pub scan_timeout: Duration,
    /// Maximum time to wait for a radio connection
    pub connection_timeout: Duration,
    /// Maximum time to wait for a command reply
    pub command_timeout: Duration,
    /// Track and announce plain BLE peripherals as well as Beans
    pub discover_generic_devices: bool,
    /// Buffered discovery notifications per subscriber
    pub discovery_channel_capacity: usize,
}

impl Default for LightBlueConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
            discover_generic_devices: false,
            discovery_channel_capacity: 32,
        }
    }
}

impl LightBlueConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default scan timeout
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set command reply timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Enable or disable tracking of generic BLE peripherals
    pub fn with_generic_devices(mut self, enabled: bool) -> Self {
        self.discover_generic_devices = enabled;
        self
    }

    /// Set discovery channel capacity
    pub fn with_discovery_channel_capacity(mut self, capacity: usize) -> Self {
        self.discovery_channel_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let config = LightBlueConfig::new()
            .with_scan_timeout(Duration::from_secs(5))
            .with_generic_devices(true)
            .with_discovery_channel_capacity(0);

        assert_eq!(config.scan_timeout, Duration::from_secs(5));
        assert!(config.discover_generic_devices);
        assert_eq!(config.discovery_channel_capacity, 1);
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: LightBlueConfig =
            serde_json::from_str(r#"{"discover_generic_devices": true}"#).unwrap();
        assert!(config.discover_generic_devices);
        assert_eq!(config.scan_timeout, Duration::from_secs(30));
    }
}
