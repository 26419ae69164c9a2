//! Shared fixtures for LightBlue integration tests

use std::sync::Arc;
use std::time::Duration;

use lightblue_core::mock::{advertisement, MockFirmwareUpdater, MockPeripheral, MockRadio};
use lightblue_core::uuids::SERIAL_TRANSPORT_SERVICE_UUID;
use lightblue_core::{Advertisement, LightBlue, LightBlueConfig};

// ----------------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------------

/// A started orchestrator wired to the in-memory radio
pub struct Harness {
    pub radio: Arc<MockRadio>,
    pub firmware: Arc<MockFirmwareUpdater>,
    pub lightblue: LightBlue,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(LightBlueConfig::default()).await
    }

    pub async fn with_config(config: LightBlueConfig) -> Self {
        let radio = MockRadio::new();
        let firmware = MockFirmwareUpdater::new();
        let lightblue = LightBlue::builder(radio.clone())
            .with_config(config)
            .with_firmware_updater(firmware.clone())
            .build_and_start()
            .await
            .expect("orchestrator starts");
        Self {
            radio,
            firmware,
            lightblue,
        }
    }

    /// Advertise through the radio event stream
    pub fn advertise(&self, advertisement: Advertisement) {
        self.radio.advertise(advertisement);
    }
}

pub fn bean_advertisement(peripheral: &Arc<MockPeripheral>, name: &str) -> Advertisement {
    advertisement(peripheral, name, &[SERIAL_TRANSPORT_SERVICE_UUID])
}

/// Poll `condition` until it holds or a second passes
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
