//! Lifecycle orchestrator
//!
//! [`LightBlue`] is the explicit context object an application creates once.
//! It owns the registry and the scan controller, consumes the radio event
//! stream, announces new devices and drives auto-reconnect.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::LightBlueConfig;
use crate::device::{Device, DeviceAddress};
use crate::error::{LightBlueError, Result};
use crate::firmware::{
    FirmwareImage, FirmwareUpdater, NoFirmwareUpdater, NoSketchUploader, SketchUploader,
};
use crate::radio::{Advertisement, Radio, RadioEvent};
use crate::registry::{Observation, Registry};
use crate::scan::{ScanController, TimeoutCallback};

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builder for [`LightBlue`]
pub struct LightBlueBuilder {
    radio: Arc<dyn Radio>,
    config: LightBlueConfig,
    firmware: Arc<dyn FirmwareUpdater>,
    sketches: Arc<dyn SketchUploader>,
}

impl LightBlueBuilder {
    pub fn new(radio: Arc<dyn Radio>) -> Self {
        Self {
            radio,
            config: LightBlueConfig::default(),
            firmware: Arc::new(NoFirmwareUpdater),
            sketches: Arc::new(NoSketchUploader),
        }
    }

    pub fn with_config(mut self, config: LightBlueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_firmware_updater(mut self, firmware: Arc<dyn FirmwareUpdater>) -> Self {
        self.firmware = firmware;
        self
    }

    pub fn with_sketch_uploader(mut self, sketches: Arc<dyn SketchUploader>) -> Self {
        self.sketches = sketches;
        self
    }

    pub fn build(self) -> LightBlue {
        let (discoveries, _) = broadcast::channel(self.config.discovery_channel_capacity.max(1));
        LightBlue {
            inner: Arc::new(Inner {
                scanner: ScanController::new(self.radio.clone(), self.config.scan_timeout),
                registry: RwLock::new(Registry::new(self.config.clone())),
                config: self.config,
                radio: self.radio,
                firmware: self.firmware,
                sketches: self.sketches,
                discoveries,
                event_task: Mutex::new(None),
            }),
        }
    }

    /// Build and start consuming radio events
    pub async fn build_and_start(self) -> Result<LightBlue> {
        let lightblue = self.build();
        lightblue.start().await?;
        Ok(lightblue)
    }
}

// ----------------------------------------------------------------------------
// Orchestrator
// ----------------------------------------------------------------------------

struct Inner {
    config: LightBlueConfig,
    radio: Arc<dyn Radio>,
    scanner: ScanController,
    registry: RwLock<Registry>,
    firmware: Arc<dyn FirmwareUpdater>,
    sketches: Arc<dyn SketchUploader>,
    discoveries: broadcast::Sender<Arc<Device>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Device registry and connection lifecycle manager
#[derive(Clone)]
pub struct LightBlue {
    inner: Arc<Inner>,
}

impl LightBlue {
    pub fn builder(radio: Arc<dyn Radio>) -> LightBlueBuilder {
        LightBlueBuilder::new(radio)
    }

    pub fn config(&self) -> &LightBlueConfig {
        &self.inner.config
    }

    /// Start consuming the radio event stream; a no-op if already started
    pub async fn start(&self) -> Result<()> {
        if self.inner.event_task.lock().is_some() {
            debug!("LightBlue already started");
            return Ok(());
        }

        let mut events = self.inner.radio.events().await?;
        self.inner
            .scanner
            .set_radio_state(self.inner.radio.state().await);

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                LightBlue { inner }.handle_event(event).await;
            }
            debug!("Radio event stream ended");
        });

        let mut slot = self.inner.event_task.lock();
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
        info!("LightBlue started");
        Ok(())
    }

    /// Stop consuming radio events
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.event_task.lock().take() {
            task.abort();
            info!("LightBlue shut down");
        }
    }

    async fn handle_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::Advertisement(advertisement) => {
                self.handle_advertisement(advertisement).await;
            }
            RadioEvent::StateChanged(state) => self.inner.scanner.set_radio_state(state),
        }
    }

    /// Feed one advertisement through the registry
    ///
    /// New devices are announced to subscribers; known devices with
    /// auto-reconnect enabled get a reconnect attempt in the background.
    pub async fn handle_advertisement(&self, advertisement: Advertisement) -> Observation {
        let sighting = self.inner.registry.write().await.record(&advertisement);
        let observation = sighting.into_observation().await;

        match &observation {
            Observation::NewDevice(device) => {
                if self.inner.discoveries.send(device.clone()).is_err() {
                    debug!("No discovery subscribers for {}", device);
                }
            }
            Observation::UpdatedExisting {
                device,
                reconnect: true,
            } => {
                let this = self.clone();
                let device = device.clone();
                tokio::spawn(async move { this.auto_reconnect(device).await });
            }
            _ => {}
        }
        observation
    }

    /// Receive every device recognized from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Device>> {
        self.inner.discoveries.subscribe()
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    /// Start scanning; `timeout` defaults to the configured scan timeout
    pub async fn start_scanning(
        &self,
        timeout: Option<Duration>,
        on_timeout: Option<TimeoutCallback>,
    ) -> Result<()> {
        let timeout = timeout.unwrap_or(self.inner.config.scan_timeout);
        self.inner.scanner.start(timeout, on_timeout).await
    }

    pub async fn stop_scanning(&self) -> Result<()> {
        self.inner.scanner.stop().await
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanner.is_scanning()
    }

    pub fn scanner(&self) -> &ScanController {
        &self.inner.scanner
    }

    // ------------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------------

    pub async fn device(&self, address: &DeviceAddress) -> Option<Arc<Device>> {
        self.inner.registry.read().await.get(address)
    }

    /// Tracked devices in the order they were first seen
    pub async fn devices(&self) -> Vec<Arc<Device>> {
        self.inner.registry.read().await.devices()
    }

    /// Connect to a tracked device with scanning paused around the attempt
    pub async fn connect_to_device(&self, address: &DeviceAddress) -> Result<Arc<Device>> {
        let device = self
            .device(address)
            .await
            .ok_or_else(|| LightBlueError::UnknownDevice {
                address: address.clone(),
            })?;
        self.connect_with_scan_paused(&device).await?;
        Ok(device)
    }

    async fn connect_with_scan_paused(&self, device: &Device) -> Result<()> {
        let snapshot = self.inner.scanner.pause_for_connect().await;
        let result = device.connect().await;
        self.inner.scanner.resume(snapshot).await;
        result
    }

    /// Reconnect a device that advertised while auto-reconnect was enabled
    ///
    /// Failures are logged only. A reconnect in the middle of a firmware
    /// update rediscovers services and resumes the update.
    pub async fn auto_reconnect(&self, device: Arc<Device>) {
        info!("Auto reconnecting to {}", device);

        if let Err(e) = self.connect_with_scan_paused(&device).await {
            info!("Error reconnecting to {}: {}", device, e);
            return;
        }
        info!("Auto reconnect to {} success", device);

        if self.inner.firmware.is_in_progress(&device) {
            info!("Auto-reconnected to {} in the middle of a firmware update", device);
            if let Err(e) = device.discover_services().await {
                warn!("Service lookup after reconnect failed: {}", e);
            }
            if let Err(e) = self.inner.firmware.continue_update().await {
                error!("Failed to continue firmware update: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------------

    pub async fn update_firmware(
        &self,
        device: Arc<Device>,
        bundle: Vec<FirmwareImage>,
        force: bool,
    ) -> Result<()> {
        info!("Starting firmware update for {} ({} images)", device, bundle.len());
        self.inner.firmware.begin_update(device, bundle, force).await
    }

    /// Upload an Arduino sketch; scanning is stopped first
    pub async fn upload_sketch(
        &self,
        device: Arc<Device>,
        sketch: Vec<u8>,
        name: &str,
        prompt_user: bool,
    ) -> Result<()> {
        self.stop_scanning().await?;
        info!("Uploading sketch {} to {}", name, device);
        self.inner
            .sketches
            .begin_upload(device, sketch, name.to_string(), prompt_user)
            .await
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Stop scanning and disconnect every tracked device
    ///
    /// All disconnects are attempted even if some fail; the first error
    /// encountered is returned.
    pub async fn quit_gracefully(&self) -> Result<()> {
        info!("Quitting gracefully...");
        let mut first_error = self.stop_scanning().await.err();

        let devices = self.devices().await;
        let results = join_all(devices.iter().map(|device| device.disconnect())).await;
        for (device, result) in devices.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to disconnect {}: {}", device, e);
                first_error.get_or_insert(e);
            }
        }

        info!("All devices have disconnected");
        first_error.map_or(Ok(()), Err)
    }

    /// Disconnect and forget every device and any in-flight firmware update
    pub async fn reset(&self) {
        info!("Resetting LightBlue");
        let devices = self.inner.registry.write().await.clear();

        let results = join_all(devices.iter().map(|device| device.disconnect())).await;
        for (device, result) in devices.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to disconnect {} during reset: {}", device, e);
            }
        }

        self.inner.firmware.reset_state();
        info!("Reset complete ({} devices forgotten)", devices.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{advertisement, MockFirmwareUpdater, MockPeripheral, MockRadio};
    use crate::uuids::SERIAL_TRANSPORT_SERVICE_UUID;

    fn bean_advertisement(peripheral: &Arc<MockPeripheral>) -> Advertisement {
        advertisement(peripheral, "Bean", &[SERIAL_TRANSPORT_SERVICE_UUID])
    }

    #[tokio::test]
    async fn test_new_device_is_announced_once() {
        let radio = MockRadio::new();
        let lightblue = LightBlue::builder(radio).build();
        let mut discoveries = lightblue.subscribe();
        let peripheral = MockPeripheral::bean("AA:BB");

        lightblue.handle_advertisement(bean_advertisement(&peripheral)).await;
        lightblue.handle_advertisement(bean_advertisement(&peripheral)).await;

        let device = discoveries.recv().await.unwrap();
        assert_eq!(device.address().as_str(), "AA:BB");
        assert!(discoveries.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_unknown_device() {
        let lightblue = LightBlue::builder(MockRadio::new()).build();
        let err = lightblue
            .connect_to_device(&DeviceAddress::from("EE:FF"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No device: EE:FF");
    }

    #[tokio::test]
    async fn test_upload_sketch_stops_scanning() {
        let radio = MockRadio::new();
        let lightblue = LightBlue::builder(radio.clone()).build();
        let peripheral = MockPeripheral::bean("AA:BB");
        lightblue.handle_advertisement(bean_advertisement(&peripheral)).await;
        let device = lightblue.device(&DeviceAddress::from("AA:BB")).await.unwrap();

        lightblue.start_scanning(None, None).await.unwrap();
        let result = lightblue.upload_sketch(device, vec![0; 8], "blink", false).await;

        assert!(matches!(result, Err(LightBlueError::SketchUpload(_))));
        assert!(!lightblue.is_scanning());
        assert!(!radio.is_scanning());
    }

    #[tokio::test]
    async fn test_update_firmware_delegates() {
        let firmware = MockFirmwareUpdater::new();
        let lightblue = LightBlue::builder(MockRadio::new())
            .with_firmware_updater(firmware.clone())
            .build();
        let peripheral = MockPeripheral::bean("AA:BB");
        lightblue.handle_advertisement(bean_advertisement(&peripheral)).await;
        let device = lightblue.device(&DeviceAddress::from("AA:BB")).await.unwrap();

        lightblue
            .update_firmware(device.clone(), vec![FirmwareImage::new("img", vec![1, 2])], true)
            .await
            .unwrap();
        assert_eq!(firmware.begun(), vec![(device.address().clone(), 1, true)]);
        assert!(firmware.is_in_progress(&device));
    }
}
