//! Firmware and sketch transfer collaborators
//!
//! The OAD firmware transfer and sketch upload protocols live outside the
//! lifecycle manager. It only needs to start them, ask whether an update is
//! in flight, and resume one after the device reconnects mid-update.

use std::sync::Arc;

use async_trait::async_trait;

use crate::device::Device;
use crate::error::{LightBlueError, Result};

/// One firmware image of an update bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub name: String,
    pub data: Vec<u8>,
}

impl FirmwareImage {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Over-the-air firmware updater
#[async_trait]
pub trait FirmwareUpdater: Send + Sync {
    /// Whether an update targeting `device` is underway
    fn is_in_progress(&self, device: &Device) -> bool;

    async fn begin_update(
        &self,
        device: Arc<Device>,
        bundle: Vec<FirmwareImage>,
        force: bool,
    ) -> Result<()>;

    /// Pick up the in-flight update after a reconnect
    async fn continue_update(&self) -> Result<()>;

    /// Forget any in-flight update
    fn reset_state(&self);
}

/// Arduino sketch uploader
#[async_trait]
pub trait SketchUploader: Send + Sync {
    async fn begin_upload(
        &self,
        device: Arc<Device>,
        sketch: Vec<u8>,
        name: String,
        prompt_user: bool,
    ) -> Result<()>;
}

/// Updater used when none is configured; never reports an update in progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFirmwareUpdater;

#[async_trait]
impl FirmwareUpdater for NoFirmwareUpdater {
    fn is_in_progress(&self, _device: &Device) -> bool {
        false
    }

    async fn begin_update(
        &self,
        _device: Arc<Device>,
        _bundle: Vec<FirmwareImage>,
        _force: bool,
    ) -> Result<()> {
        Err(LightBlueError::FirmwareUpdate(
            "no firmware updater configured".to_string(),
        ))
    }

    async fn continue_update(&self) -> Result<()> {
        Ok(())
    }

    fn reset_state(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoSketchUploader;

#[async_trait]
impl SketchUploader for NoSketchUploader {
    async fn begin_upload(
        &self,
        _device: Arc<Device>,
        _sketch: Vec<u8>,
        _name: String,
        _prompt_user: bool,
    ) -> Result<()> {
        Err(LightBlueError::SketchUpload(
            "no sketch uploader configured".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LightBlueConfig;
    use crate::mock::{advertisement, MockPeripheral};

    #[tokio::test]
    async fn test_defaults_refuse_transfers() {
        let peripheral = MockPeripheral::bean("AA:BB");
        let device = Arc::new(Device::from_advertisement(
            &advertisement(&peripheral, "bean", &[]),
            &LightBlueConfig::default(),
        ));

        assert!(!NoFirmwareUpdater.is_in_progress(&device));
        tokio_test::assert_err!(
            NoFirmwareUpdater
                .begin_update(device.clone(), vec![FirmwareImage::new("a", vec![1])], false)
                .await
        );
        tokio_test::assert_ok!(NoFirmwareUpdater.continue_update().await);
        assert!(matches!(
            NoSketchUploader
                .begin_upload(device, vec![], "blink".to_string(), false)
                .await,
            Err(LightBlueError::SketchUpload(_))
        ));
    }
}
