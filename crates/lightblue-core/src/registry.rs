//! Device registry
//!
//! Exactly one [`Device`] exists per address. Devices live in an append-only
//! slot list; the address index points into it, so enumeration order is the
//! order devices were first seen.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::LightBlueConfig;
use crate::device::{Device, DeviceAddress, DeviceKind};
use crate::radio::Advertisement;

/// What an advertisement did to the registry
#[derive(Debug, Clone)]
pub enum Observation {
    /// First sighting of a tracked device
    NewDevice(Arc<Device>),
    /// A tracked device was refreshed in place
    UpdatedExisting {
        device: Arc<Device>,
        /// Auto-reconnect is enabled and the device is not connected or connecting
        reconnect: bool,
    },
    /// Not a kind this registry tracks
    Ignored,
}

/// Registry change made by an advertisement, before any link state is read
#[derive(Debug, Clone)]
pub enum Sighting {
    New(Arc<Device>),
    Known(Arc<Device>),
    Ignored,
}

impl Sighting {
    /// Resolve into an [`Observation`]
    ///
    /// Queries the radio for known devices with auto-reconnect enabled, so
    /// call it without holding the registry lock.
    pub async fn into_observation(self) -> Observation {
        match self {
            Sighting::New(device) => Observation::NewDevice(device),
            Sighting::Known(device) => {
                let reconnect =
                    device.auto_reconnect() && !device.is_connected_or_connecting().await;
                if reconnect {
                    debug!("{} advertised while disconnected", device);
                }
                Observation::UpdatedExisting { device, reconnect }
            }
            Sighting::Ignored => Observation::Ignored,
        }
    }
}

/// Address-keyed store of every device seen so far
#[derive(Debug)]
pub struct Registry {
    slots: Vec<Arc<Device>>,
    index: HashMap<DeviceAddress, usize>,
    config: LightBlueConfig,
}

impl Registry {
    pub fn new(config: LightBlueConfig) -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
            config,
        }
    }

    /// Device kind an advertisement describes
    pub fn classify(advertisement: &Advertisement) -> DeviceKind {
        DeviceKind::from_service_uuids(&advertisement.service_uuids)
    }

    fn tracks(&self, kind: DeviceKind) -> bool {
        match kind {
            DeviceKind::TargetProduct => true,
            DeviceKind::Generic => self.config.discover_generic_devices,
        }
    }

    /// Apply an advertisement to the store
    ///
    /// A known address refreshes the existing device rather than replacing it.
    pub fn record(&mut self, advertisement: &Advertisement) -> Sighting {
        if let Some(&slot) = self.index.get(&advertisement.address) {
            let device = self.slots[slot].clone();
            device.refresh(advertisement);
            return Sighting::Known(device);
        }

        let kind = Self::classify(advertisement);
        if !self.tracks(kind) {
            return Sighting::Ignored;
        }

        let device = Arc::new(Device::from_advertisement(advertisement, &self.config));
        info!("Found new {}: {}", kind, device);
        self.index
            .insert(advertisement.address.clone(), self.slots.len());
        self.slots.push(device.clone());
        Sighting::New(device)
    }

    /// Record an advertisement and resolve the outcome
    pub async fn observe(&mut self, advertisement: &Advertisement) -> Observation {
        self.record(advertisement).into_observation().await
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<Arc<Device>> {
        self.index.get(address).map(|&slot| self.slots[slot].clone())
    }

    /// Devices in the order they were first seen
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.slots.clone()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Forget every device, returning them
    pub fn clear(&mut self) -> Vec<Arc<Device>> {
        self.index.clear();
        std::mem::take(&mut self.slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{advertisement, MockPeripheral};
    use crate::uuids::SERIAL_TRANSPORT_SERVICE_UUID;

    #[tokio::test]
    async fn test_same_address_same_instance() {
        let mut registry = Registry::new(LightBlueConfig::default());
        let peripheral = MockPeripheral::bean("AA:BB");

        let first = match registry
            .observe(&advertisement(&peripheral, "Bean", &[SERIAL_TRANSPORT_SERVICE_UUID]))
            .await
        {
            Observation::NewDevice(device) => device,
            other => panic!("unexpected observation: {:?}", other),
        };

        let second = match registry
            .observe(&advertisement(&peripheral, "Bean2", &[SERIAL_TRANSPORT_SERVICE_UUID]))
            .await
        {
            Observation::UpdatedExisting { device, reconnect } => {
                assert!(!reconnect);
                device
            }
            other => panic!("unexpected observation: {:?}", other),
        };

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "Bean2");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_generic_devices_ignored_by_default() {
        let mut registry = Registry::new(LightBlueConfig::default());
        let peripheral = MockPeripheral::new("CC:DD");
        let adv = advertisement(&peripheral, "Thing", &[]);

        assert_eq!(Registry::classify(&adv), DeviceKind::Generic);
        assert!(matches!(registry.observe(&adv).await, Observation::Ignored));
        assert!(registry.get(&DeviceAddress::from("CC:DD")).is_none());

        let mut registry = Registry::new(LightBlueConfig::default().with_generic_devices(true));
        assert!(matches!(
            registry.observe(&adv).await,
            Observation::NewDevice(_)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_signal() {
        let mut registry = Registry::new(LightBlueConfig::default());
        let peripheral = MockPeripheral::bean("AA:BB");
        let adv = advertisement(&peripheral, "Bean", &[SERIAL_TRANSPORT_SERVICE_UUID]);

        registry.observe(&adv).await;
        let device = registry.get(&DeviceAddress::from("AA:BB")).unwrap();
        device.set_auto_reconnect(true);

        assert!(matches!(
            registry.observe(&adv).await,
            Observation::UpdatedExisting { reconnect: true, .. }
        ));

        device.connect().await.unwrap();
        assert!(matches!(
            registry.observe(&adv).await,
            Observation::UpdatedExisting { reconnect: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_record_defers_link_query() {
        let mut registry = Registry::new(LightBlueConfig::default());
        let peripheral = MockPeripheral::bean("AA:BB");
        let adv = advertisement(&peripheral, "Bean", &[SERIAL_TRANSPORT_SERVICE_UUID]);

        let device = match registry.record(&adv) {
            Sighting::New(device) => device,
            other => panic!("unexpected sighting: {:?}", other),
        };
        device.set_auto_reconnect(true);

        let sighting = registry.record(&adv);
        assert!(matches!(&sighting, Sighting::Known(known) if Arc::ptr_eq(known, &device)));
        assert_eq!(registry.len(), 1);

        drop(registry);
        assert!(matches!(
            sighting.into_observation().await,
            Observation::UpdatedExisting { reconnect: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_enumeration_order_and_clear() {
        let mut registry = Registry::new(LightBlueConfig::default());
        for address in ["03", "01", "02"] {
            let peripheral = MockPeripheral::bean(address);
            registry
                .observe(&advertisement(&peripheral, "Bean", &[SERIAL_TRANSPORT_SERVICE_UUID]))
                .await;
        }

        let order: Vec<String> = registry
            .devices()
            .iter()
            .map(|d| d.address().to_string())
            .collect();
        assert_eq!(order, ["03", "01", "02"]);

        assert_eq!(registry.clear().len(), 3);
        assert!(registry.is_empty());
        assert!(registry.get(&DeviceAddress::from("01")).is_none());
    }
}
