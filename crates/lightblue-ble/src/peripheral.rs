//! Connection handle for one btleplug peripheral

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use btleplug::api::{BDAddr, CharPropFlags, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral as PlatformPeripheral;
use futures::stream::StreamExt;
use lightblue_core::radio::{
    CharacteristicProperties, ConnectionState, GattCharacteristic, GattService, Notification,
    NotificationStream, Peripheral, WriteKind,
};
use lightblue_core::{DeviceAddress, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::BleError;

// ----------------------------------------------------------------------------
// Peripheral Wrapper
// ----------------------------------------------------------------------------

/// btleplug peripheral behind the core [`Peripheral`] trait
pub struct BlePeripheral {
    inner: PlatformPeripheral,
    address: DeviceAddress,
    connecting: AtomicBool,
}

impl BlePeripheral {
    pub fn new(inner: PlatformPeripheral) -> Self {
        let address = address_of(&inner);
        Self {
            inner,
            address,
            connecting: AtomicBool::new(false),
        }
    }

    fn find_characteristic(&self, uuid: Uuid) -> std::result::Result<Characteristic, BleError> {
        self.inner
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(BleError::CharacteristicNotFound {
                characteristic: uuid,
            })
    }
}

/// MAC address where the platform exposes one, otherwise the platform id
fn address_of(peripheral: &PlatformPeripheral) -> DeviceAddress {
    let address = peripheral.address();
    if address == BDAddr::default() {
        DeviceAddress::new(format!("{:?}", peripheral.id()))
    } else {
        DeviceAddress::new(address.to_string())
    }
}

fn properties_of(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY) || flags.contains(CharPropFlags::INDICATE),
    }
}

fn write_type(kind: WriteKind) -> WriteType {
    match kind {
        WriteKind::WithResponse => WriteType::WithResponse,
        WriteKind::WithoutResponse => WriteType::WithoutResponse,
    }
}

#[async_trait]
impl Peripheral for BlePeripheral {
    fn address(&self) -> DeviceAddress {
        self.address.clone()
    }

    async fn state(&self) -> ConnectionState {
        match self.inner.is_connected().await {
            Ok(true) => ConnectionState::Connected,
            Ok(false) if self.connecting.load(Ordering::SeqCst) => ConnectionState::Connecting,
            Ok(false) => ConnectionState::Disconnected,
            Err(e) => {
                warn!("Failed to query connection state of {}: {}", self.address, e);
                ConnectionState::Disconnected
            }
        }
    }

    async fn connect(&self) -> Result<()> {
        self.connecting.store(true, Ordering::SeqCst);
        let result = self.inner.connect().await;
        self.connecting.store(false, Ordering::SeqCst);
        result.map_err(BleError::from)?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await.map_err(BleError::from)?;
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        self.inner
            .discover_services()
            .await
            .map_err(BleError::from)?;

        let services: Vec<GattService> = self
            .inner
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| GattCharacteristic {
                        uuid: c.uuid,
                        properties: properties_of(c.properties),
                    })
                    .collect(),
            })
            .collect();
        debug!("Discovered {} services on {}", services.len(), self.address);
        Ok(services)
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.find_characteristic(characteristic)?;
        Ok(self
            .inner
            .read(&characteristic)
            .await
            .map_err(BleError::from)?)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8], kind: WriteKind) -> Result<()> {
        let characteristic = self.find_characteristic(characteristic)?;
        self.inner
            .write(&characteristic, data, write_type(kind))
            .await
            .map_err(BleError::from)?;
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let characteristic = self.find_characteristic(characteristic)?;
        self.inner
            .subscribe(&characteristic)
            .await
            .map_err(BleError::from)?;
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let stream = self
            .inner
            .notifications()
            .await
            .map_err(|e| BleError::NotificationStreamFailed(e.to_string()))?;

        Ok(Box::pin(stream.map(|notification| Notification {
            characteristic: notification.uuid,
            value: notification.value,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_flags() {
        let properties = properties_of(CharPropFlags::WRITE_WITHOUT_RESPONSE | CharPropFlags::NOTIFY);
        assert!(properties.write_without_response);
        assert!(properties.notify);
        assert!(!properties.read);
        assert!(!properties.write);

        assert!(properties_of(CharPropFlags::INDICATE).notify);
    }

    #[test]
    fn test_write_type_mapping() {
        assert_eq!(write_type(WriteKind::WithResponse), WriteType::WithResponse);
        assert_eq!(write_type(WriteKind::WithoutResponse), WriteType::WithoutResponse);
    }
}
