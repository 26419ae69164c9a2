//! Device model
//!
//! A [`Device`] is the single live object for one remote peripheral. The
//! registry owns it and refreshes it in place on every advertisement, so any
//! `Arc<Device>` handed out earlier keeps observing the current name and
//! connection handle.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LightBlueConfig;
use crate::error::{LightBlueError, Result};
use crate::radio::{Advertisement, ConnectionState, Peripheral};
use crate::serial::{
    commands, AccelerometerReading, BleConfig, SketchMetadata, LOCAL_NAME_LEN,
};
use crate::service::Service;
use crate::uuids::{
    BATTERY_SERVICE_UUID, DEVICE_INFORMATION_SERVICE_UUID, OAD_SERVICE_UUID,
    SERIAL_TRANSPORT_SERVICE_UUID,
};

/// Largest serial payload sent in one message
const SERIAL_CHUNK_SIZE: usize = 64;

// ----------------------------------------------------------------------------
// Identity and Classification
// ----------------------------------------------------------------------------

/// Stable radio identifier of a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for DeviceAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something a device can be asked to do through one of its services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Capability {
    DeviceInformation,
    Battery,
    SerialTransport,
    Oad,
}

impl Capability {
    /// Service that provides this capability
    pub fn service_uuid(self) -> Uuid {
        match self {
            Capability::DeviceInformation => DEVICE_INFORMATION_SERVICE_UUID,
            Capability::Battery => BATTERY_SERVICE_UUID,
            Capability::SerialTransport => SERIAL_TRANSPORT_SERVICE_UUID,
            Capability::Oad => OAD_SERVICE_UUID,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::DeviceInformation => "device information",
            Capability::Battery => "battery",
            Capability::SerialTransport => "serial transport",
            Capability::Oad => "OAD",
        };
        f.write_str(name)
    }
}

/// Device variant, fixed when the device is first seen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceKind {
    /// Any BLE peripheral
    Generic,
    /// A LightBlue Bean
    TargetProduct,
}

impl DeviceKind {
    /// Beans advertise the serial transport service; nothing else does
    pub fn from_service_uuids(service_uuids: &[Uuid]) -> Self {
        if service_uuids.contains(&SERIAL_TRANSPORT_SERVICE_UUID) {
            DeviceKind::TargetProduct
        } else {
            DeviceKind::Generic
        }
    }

    pub fn capabilities(self) -> &'static [Capability] {
        match self {
            DeviceKind::Generic => &[Capability::DeviceInformation],
            DeviceKind::TargetProduct => &[
                Capability::DeviceInformation,
                Capability::Battery,
                Capability::SerialTransport,
                Capability::Oad,
            ],
        }
    }

    pub fn supports(self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Generic => write!(f, "BLE device"),
            DeviceKind::TargetProduct => write!(f, "LightBlue Bean"),
        }
    }
}

/// Serializable snapshot of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub name: String,
    pub address: DeviceAddress,
    pub device_type: DeviceKind,
}

// ----------------------------------------------------------------------------
// Device
// ----------------------------------------------------------------------------

/// One remote peripheral and its discovered services
pub struct Device {
    address: DeviceAddress,
    kind: DeviceKind,
    name: RwLock<String>,
    advertised_services: RwLock<Vec<Uuid>>,
    peripheral: RwLock<Arc<dyn Peripheral>>,
    services: RwLock<HashMap<Uuid, Arc<Service>>>,
    auto_reconnect: AtomicBool,
    connection_timeout: Duration,
    command_timeout: Duration,
}

impl Device {
    /// Create a device from its first advertisement
    pub fn from_advertisement(advertisement: &Advertisement, config: &LightBlueConfig) -> Self {
        Self {
            address: advertisement.address.clone(),
            kind: DeviceKind::from_service_uuids(&advertisement.service_uuids),
            name: RwLock::new(advertisement.name()),
            advertised_services: RwLock::new(advertisement.service_uuids.clone()),
            peripheral: RwLock::new(advertisement.peripheral.clone()),
            services: RwLock::new(HashMap::new()),
            auto_reconnect: AtomicBool::new(false),
            connection_timeout: config.connection_timeout,
            command_timeout: config.command_timeout,
        }
    }

    /// Apply a later advertisement for the same address
    pub(crate) fn refresh(&self, advertisement: &Advertisement) {
        *self.name.write() = advertisement.name();
        *self.advertised_services.write() = advertisement.service_uuids.clone();
        *self.peripheral.write() = advertisement.peripheral.clone();
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn advertised_services(&self) -> Vec<Uuid> {
        self.advertised_services.read().clone()
    }

    fn peripheral(&self) -> Arc<dyn Peripheral> {
        self.peripheral.read().clone()
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        info!("Set reconnect for {}: {}", self.name(), enabled);
        self.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            name: self.name(),
            address: self.address.clone(),
            device_type: self.kind,
        }
    }

    /// Multi-line human readable description
    pub fn describe(&self) -> String {
        let mut out = format!("{}:\n", self.kind);
        out.push_str(&format!("    Name: {}\n", self.name()));
        out.push_str(&format!("    Address: {}\n", self.address));
        out.push_str("    Advertised Services:\n");
        let advertised = self.advertised_services();
        if advertised.is_empty() {
            out.push_str("        None\n");
        }
        for uuid in advertised {
            out.push_str(&format!("        {}\n", uuid.simple()));
        }
        out
    }

    // ------------------------------------------------------------------------
    // Connection Lifecycle
    // ------------------------------------------------------------------------

    /// Live connection state from the radio handle
    pub async fn state(&self) -> ConnectionState {
        self.peripheral().state().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    pub async fn is_connected_or_connecting(&self) -> bool {
        self.state().await.is_connected_or_connecting()
    }

    /// Connect to the device
    ///
    /// Succeeds without a radio request when already connected or connecting.
    /// Scanning must be stopped first; see [`crate::LightBlue::connect_to_device`].
    pub async fn connect(&self) -> Result<()> {
        info!("Connecting to device: {}", self);
        let peripheral = self.peripheral();

        match peripheral.state().await {
            ConnectionState::Connected => {
                info!("Already connected.");
                return Ok(());
            }
            ConnectionState::Connecting => {
                debug!("Connection to {} already in progress", self);
                return Ok(());
            }
            ConnectionState::Disconnected => {}
        }

        match timeout(self.connection_timeout, peripheral.connect()).await {
            Ok(Ok(())) => {
                info!("Connected to device: {}", self);
                Ok(())
            }
            Ok(Err(e)) => Err(LightBlueError::ConnectionFailed {
                address: self.address.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(LightBlueError::ConnectionTimeout {
                address: self.address.clone(),
            }),
        }
    }

    /// Tear down the connection; a no-op when already disconnected
    pub async fn disconnect(&self) -> Result<()> {
        let peripheral = self.peripheral();
        if peripheral.state().await == ConnectionState::Disconnected {
            return Ok(());
        }
        peripheral.disconnect().await?;
        info!("Disconnected from device: {}", self);
        Ok(())
    }

    /// Enumerate services on the live connection and set each one up
    ///
    /// Setups run concurrently. A failing setup does not affect the others;
    /// the first failure is returned once all of them have finished.
    pub async fn discover_services(&self) -> Result<()> {
        info!("Looking up services for device: {}", self);
        let peripheral = self.peripheral();

        let discovered = peripheral.discover_services().await.map_err(|e| {
            warn!("There was an error getting services: {}", e);
            LightBlueError::ServiceDiscoveryFailed {
                address: self.address.clone(),
                reason: e.to_string(),
            }
        })?;

        let services: Vec<Arc<Service>> = {
            let mut tracked = self.services.write();
            discovered
                .into_iter()
                .map(|gatt| {
                    let service = match tracked.get(&gatt.uuid) {
                        Some(existing) => Service::from_existing(existing, gatt, peripheral.clone()),
                        None => Service::from_discovered(gatt, peripheral.clone(), self.command_timeout),
                    };
                    let service = Arc::new(service);
                    tracked.insert(service.uuid(), service.clone());
                    service
                })
                .collect()
        };

        let results = join_all(services.iter().map(|service| service.setup())).await;

        let mut first_error = None;
        for (service, result) in services.iter().zip(results) {
            match result {
                Ok(()) => info!("Service setup successfully: {}", service.name()),
                Err(e) => {
                    warn!("Service setup failed: {} ({})", service.name(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        info!("All services have been setup!");

        first_error.map_or(Ok(()), Err)
    }

    /// Every tracked service, set up or not
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.services.read().values().cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Capability Accessors
    // ------------------------------------------------------------------------

    fn lookup_service(&self, capability: Capability) -> Result<Arc<Service>> {
        if !self.kind.supports(capability) {
            return Err(LightBlueError::Unsupported {
                address: self.address.clone(),
                capability,
            });
        }

        let uuid = capability.service_uuid();
        let service = self.services.read().get(&uuid).cloned();
        match service {
            Some(service) if service.is_setup() => Ok(service),
            Some(_) => Err(LightBlueError::ServiceNotReady { service: uuid }),
            None => {
                info!("No such service: {}", capability);
                Err(LightBlueError::ServiceAbsent {
                    address: self.address.clone(),
                    capability,
                })
            }
        }
    }

    pub fn device_information_service(&self) -> Result<Arc<Service>> {
        self.lookup_service(Capability::DeviceInformation)
    }

    pub fn battery_service(&self) -> Result<Arc<Service>> {
        self.lookup_service(Capability::Battery)
    }

    pub fn serial_transport_service(&self) -> Result<Arc<Service>> {
        self.lookup_service(Capability::SerialTransport)
    }

    pub fn oad_service(&self) -> Result<Arc<Service>> {
        self.lookup_service(Capability::Oad)
    }

    // ------------------------------------------------------------------------
    // Bean Commands
    // ------------------------------------------------------------------------

    pub async fn set_led(&self, red: u8, green: u8, blue: u8) -> Result<()> {
        self.serial_transport_service()?
            .send_command(commands::CC_LED_WRITE_ALL, &[red, green, blue])
            .await
    }

    pub async fn read_accelerometer(&self) -> Result<AccelerometerReading> {
        let reply = self
            .serial_transport_service()?
            .request(commands::CC_ACCEL_READ, &[])
            .await?;
        AccelerometerReading::decode(&reply.payload)
    }

    pub async fn read_sketch_info(&self) -> Result<SketchMetadata> {
        let reply = self
            .serial_transport_service()?
            .request(commands::BL_GET_META, &[])
            .await?;
        SketchMetadata::decode(&reply.payload)
    }

    pub async fn read_ble_config(&self) -> Result<BleConfig> {
        let reply = self
            .serial_transport_service()?
            .request(commands::BT_GET_CONFIG, &[])
            .await?;
        BleConfig::decode(&reply.payload)
    }

    /// Write bytes to the Bean's serial port
    pub async fn send_serial(&self, data: &[u8]) -> Result<()> {
        let service = self.serial_transport_service()?;
        for chunk in data.chunks(SERIAL_CHUNK_SIZE) {
            service.send_command(commands::SERIAL_DATA, chunk).await?;
        }
        Ok(())
    }

    /// Bytes the Bean writes to its serial port
    pub fn subscribe_serial(&self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.serial_transport_service()?
            .subscribe(commands::SERIAL_DATA)
    }

    /// Change the advertised name
    pub async fn rename(&self, new_name: &str) -> Result<()> {
        if new_name.is_empty() || new_name.len() > LOCAL_NAME_LEN {
            return Err(LightBlueError::InvalidArgument(format!(
                "name must be 1 to {} bytes, got {}",
                LOCAL_NAME_LEN,
                new_name.len()
            )));
        }
        self.serial_transport_service()?
            .send_command(commands::BT_SET_LOCAL_NAME, new_name.as_bytes())
            .await
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.address)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("name", &self.name())
            .field("auto_reconnect", &self.auto_reconnect())
            .finish_non_exhaustive()
    }
}
