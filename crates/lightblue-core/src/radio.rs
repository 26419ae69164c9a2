//! Radio binding seam
//!
//! The lifecycle manager never talks to a Bluetooth stack directly. A binding
//! (btleplug in `lightblue-ble`, the in-memory [`crate::mock`] radio in tests)
//! implements [`Radio`] for the adapter and [`Peripheral`] for each remote
//! device it reports.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::device::DeviceAddress;
use crate::error::Result;

// ----------------------------------------------------------------------------
// Radio State and Events
// ----------------------------------------------------------------------------

/// Power state of the local adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Unknown,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    /// Scanning may only start in this state
    pub fn is_ready(self) -> bool {
        self == RadioState::PoweredOn
    }
}

/// Live connection state of a remote peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected_or_connecting(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Connecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// A single advertisement as reported by the radio
#[derive(Clone)]
pub struct Advertisement {
    pub address: DeviceAddress,
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub peripheral: Arc<dyn Peripheral>,
}

impl Advertisement {
    /// Advertised name, empty when the peripheral did not include one
    pub fn name(&self) -> String {
        self.local_name.clone().unwrap_or_default()
    }
}

impl fmt::Debug for Advertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Advertisement")
            .field("address", &self.address)
            .field("local_name", &self.local_name)
            .field("service_uuids", &self.service_uuids)
            .finish_non_exhaustive()
    }
}

/// Events emitted by the radio binding
#[derive(Debug, Clone)]
pub enum RadioEvent {
    Advertisement(Advertisement),
    StateChanged(RadioState),
}

pub type RadioEventStream = Pin<Box<dyn Stream<Item = RadioEvent> + Send>>;

// ----------------------------------------------------------------------------
// GATT Model
// ----------------------------------------------------------------------------

/// Characteristic capabilities advertised by the peripheral
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

/// Characteristic as enumerated on a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// Service and its characteristics as enumerated on a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// Value pushed by the peripheral on a subscribed characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

// ----------------------------------------------------------------------------
// Binding Traits
// ----------------------------------------------------------------------------

/// Local adapter: scanning and the advertisement event stream
#[async_trait]
pub trait Radio: Send + Sync {
    /// Current adapter power state
    async fn state(&self) -> RadioState;

    /// Start scanning for all peripherals, reporting duplicate advertisements
    async fn start_scan(&self) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    /// Stream of advertisements and adapter state changes
    async fn events(&self) -> Result<RadioEventStream>;
}

/// Connection handle for one remote peripheral
#[async_trait]
pub trait Peripheral: Send + Sync {
    fn address(&self) -> DeviceAddress;

    /// Queried live; never cached by callers
    async fn state(&self) -> ConnectionState;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Enumerate all services and characteristics on the live connection
    async fn discover_services(&self) -> Result<Vec<GattService>>;

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    async fn write(&self, characteristic: Uuid, data: &[u8], kind: WriteKind) -> Result<()>;

    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Notifications for every subscribed characteristic
    async fn notifications(&self) -> Result<NotificationStream>;
}
