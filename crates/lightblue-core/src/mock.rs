//! In-memory radio binding
//!
//! [`MockRadio`] and [`MockPeripheral`] implement the binding traits without
//! any Bluetooth stack, with scripted failures and a Bean that answers serial
//! commands. Used by the test suites and handy for embedding applications.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::device::{Device, DeviceAddress};
use crate::error::{LightBlueError, Result};
use crate::firmware::{FirmwareImage, FirmwareUpdater};
use crate::radio::{
    Advertisement, CharacteristicProperties, ConnectionState, GattCharacteristic, GattService,
    Notification, NotificationStream, Peripheral, Radio, RadioEvent, RadioEventStream, RadioState,
    WriteKind,
};
use crate::serial::{Reassembler, SerialMessage};
use crate::uuids::*;

/// Advertisement from `peripheral` with the given name and services
pub fn advertisement(
    peripheral: &Arc<MockPeripheral>,
    name: &str,
    service_uuids: &[Uuid],
) -> Advertisement {
    Advertisement {
        address: peripheral.address(),
        local_name: (!name.is_empty()).then(|| name.to_string()),
        service_uuids: service_uuids.to_vec(),
        peripheral: peripheral.clone(),
    }
}

// ----------------------------------------------------------------------------
// Mock Radio
// ----------------------------------------------------------------------------

pub struct MockRadio {
    state: Mutex<RadioState>,
    scanning: AtomicBool,
    start_delay: Mutex<Duration>,
    start_requests: AtomicUsize,
    stop_requests: AtomicUsize,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RadioEvent>>>,
}

impl MockRadio {
    /// A powered-on radio
    pub fn new() -> Arc<Self> {
        Self::with_state(RadioState::PoweredOn)
    }

    pub fn with_state(state: RadioState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            scanning: AtomicBool::new(false),
            start_delay: Mutex::new(Duration::ZERO),
            start_requests: AtomicUsize::new(0),
            stop_requests: AtomicUsize::new(0),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Change the adapter state and report it on the event stream
    pub fn set_state(&self, state: RadioState) {
        *self.state.lock() = state;
        if !state.is_ready() {
            self.scanning.store(false, Ordering::SeqCst);
        }
        self.emit(RadioEvent::StateChanged(state));
    }

    /// Make every scan start take `delay` before the adapter reports back
    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = delay;
    }

    pub fn advertise(&self, advertisement: Advertisement) {
        self.emit(RadioEvent::Advertisement(advertisement));
    }

    fn emit(&self, event: RadioEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn start_requests(&self) -> usize {
        self.start_requests.load(Ordering::SeqCst)
    }

    pub fn stop_requests(&self) -> usize {
        self.stop_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Radio for MockRadio {
    async fn state(&self) -> RadioState {
        *self.state.lock()
    }

    async fn start_scan(&self) -> Result<()> {
        if !self.state.lock().is_ready() {
            return Err(LightBlueError::Radio("adapter is not powered on".to_string()));
        }
        self.start_requests.fetch_add(1, Ordering::SeqCst);
        let delay = *self.start_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.stop_requests.fetch_add(1, Ordering::SeqCst);
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn events(&self) -> Result<RadioEventStream> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().push(tx);
        Ok(Box::pin(rx))
    }
}

// ----------------------------------------------------------------------------
// Mock Peripheral
// ----------------------------------------------------------------------------

type ConnectHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Script {
    connect_error: Option<String>,
    disconnect_error: Option<String>,
    discovery_error: Option<String>,
    subscribe_error: Option<String>,
    connect_delay: Duration,
    on_connect: Option<ConnectHook>,
}

pub struct MockPeripheral {
    address: DeviceAddress,
    state: Mutex<ConnectionState>,
    services: Mutex<Vec<GattService>>,
    values: Mutex<HashMap<Uuid, Vec<u8>>>,
    script: Mutex<Script>,
    connect_requests: AtomicUsize,
    disconnect_requests: AtomicUsize,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    sent: Mutex<Vec<SerialMessage>>,
    subscriptions: Mutex<HashSet<Uuid>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<Notification>>>,
    replies: Mutex<HashMap<u16, SerialMessage>>,
    reassembler: Mutex<Reassembler>,
}

fn characteristic(uuid: Uuid, properties: CharacteristicProperties) -> GattCharacteristic {
    GattCharacteristic { uuid, properties }
}

fn readable() -> CharacteristicProperties {
    CharacteristicProperties {
        read: true,
        ..Default::default()
    }
}

impl MockPeripheral {
    /// A peripheral with no services
    pub fn new(address: &str) -> Arc<Self> {
        Arc::new(Self {
            address: DeviceAddress::from(address),
            state: Mutex::new(ConnectionState::Disconnected),
            services: Mutex::new(Vec::new()),
            values: Mutex::new(HashMap::new()),
            script: Mutex::new(Script::default()),
            connect_requests: AtomicUsize::new(0),
            disconnect_requests: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashSet::new()),
            listeners: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            reassembler: Mutex::new(Reassembler::new()),
        })
    }

    /// A peripheral exposing the full Bean GATT table
    pub fn bean(address: &str) -> Arc<Self> {
        let peripheral = Self::new(address);
        peripheral.set_services(vec![
            GattService {
                uuid: DEVICE_INFORMATION_SERVICE_UUID,
                characteristics: vec![
                    characteristic(MANUFACTURER_NAME_CHARACTERISTIC_UUID, readable()),
                    characteristic(MODEL_NUMBER_CHARACTERISTIC_UUID, readable()),
                    characteristic(FIRMWARE_REVISION_CHARACTERISTIC_UUID, readable()),
                ],
            },
            GattService {
                uuid: BATTERY_SERVICE_UUID,
                characteristics: vec![characteristic(
                    BATTERY_LEVEL_CHARACTERISTIC_UUID,
                    CharacteristicProperties {
                        read: true,
                        notify: true,
                        ..Default::default()
                    },
                )],
            },
            GattService {
                uuid: SERIAL_TRANSPORT_SERVICE_UUID,
                characteristics: vec![characteristic(
                    SERIAL_TRANSPORT_CHARACTERISTIC_UUID,
                    CharacteristicProperties {
                        write_without_response: true,
                        notify: true,
                        ..Default::default()
                    },
                )],
            },
            GattService {
                uuid: OAD_SERVICE_UUID,
                characteristics: vec![
                    characteristic(
                        OAD_IDENTIFY_CHARACTERISTIC_UUID,
                        CharacteristicProperties {
                            write: true,
                            notify: true,
                            ..Default::default()
                        },
                    ),
                    characteristic(
                        OAD_BLOCK_CHARACTERISTIC_UUID,
                        CharacteristicProperties {
                            write_without_response: true,
                            notify: true,
                            ..Default::default()
                        },
                    ),
                ],
            },
        ]);
        peripheral.set_value(MANUFACTURER_NAME_CHARACTERISTIC_UUID, b"Punch Through Design");
        peripheral.set_value(MODEL_NUMBER_CHARACTERISTIC_UUID, b"Bean");
        peripheral.set_value(FIRMWARE_REVISION_CHARACTERISTIC_UUID, b"201602290000\0");
        peripheral.set_value(BATTERY_LEVEL_CHARACTERISTIC_UUID, &[100]);
        peripheral
    }

    pub fn set_services(&self, services: Vec<GattService>) {
        *self.services.lock() = services;
    }

    pub fn remove_characteristic(&self, service: Uuid, characteristic: Uuid) {
        for gatt in self.services.lock().iter_mut().filter(|s| s.uuid == service) {
            gatt.characteristics.retain(|c| c.uuid != characteristic);
        }
    }

    pub fn set_value(&self, characteristic: Uuid, value: &[u8]) {
        self.values.lock().insert(characteristic, value.to_vec());
    }

    pub fn fail_connect(&self, reason: &str) {
        self.script.lock().connect_error = Some(reason.to_string());
    }

    pub fn fail_disconnect(&self, reason: &str) {
        self.script.lock().disconnect_error = Some(reason.to_string());
    }

    pub fn fail_discovery(&self, reason: &str) {
        self.script.lock().discovery_error = Some(reason.to_string());
    }

    pub fn fail_subscribe(&self, reason: &str) {
        self.script.lock().subscribe_error = Some(reason.to_string());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.script.lock().connect_delay = delay;
    }

    /// Run `hook` while a connect is in flight
    pub fn on_connect(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.script.lock().on_connect = Some(Arc::new(hook));
    }

    /// Simulate the link dropping
    pub fn drop_link(&self) {
        *self.state.lock() = ConnectionState::Disconnected;
    }

    /// Answer every serial message carrying `command` with `reply`
    pub fn reply_to(&self, command: u16, reply: SerialMessage) {
        self.replies.lock().insert(command, reply);
    }

    /// Push an unsolicited serial message to the host
    pub fn push_serial(&self, message: &SerialMessage) -> Result<()> {
        for packet in message.to_packets(0)? {
            self.notify(SERIAL_TRANSPORT_CHARACTERISTIC_UUID, packet);
        }
        Ok(())
    }

    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        let notification = Notification {
            characteristic,
            value,
        };
        self.listeners
            .lock()
            .retain(|tx| tx.unbounded_send(notification.clone()).is_ok());
    }

    pub fn connect_requests(&self) -> usize {
        self.connect_requests.load(Ordering::SeqCst)
    }

    pub fn disconnect_requests(&self) -> usize {
        self.disconnect_requests.load(Ordering::SeqCst)
    }

    /// Raw characteristic writes, oldest first
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.writes.lock().clone()
    }

    /// Serial messages reassembled from writes, oldest first
    pub fn sent_messages(&self) -> Vec<SerialMessage> {
        self.sent.lock().clone()
    }

    pub fn is_subscribed(&self, characteristic: &Uuid) -> bool {
        self.subscriptions.lock().contains(characteristic)
    }

    fn handle_serial_write(&self, packet: &[u8]) -> Result<()> {
        let message = self
            .reassembler
            .lock()
            .push(packet)
            .map_err(LightBlueError::radio)?;
        let Some(message) = message else {
            return Ok(());
        };

        let reply = self.replies.lock().get(&message.command).cloned();
        self.sent.lock().push(message);
        if let Some(reply) = reply {
            self.push_serial(&reply)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Peripheral for MockPeripheral {
    fn address(&self) -> DeviceAddress {
        self.address.clone()
    }

    async fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn connect(&self) -> Result<()> {
        self.connect_requests.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = ConnectionState::Connecting;

        let (delay, hook, error) = {
            let script = self.script.lock();
            (
                script.connect_delay,
                script.on_connect.clone(),
                script.connect_error.clone(),
            )
        };
        if let Some(hook) = hook {
            hook();
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match error {
            Some(reason) => {
                *self.state.lock() = ConnectionState::Disconnected;
                Err(LightBlueError::Radio(reason))
            }
            None => {
                *self.state.lock() = ConnectionState::Connected;
                Ok(())
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_requests.fetch_add(1, Ordering::SeqCst);
        let error = self.script.lock().disconnect_error.clone();
        if let Some(reason) = error {
            return Err(LightBlueError::Radio(reason));
        }
        *self.state.lock() = ConnectionState::Disconnected;
        self.listeners.lock().clear();
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        if *self.state.lock() != ConnectionState::Connected {
            return Err(LightBlueError::NotConnected {
                address: self.address.clone(),
            });
        }
        let error = self.script.lock().discovery_error.clone();
        if let Some(reason) = error {
            return Err(LightBlueError::Radio(reason));
        }
        Ok(self.services.lock().clone())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        self.values
            .lock()
            .get(&characteristic)
            .cloned()
            .ok_or(LightBlueError::CharacteristicNotFound { characteristic })
    }

    async fn write(&self, characteristic: Uuid, data: &[u8], _kind: WriteKind) -> Result<()> {
        self.writes.lock().push((characteristic, data.to_vec()));
        if characteristic == SERIAL_TRANSPORT_CHARACTERISTIC_UUID {
            self.handle_serial_write(data)?;
        }
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let error = self.script.lock().subscribe_error.clone();
        if let Some(reason) = error {
            return Err(LightBlueError::Radio(reason));
        }
        self.subscriptions.lock().insert(characteristic);
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let (tx, rx) = mpsc::unbounded();
        self.listeners.lock().push(tx);
        Ok(Box::pin(rx))
    }
}

// ----------------------------------------------------------------------------
// Mock Firmware Updater
// ----------------------------------------------------------------------------

/// Firmware updater that records calls instead of transferring images
#[derive(Default)]
pub struct MockFirmwareUpdater {
    in_progress: Mutex<HashSet<DeviceAddress>>,
    begun: Mutex<Vec<(DeviceAddress, usize, bool)>>,
    continue_calls: AtomicUsize,
    reset_calls: AtomicUsize,
}

impl MockFirmwareUpdater {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_in_progress(&self, address: &DeviceAddress) {
        self.in_progress.lock().insert(address.clone());
    }

    /// Updates started as (address, image count, force)
    pub fn begun(&self) -> Vec<(DeviceAddress, usize, bool)> {
        self.begun.lock().clone()
    }

    pub fn continue_calls(&self) -> usize {
        self.continue_calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) -> usize {
        self.reset_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FirmwareUpdater for MockFirmwareUpdater {
    fn is_in_progress(&self, device: &Device) -> bool {
        self.in_progress.lock().contains(device.address())
    }

    async fn begin_update(
        &self,
        device: Arc<Device>,
        bundle: Vec<FirmwareImage>,
        force: bool,
    ) -> Result<()> {
        self.begun
            .lock()
            .push((device.address().clone(), bundle.len(), force));
        self.in_progress.lock().insert(device.address().clone());
        Ok(())
    }

    async fn continue_update(&self) -> Result<()> {
        self.continue_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reset_state(&self) {
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
        self.in_progress.lock().clear();
    }
}
