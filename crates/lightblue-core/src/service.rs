//! GATT service abstraction
//!
//! A [`Service`] wraps one service found during discovery. Its characteristic
//! bindings are resolved by [`Service::setup`]; until then every capability
//! operation refuses with [`LightBlueError::ServiceNotReady`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LightBlueError, Result};
use crate::radio::{GattCharacteristic, GattService, Peripheral, WriteKind};
use crate::serial::{Reassembler, SerialMessage};
use crate::uuids::*;

// ----------------------------------------------------------------------------
// Service Kinds
// ----------------------------------------------------------------------------

/// Capability a service provides, derived from its UUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    DeviceInformation,
    Battery,
    SerialTransport,
    Oad,
    Other,
}

impl ServiceKind {
    pub fn from_uuid(uuid: &Uuid) -> Self {
        match *uuid {
            DEVICE_INFORMATION_SERVICE_UUID => ServiceKind::DeviceInformation,
            BATTERY_SERVICE_UUID => ServiceKind::Battery,
            SERIAL_TRANSPORT_SERVICE_UUID => ServiceKind::SerialTransport,
            OAD_SERVICE_UUID => ServiceKind::Oad,
            _ => ServiceKind::Other,
        }
    }

    /// Characteristics that must exist for `setup` to succeed
    pub fn required_characteristics(self) -> &'static [Uuid] {
        match self {
            ServiceKind::Battery => &[BATTERY_LEVEL_CHARACTERISTIC_UUID],
            ServiceKind::SerialTransport => &[SERIAL_TRANSPORT_CHARACTERISTIC_UUID],
            ServiceKind::Oad => &[
                OAD_IDENTIFY_CHARACTERISTIC_UUID,
                OAD_BLOCK_CHARACTERISTIC_UUID,
            ],
            ServiceKind::DeviceInformation | ServiceKind::Other => &[],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ServiceKind::DeviceInformation => "Device Information",
            ServiceKind::Battery => "Battery",
            ServiceKind::SerialTransport => "Serial Transport",
            ServiceKind::Oad => "OAD",
            ServiceKind::Other => "Generic",
        }
    }
}

// ----------------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Bindings {
    characteristics: HashMap<Uuid, GattCharacteristic>,
    setup_complete: bool,
}

/// One discovered GATT service bound to a live connection
pub struct Service {
    uuid: Uuid,
    kind: ServiceKind,
    discovered: GattService,
    peripheral: Arc<dyn Peripheral>,
    bindings: RwLock<Bindings>,
    serial: Option<SerialChannel>,
    command_timeout: Duration,
}

impl Service {
    /// Build a service from a fresh discovery, with no bindings yet
    pub fn from_discovered(
        discovered: GattService,
        peripheral: Arc<dyn Peripheral>,
        command_timeout: Duration,
    ) -> Self {
        let kind = ServiceKind::from_uuid(&discovered.uuid);
        Self {
            uuid: discovered.uuid,
            kind,
            discovered,
            peripheral,
            bindings: RwLock::new(Bindings::default()),
            serial: (kind == ServiceKind::SerialTransport).then(SerialChannel::new),
            command_timeout,
        }
    }

    /// Build a service from a fresh discovery, keeping the bindings of
    /// `existing` that the fresh discovery still reports
    ///
    /// Serial listeners registered on `existing` keep receiving messages.
    pub fn from_existing(
        existing: &Service,
        discovered: GattService,
        peripheral: Arc<dyn Peripheral>,
    ) -> Self {
        let previous = existing.bindings.read();
        let characteristics: HashMap<Uuid, GattCharacteristic> = previous
            .characteristics
            .iter()
            .filter(|(uuid, _)| discovered.characteristic(uuid).is_some())
            .map(|(uuid, c)| (*uuid, c.clone()))
            .collect();
        let setup_complete = previous.setup_complete
            && existing
                .kind
                .required_characteristics()
                .iter()
                .all(|uuid| characteristics.contains_key(uuid));

        Self {
            uuid: existing.uuid,
            kind: existing.kind,
            discovered,
            peripheral,
            bindings: RwLock::new(Bindings {
                characteristics,
                setup_complete,
            }),
            serial: existing.serial.clone(),
            command_timeout: existing.command_timeout,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn is_setup(&self) -> bool {
        self.bindings.read().setup_complete
    }

    /// Resolve every characteristic this service needs on the live connection
    ///
    /// Calling it again re-resolves and replaces the previous bindings.
    pub async fn setup(&self) -> Result<()> {
        // Bindings carried over from an earlier connection count only once this setup succeeds
        self.bindings.write().setup_complete = false;

        for required in self.kind.required_characteristics() {
            if self.discovered.characteristic(required).is_none() {
                return Err(LightBlueError::ServiceSetup {
                    service: self.uuid,
                    reason: format!("missing required characteristic {}", required),
                });
            }
        }

        if let Some(serial) = &self.serial {
            serial
                .attach(self.peripheral.as_ref())
                .await
                .map_err(|e| LightBlueError::ServiceSetup {
                    service: self.uuid,
                    reason: e.to_string(),
                })?;
        }

        let characteristics = self
            .discovered
            .characteristics
            .iter()
            .map(|c| (c.uuid, c.clone()))
            .collect();

        let mut bindings = self.bindings.write();
        bindings.characteristics = characteristics;
        bindings.setup_complete = true;
        debug!("Service setup successfully: {}", self.name());
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_setup() {
            Ok(())
        } else {
            Err(LightBlueError::ServiceNotReady { service: self.uuid })
        }
    }

    /// Bound characteristic by UUID
    pub fn characteristic(&self, uuid: &Uuid) -> Result<GattCharacteristic> {
        self.ensure_ready()?;
        self.bindings
            .read()
            .characteristics
            .get(uuid)
            .cloned()
            .ok_or(LightBlueError::CharacteristicNotFound {
                characteristic: *uuid,
            })
    }

    fn serial_channel(&self) -> Result<&SerialChannel> {
        self.ensure_ready()?;
        self.serial.as_ref().ok_or(LightBlueError::CharacteristicNotFound {
            characteristic: SERIAL_TRANSPORT_CHARACTERISTIC_UUID,
        })
    }

    // ------------------------------------------------------------------------
    // Serial Transport
    // ------------------------------------------------------------------------

    /// Frame and write a command without waiting for a reply
    pub async fn send_command(&self, command: u16, payload: &[u8]) -> Result<()> {
        let serial = self.serial_channel()?;
        let packets = SerialMessage::new(command, payload).to_packets(serial.next_message_count())?;

        for packet in packets {
            self.peripheral
                .write(
                    SERIAL_TRANSPORT_CHARACTERISTIC_UUID,
                    &packet,
                    WriteKind::WithoutResponse,
                )
                .await?;
        }
        debug!("Sent command 0x{:04x} ({} bytes)", command, payload.len());
        Ok(())
    }

    /// Send a command and wait for the reply carrying the same command id
    pub async fn request(&self, command: u16, payload: &[u8]) -> Result<SerialMessage> {
        let serial = self.serial_channel()?;
        let reply = serial.expect_reply(command);
        if let Err(e) = self.send_command(command, payload).await {
            drop(reply);
            serial.forget_abandoned(command);
            return Err(e);
        }

        let outcome = timeout(self.command_timeout, reply).await;
        match outcome {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(LightBlueError::ChannelClosed),
            Err(_) => {
                serial.forget_abandoned(command);
                Err(LightBlueError::CommandTimeout { command })
            }
        }
    }

    /// Receive payloads of unsolicited messages with the given command id
    pub fn subscribe(&self, command: u16) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        Ok(self.serial_channel()?.listen(command))
    }

    // ------------------------------------------------------------------------
    // Battery
    // ------------------------------------------------------------------------

    /// Battery charge in percent
    pub async fn read_battery_level(&self) -> Result<u8> {
        let characteristic = self.characteristic(&BATTERY_LEVEL_CHARACTERISTIC_UUID)?;
        let value = self.peripheral.read(characteristic.uuid).await?;
        value
            .first()
            .copied()
            .ok_or_else(|| LightBlueError::InvalidValue {
                characteristic: characteristic.uuid,
                reason: "empty battery level".to_string(),
            })
    }

    /// Battery voltage derived from the reported level
    pub async fn read_battery_voltage(&self) -> Result<f32> {
        let level = self.read_battery_level().await?;
        Ok(level_to_voltage(level))
    }

    // ------------------------------------------------------------------------
    // Device Information
    // ------------------------------------------------------------------------

    /// Read every device information string the peripheral exposes
    pub async fn read_device_information(&self) -> Result<DeviceInformation> {
        self.ensure_ready()?;
        Ok(DeviceInformation {
            manufacturer_name: self.read_string(MANUFACTURER_NAME_CHARACTERISTIC_UUID).await?,
            model_number: self.read_string(MODEL_NUMBER_CHARACTERISTIC_UUID).await?,
            hardware_version: self.read_string(HARDWARE_REVISION_CHARACTERISTIC_UUID).await?,
            firmware_version: self.read_string(FIRMWARE_REVISION_CHARACTERISTIC_UUID).await?,
            software_version: self.read_string(SOFTWARE_REVISION_CHARACTERISTIC_UUID).await?,
        })
    }

    // ------------------------------------------------------------------------
    // OAD
    // ------------------------------------------------------------------------

    pub fn identify_characteristic(&self) -> Result<GattCharacteristic> {
        self.characteristic(&OAD_IDENTIFY_CHARACTERISTIC_UUID)
    }

    pub fn block_characteristic(&self) -> Result<GattCharacteristic> {
        self.characteristic(&OAD_BLOCK_CHARACTERISTIC_UUID)
    }

    async fn read_string(&self, uuid: Uuid) -> Result<Option<String>> {
        let bound = self.bindings.read().characteristics.contains_key(&uuid);
        if !bound {
            return Ok(None);
        }
        let raw = self.peripheral.read(uuid).await?;
        let text = String::from_utf8_lossy(&raw);
        Ok(Some(text.trim_end_matches('\0').to_string()))
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("uuid", &self.uuid)
            .field("kind", &self.kind)
            .field("setup_complete", &self.is_setup())
            .finish_non_exhaustive()
    }
}

/// Strings from the standard device information service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInformation {
    pub manufacturer_name: Option<String>,
    pub model_number: Option<String>,
    pub hardware_version: Option<String>,
    pub firmware_version: Option<String>,
    pub software_version: Option<String>,
}

const BATTERY_EMPTY_VOLTS: f32 = 2.0;
const BATTERY_FULL_VOLTS: f32 = 3.53;

fn level_to_voltage(level: u8) -> f32 {
    let level = f32::from(level.min(100));
    BATTERY_EMPTY_VOLTS + (BATTERY_FULL_VOLTS - BATTERY_EMPTY_VOLTS) * level / 100.0
}

// ----------------------------------------------------------------------------
// Serial Channel
// ----------------------------------------------------------------------------

/// Routing state shared by every generation of a serial transport service
#[derive(Clone)]
struct SerialChannel {
    router: Arc<SerialRouter>,
}

#[derive(Default)]
struct SerialRouter {
    /// One-shot reply matchers keyed by request id, oldest first
    pending: Mutex<HashMap<u16, Vec<oneshot::Sender<SerialMessage>>>>,
    listeners: Mutex<HashMap<u16, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
    message_count: AtomicU8,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SerialChannel {
    fn new() -> Self {
        Self {
            router: Arc::new(SerialRouter::default()),
        }
    }

    fn next_message_count(&self) -> u8 {
        self.router.message_count.fetch_add(1, Ordering::Relaxed) & 0x03
    }

    /// Subscribe to the serial characteristic and (re)start the reader task
    async fn attach(&self, peripheral: &dyn Peripheral) -> Result<()> {
        peripheral
            .subscribe(SERIAL_TRANSPORT_CHARACTERISTIC_UUID)
            .await?;
        let mut notifications = peripheral.notifications().await?;

        let router = Arc::downgrade(&self.router);
        let task = tokio::spawn(async move {
            let mut reassembler = Reassembler::new();
            while let Some(notification) = notifications.next().await {
                if notification.characteristic != SERIAL_TRANSPORT_CHARACTERISTIC_UUID {
                    continue;
                }
                match reassembler.push(&notification.value) {
                    Ok(Some(message)) => match Weak::upgrade(&router) {
                        Some(router) => router.dispatch(message),
                        None => break,
                    },
                    Ok(None) => {}
                    Err(e) => warn!("Dropped serial frame: {}", e),
                }
            }
            debug!("Serial notification reader ended");
        });

        if let Some(previous) = self.router.reader.lock().replace(task) {
            previous.abort();
        }
        info!("Serial transport attached");
        Ok(())
    }

    fn expect_reply(&self, command: u16) -> oneshot::Receiver<SerialMessage> {
        let (tx, rx) = oneshot::channel();
        self.router.pending.lock().entry(command).or_default().push(tx);
        rx
    }

    /// Drop reply matchers whose requester has given up
    fn forget_abandoned(&self, command: u16) {
        let mut pending = self.router.pending.lock();
        if let Some(waiters) = pending.get_mut(&command) {
            waiters.retain(|tx| !tx.is_closed());
            if waiters.is_empty() {
                pending.remove(&command);
            }
        }
    }

    #[cfg(test)]
    fn pending_replies(&self, command: u16) -> usize {
        self.router.pending.lock().get(&command).map_or(0, Vec::len)
    }

    fn listen(&self, command: u16) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.router.listeners.lock().entry(command).or_default().push(tx);
        rx
    }
}

impl SerialRouter {
    fn dispatch(&self, message: SerialMessage) {
        if message.is_response() {
            let id = message.request_id();
            let mut pending = self.pending.lock();
            let mut message = Some(message);
            if let Some(waiters) = pending.get_mut(&id) {
                while let Some(msg) = message.take() {
                    if waiters.is_empty() {
                        message = Some(msg);
                        break;
                    }
                    // A waiter that already timed out hands the reply to the next one
                    if let Err(msg) = waiters.remove(0).send(msg) {
                        message = Some(msg);
                    }
                }
                if waiters.is_empty() {
                    pending.remove(&id);
                }
            }
            if message.is_some() {
                debug!("Unmatched reply 0x{:04x}", id);
            }
            return;
        }

        let mut listeners = self.listeners.lock();
        if let Some(senders) = listeners.get_mut(&message.command) {
            senders.retain(|tx| tx.send(message.payload.clone()).is_ok());
            if senders.is_empty() {
                listeners.remove(&message.command);
            }
        } else {
            debug!("Unhandled serial message 0x{:04x}", message.command);
        }
    }
}

impl Drop for SerialRouter {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPeripheral;
    use crate::radio::CharacteristicProperties;
    use crate::serial::{commands, RESPONSE_BIT};

    fn gatt(service: Uuid, characteristics: &[Uuid]) -> GattService {
        GattService {
            uuid: service,
            characteristics: characteristics
                .iter()
                .map(|uuid| GattCharacteristic {
                    uuid: *uuid,
                    properties: CharacteristicProperties::default(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_setup_fails_on_missing_characteristic() {
        let peripheral = MockPeripheral::new("AA:BB");
        let service = Service::from_discovered(
            gatt(BATTERY_SERVICE_UUID, &[]),
            peripheral,
            Duration::from_secs(1),
        );

        let err = service.setup().await.unwrap_err();
        assert!(matches!(err, LightBlueError::ServiceSetup { .. }));
        assert!(!service.is_setup());
    }

    #[tokio::test]
    async fn test_commands_refused_before_setup() {
        let peripheral = MockPeripheral::new("AA:BB");
        let service = Service::from_discovered(
            gatt(
                SERIAL_TRANSPORT_SERVICE_UUID,
                &[SERIAL_TRANSPORT_CHARACTERISTIC_UUID],
            ),
            peripheral.clone(),
            Duration::from_secs(1),
        );

        let err = service
            .send_command(commands::CC_LED_WRITE_ALL, &[1, 2, 3])
            .await
            .unwrap_err();
        assert!(matches!(err, LightBlueError::ServiceNotReady { .. }));
        assert!(peripheral.writes().is_empty());
    }

    #[tokio::test]
    async fn test_request_resolves_on_matching_reply() {
        let peripheral = MockPeripheral::new("AA:BB");
        peripheral.reply_to(
            commands::CC_ACCEL_READ,
            SerialMessage::new(commands::CC_ACCEL_READ | RESPONSE_BIT, vec![9; 7]),
        );
        let service = Service::from_discovered(
            gatt(
                SERIAL_TRANSPORT_SERVICE_UUID,
                &[SERIAL_TRANSPORT_CHARACTERISTIC_UUID],
            ),
            peripheral.clone(),
            Duration::from_secs(1),
        );
        service.setup().await.unwrap();

        let reply = service.request(commands::CC_ACCEL_READ, &[]).await.unwrap();
        assert_eq!(reply.request_id(), commands::CC_ACCEL_READ);
        assert_eq!(reply.payload, vec![9; 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_without_reply() {
        let peripheral = MockPeripheral::new("AA:BB");
        let service = Service::from_discovered(
            gatt(
                SERIAL_TRANSPORT_SERVICE_UUID,
                &[SERIAL_TRANSPORT_CHARACTERISTIC_UUID],
            ),
            peripheral,
            Duration::from_secs(1),
        );
        service.setup().await.unwrap();

        let err = service
            .request(commands::BT_GET_CONFIG, &[])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LightBlueError::CommandTimeout {
                command: commands::BT_GET_CONFIG
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_request_leaves_no_matcher() {
        let peripheral = MockPeripheral::new("AA:BB");
        let service = Service::from_discovered(
            gatt(
                SERIAL_TRANSPORT_SERVICE_UUID,
                &[SERIAL_TRANSPORT_CHARACTERISTIC_UUID],
            ),
            peripheral,
            Duration::from_secs(1),
        );
        service.setup().await.unwrap();

        for _ in 0..3 {
            assert!(service.request(commands::BT_GET_CONFIG, &[]).await.is_err());
        }
        let serial = service.serial_channel().unwrap();
        assert_eq!(serial.pending_replies(commands::BT_GET_CONFIG), 0);
    }

    #[tokio::test]
    async fn test_from_existing_keeps_valid_bindings() {
        let peripheral = MockPeripheral::new("AA:BB");
        let first = Service::from_discovered(
            gatt(
                DEVICE_INFORMATION_SERVICE_UUID,
                &[
                    MANUFACTURER_NAME_CHARACTERISTIC_UUID,
                    MODEL_NUMBER_CHARACTERISTIC_UUID,
                ],
            ),
            peripheral.clone(),
            Duration::from_secs(1),
        );
        first.setup().await.unwrap();

        let refreshed = Service::from_existing(
            &first,
            gatt(
                DEVICE_INFORMATION_SERVICE_UUID,
                &[MANUFACTURER_NAME_CHARACTERISTIC_UUID],
            ),
            peripheral,
        );
        assert!(refreshed.is_setup());
        assert!(refreshed
            .characteristic(&MANUFACTURER_NAME_CHARACTERISTIC_UUID)
            .is_ok());
        assert!(refreshed
            .characteristic(&MODEL_NUMBER_CHARACTERISTIC_UUID)
            .is_err());
    }

    #[tokio::test]
    async fn test_oad_characteristics_after_setup() {
        let peripheral = MockPeripheral::new("AA:BB");
        let service = Service::from_discovered(
            gatt(
                OAD_SERVICE_UUID,
                &[OAD_IDENTIFY_CHARACTERISTIC_UUID, OAD_BLOCK_CHARACTERISTIC_UUID],
            ),
            peripheral,
            Duration::from_secs(1),
        );
        assert!(matches!(
            service.identify_characteristic(),
            Err(LightBlueError::ServiceNotReady { .. })
        ));

        service.setup().await.unwrap();
        assert_eq!(service.kind(), ServiceKind::Oad);
        assert_eq!(
            service.identify_characteristic().unwrap().uuid,
            OAD_IDENTIFY_CHARACTERISTIC_UUID
        );
        assert_eq!(
            service.block_characteristic().unwrap().uuid,
            OAD_BLOCK_CHARACTERISTIC_UUID
        );
    }

    #[tokio::test]
    async fn test_failed_resetup_is_not_ready() {
        let peripheral = MockPeripheral::new("AA:BB");
        let gatt_serial = || {
            gatt(
                SERIAL_TRANSPORT_SERVICE_UUID,
                &[SERIAL_TRANSPORT_CHARACTERISTIC_UUID],
            )
        };
        let first = Service::from_discovered(gatt_serial(), peripheral.clone(), Duration::from_secs(1));
        first.setup().await.unwrap();

        peripheral.fail_subscribe("link lost");
        let refreshed = Service::from_existing(&first, gatt_serial(), peripheral.clone());
        assert!(refreshed.is_setup());

        let err = refreshed.setup().await.unwrap_err();
        assert!(matches!(err, LightBlueError::ServiceSetup { .. }));
        assert!(!refreshed.is_setup());
        assert!(matches!(
            refreshed.send_command(commands::CC_LED_WRITE_ALL, &[0, 0, 0]).await,
            Err(LightBlueError::ServiceNotReady { .. })
        ));
    }

    #[test]
    fn test_battery_voltage_scale() {
        assert_eq!(level_to_voltage(0), 2.0);
        assert!((level_to_voltage(100) - 3.53).abs() < f32::EPSILON);
        assert_eq!(level_to_voltage(200), level_to_voltage(100));
    }
}
