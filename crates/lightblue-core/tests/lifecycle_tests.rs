//! Integration tests for the LightBlue device lifecycle
//!
//! These drive the orchestrator through the in-memory radio event stream:
//! discovery, classification, connecting with scanning paused, auto-reconnect
//! and teardown.

mod test_utils;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lightblue_core::mock::{advertisement, MockPeripheral};
use lightblue_core::serial::commands;
use lightblue_core::uuids::BATTERY_SERVICE_UUID;
use lightblue_core::*;
use test_utils::{bean_advertisement, wait_until, Harness};

// ----------------------------------------------------------------------------
// Discovery
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_bean_advertisement_is_recognized_and_announced() {
    let harness = Harness::new().await;
    let mut discoveries = harness.lightblue.subscribe();
    let peripheral = MockPeripheral::bean("AA:BB");

    harness.advertise(bean_advertisement(&peripheral, "Bean"));

    let device = tokio::time::timeout(Duration::from_secs(1), discoveries.recv())
        .await
        .expect("discovery announced")
        .unwrap();
    assert_eq!(device.kind(), DeviceKind::TargetProduct);
    assert_eq!(device.address(), &DeviceAddress::from("AA:BB"));
    assert_eq!(device.name(), "Bean");
}

#[tokio::test]
async fn test_generic_advertisement_is_not_announced() {
    let harness = Harness::new().await;
    let mut discoveries = harness.lightblue.subscribe();
    let generic = MockPeripheral::new("CC:DD");
    let bean = MockPeripheral::bean("AA:BB");

    harness.advertise(advertisement(&generic, "Heart Rate", &[]));
    harness.advertise(bean_advertisement(&bean, "Bean"));

    let first = tokio::time::timeout(Duration::from_secs(1), discoveries.recv())
        .await
        .expect("discovery announced")
        .unwrap();
    assert_eq!(first.address().as_str(), "AA:BB");
    assert!(discoveries.try_recv().is_err());
    assert!(harness
        .lightblue
        .device(&DeviceAddress::from("CC:DD"))
        .await
        .is_none());
}

#[tokio::test]
async fn test_generic_devices_tracked_when_enabled() {
    let harness = Harness::with_config(LightBlueConfig::new().with_generic_devices(true)).await;
    let mut discoveries = harness.lightblue.subscribe();
    let generic = MockPeripheral::new("CC:DD");

    harness.advertise(advertisement(&generic, "Heart Rate", &[]));

    let device = tokio::time::timeout(Duration::from_secs(1), discoveries.recv())
        .await
        .expect("discovery announced")
        .unwrap();
    assert_eq!(device.kind(), DeviceKind::Generic);
}

#[tokio::test]
async fn test_readvertisement_updates_same_instance() {
    let harness = Harness::new().await;
    let mut discoveries = harness.lightblue.subscribe();
    let peripheral = MockPeripheral::bean("AA:BB");

    harness.advertise(bean_advertisement(&peripheral, "Bean"));
    let device = discoveries.recv().await.unwrap();

    harness.advertise(bean_advertisement(&peripheral, "Bean2"));
    assert!(wait_until(|| device.name() == "Bean2").await);

    let tracked = harness
        .lightblue
        .device(&DeviceAddress::from("AA:BB"))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&device, &tracked));
    assert_eq!(harness.lightblue.devices().await.len(), 1);
    assert!(discoveries.try_recv().is_err());
}

// ----------------------------------------------------------------------------
// Connecting
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_scanning_is_off_for_the_duration_of_a_connect() {
    let harness = Harness::new().await;
    let peripheral = MockPeripheral::bean("AA:BB");
    harness
        .lightblue
        .handle_advertisement(bean_advertisement(&peripheral, "Bean"))
        .await;

    let scanning_during_connect = Arc::new(AtomicBool::new(true));
    let observed = scanning_during_connect.clone();
    let radio = harness.radio.clone();
    peripheral.on_connect(move || observed.store(radio.is_scanning(), Ordering::SeqCst));

    harness.lightblue.start_scanning(None, None).await.unwrap();
    assert!(harness.radio.is_scanning());

    harness
        .lightblue
        .connect_to_device(&DeviceAddress::from("AA:BB"))
        .await
        .unwrap();

    assert!(!scanning_during_connect.load(Ordering::SeqCst));
    assert!(harness.lightblue.is_scanning());
    assert!(harness.radio.is_scanning());
}

#[tokio::test]
async fn test_connect_does_not_start_scanning_when_idle() {
    let harness = Harness::new().await;
    let peripheral = MockPeripheral::bean("AA:BB");
    harness
        .lightblue
        .handle_advertisement(bean_advertisement(&peripheral, "Bean"))
        .await;

    harness
        .lightblue
        .connect_to_device(&DeviceAddress::from("AA:BB"))
        .await
        .unwrap();
    assert!(!harness.lightblue.is_scanning());
    assert_eq!(harness.radio.start_requests(), 0);
}

#[tokio::test]
async fn test_failed_connect_still_resumes_scanning() {
    let harness = Harness::new().await;
    let peripheral = MockPeripheral::bean("AA:BB");
    peripheral.fail_connect("link refused");
    harness
        .lightblue
        .handle_advertisement(bean_advertisement(&peripheral, "Bean"))
        .await;

    harness.lightblue.start_scanning(None, None).await.unwrap();
    let result = harness
        .lightblue
        .connect_to_device(&DeviceAddress::from("AA:BB"))
        .await;

    assert!(matches!(result, Err(LightBlueError::ConnectionFailed { .. })));
    assert!(harness.lightblue.is_scanning());
}

#[tokio::test]
async fn test_connect_twice_issues_one_request() {
    let harness = Harness::new().await;
    let peripheral = MockPeripheral::bean("AA:BB");
    harness
        .lightblue
        .handle_advertisement(bean_advertisement(&peripheral, "Bean"))
        .await;
    let address = DeviceAddress::from("AA:BB");

    harness.lightblue.connect_to_device(&address).await.unwrap();
    harness.lightblue.connect_to_device(&address).await.unwrap();
    assert_eq!(peripheral.connect_requests(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_advertisement_during_manual_connect_does_not_reconnect() {
    let harness = Harness::new().await;
    let peripheral = MockPeripheral::bean("AA:BB");
    peripheral.set_connect_delay(Duration::from_millis(200));
    let device = match harness
        .lightblue
        .handle_advertisement(bean_advertisement(&peripheral, "Bean"))
        .await
    {
        Observation::NewDevice(device) => device,
        other => panic!("unexpected observation: {:?}", other),
    };
    device.set_auto_reconnect(true);

    let connecting = {
        let lightblue = harness.lightblue.clone();
        tokio::spawn(async move {
            lightblue
                .connect_to_device(&DeviceAddress::from("AA:BB"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let observation = harness
        .lightblue
        .handle_advertisement(bean_advertisement(&peripheral, "Bean"))
        .await;
    assert!(matches!(
        observation,
        Observation::UpdatedExisting { reconnect: false, .. }
    ));
    device.connect().await.unwrap();

    connecting.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(device.is_connected().await);
    assert_eq!(peripheral.connect_requests(), 1);
}

#[tokio::test]
async fn test_discovery_failure_leaves_other_services_usable() {
    let harness = Harness::new().await;
    let peripheral = MockPeripheral::bean("AA:BB");
    peripheral.remove_characteristic(
        BATTERY_SERVICE_UUID,
        lightblue_core::uuids::BATTERY_LEVEL_CHARACTERISTIC_UUID,
    );
    harness
        .lightblue
        .handle_advertisement(bean_advertisement(&peripheral, "Bean"))
        .await;

    let device = harness
        .lightblue
        .connect_to_device(&DeviceAddress::from("AA:BB"))
        .await
        .unwrap();
    assert!(device.discover_services().await.is_err());

    device.set_led(0, 255, 0).await.unwrap();
    let info = device
        .device_information_service()
        .unwrap()
        .read_device_information()
        .await
        .unwrap();
    assert_eq!(info.model_number.as_deref(), Some("Bean"));
    assert_eq!(info.firmware_version.as_deref(), Some("201602290000"));
    assert_eq!(info.software_version, None);
}

#[tokio::test]
async fn test_serial_log_receives_unsolicited_data() {
    let harness = Harness::new().await;
    let peripheral = MockPeripheral::bean("AA:BB");
    harness
        .lightblue
        .handle_advertisement(bean_advertisement(&peripheral, "Bean"))
        .await;
    let device = harness
        .lightblue
        .connect_to_device(&DeviceAddress::from("AA:BB"))
        .await
        .unwrap();
    device.discover_services().await.unwrap();

    let mut serial = device.subscribe_serial().unwrap();
    peripheral
        .push_serial(&SerialMessage::new(commands::SERIAL_DATA, b"hello".to_vec()))
        .unwrap();

    let data = tokio::time::timeout(Duration::from_secs(1), serial.recv())
        .await
        .expect("serial data arrives")
        .unwrap();
    assert_eq!(data, b"hello");
}

// ----------------------------------------------------------------------------
// Auto-reconnect
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_auto_reconnect_resumes_firmware_update() {
    let harness = Harness::new().await;
    let mut discoveries = harness.lightblue.subscribe();
    let peripheral = MockPeripheral::bean("AA:BB");

    harness.advertise(bean_advertisement(&peripheral, "Bean"));
    let device = discoveries.recv().await.unwrap();
    device.set_auto_reconnect(true);
    harness.firmware.set_in_progress(device.address());

    harness.advertise(bean_advertisement(&peripheral, "Bean"));

    assert!(wait_until(|| harness.firmware.continue_calls() == 1).await);
    assert_eq!(peripheral.connect_requests(), 1);
    assert!(device.is_connected().await);
    assert!(device.serial_transport_service().is_ok());
}

#[tokio::test]
async fn test_auto_reconnect_without_update_only_connects() {
    let harness = Harness::new().await;
    let mut discoveries = harness.lightblue.subscribe();
    let peripheral = MockPeripheral::bean("AA:BB");

    harness.advertise(bean_advertisement(&peripheral, "Bean"));
    let device = discoveries.recv().await.unwrap();
    device.set_auto_reconnect(true);

    harness.advertise(bean_advertisement(&peripheral, "Bean"));

    assert!(wait_until(|| peripheral.connect_requests() == 1).await);
    assert!(device.is_connected().await);
    assert_eq!(harness.firmware.continue_calls(), 0);
    assert!(device.services().is_empty());
}

#[tokio::test]
async fn test_auto_reconnect_failure_is_swallowed() {
    let harness = Harness::new().await;
    let peripheral = MockPeripheral::bean("AA:BB");
    peripheral.fail_connect("out of range");
    let device = match harness
        .lightblue
        .handle_advertisement(bean_advertisement(&peripheral, "Bean"))
        .await
    {
        Observation::NewDevice(device) => device,
        other => panic!("unexpected observation: {:?}", other),
    };
    device.set_auto_reconnect(true);

    harness.lightblue.auto_reconnect(device.clone()).await;
    assert_eq!(peripheral.connect_requests(), 1);
    assert!(!device.is_connected().await);
}

#[tokio::test]
async fn test_no_reconnect_while_connected() {
    let harness = Harness::new().await;
    let peripheral = MockPeripheral::bean("AA:BB");
    let device = match harness
        .lightblue
        .handle_advertisement(bean_advertisement(&peripheral, "Bean"))
        .await
    {
        Observation::NewDevice(device) => device,
        other => panic!("unexpected observation: {:?}", other),
    };
    device.set_auto_reconnect(true);
    device.connect().await.unwrap();

    let observation = harness
        .lightblue
        .handle_advertisement(bean_advertisement(&peripheral, "Bean"))
        .await;
    assert!(matches!(
        observation,
        Observation::UpdatedExisting { reconnect: false, .. }
    ));
    assert_eq!(peripheral.connect_requests(), 1);
}

// ----------------------------------------------------------------------------
// Teardown
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_quit_gracefully_reports_first_failure_and_disconnects_the_rest() {
    let harness = Harness::new().await;
    let peripherals: Vec<_> = ["01", "02", "03"]
        .into_iter()
        .map(MockPeripheral::bean)
        .collect();
    peripherals[1].fail_disconnect("stuck");

    for peripheral in &peripherals {
        harness
            .lightblue
            .handle_advertisement(bean_advertisement(peripheral, "Bean"))
            .await;
        harness
            .lightblue
            .connect_to_device(&peripheral.address())
            .await
            .unwrap();
    }
    harness.lightblue.start_scanning(None, None).await.unwrap();

    let err = harness.lightblue.quit_gracefully().await.unwrap_err();
    assert_eq!(err, LightBlueError::Radio("stuck".to_string()));
    assert!(!harness.lightblue.is_scanning());

    for peripheral in &peripherals {
        assert_eq!(peripheral.disconnect_requests(), 1);
    }
    assert_eq!(
        peripherals[0].state().await,
        ConnectionState::Disconnected
    );
    assert_eq!(
        peripherals[2].state().await,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_quit_gracefully_with_nothing_connected() {
    let harness = Harness::new().await;
    let peripheral = MockPeripheral::bean("AA:BB");
    harness
        .lightblue
        .handle_advertisement(bean_advertisement(&peripheral, "Bean"))
        .await;

    harness.lightblue.quit_gracefully().await.unwrap();
    assert_eq!(peripheral.disconnect_requests(), 0);
}

#[tokio::test]
async fn test_reset_forgets_devices_and_firmware_state() {
    let harness = Harness::new().await;
    let peripheral = MockPeripheral::bean("AA:BB");
    harness
        .lightblue
        .handle_advertisement(bean_advertisement(&peripheral, "Bean"))
        .await;
    let address = DeviceAddress::from("AA:BB");
    harness.lightblue.connect_to_device(&address).await.unwrap();
    harness.firmware.set_in_progress(&address);

    harness.lightblue.reset().await;

    assert!(harness.lightblue.device(&address).await.is_none());
    assert!(harness.lightblue.devices().await.is_empty());
    assert_eq!(harness.firmware.reset_calls(), 1);
    assert_eq!(peripheral.state().await, ConnectionState::Disconnected);

    // The same address is announced again afterwards
    let mut discoveries = harness.lightblue.subscribe();
    harness.advertise(bean_advertisement(&peripheral, "Bean"));
    let device = tokio::time::timeout(Duration::from_secs(1), discoveries.recv())
        .await
        .expect("rediscovered")
        .unwrap();
    assert_eq!(device.address(), &address);
}

// ----------------------------------------------------------------------------
// Radio State
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_scan_waits_for_radio_power() {
    let harness = Harness::new().await;
    harness.radio.set_state(RadioState::PoweredOff);

    harness.lightblue.start_scanning(None, None).await.unwrap();
    assert!(!harness.lightblue.is_scanning());

    harness.radio.set_state(RadioState::PoweredOn);
    assert!(wait_until(|| harness.lightblue.is_scanning()).await);
    assert_eq!(harness.radio.start_requests(), 1);
}
