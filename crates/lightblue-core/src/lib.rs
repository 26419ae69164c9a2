//! Device registry and connection lifecycle manager for LightBlue Bean peripherals
//!
//! This crate keeps exactly one live [`Device`] per advertised address,
//! classifies each device as a Bean or a plain BLE peripheral, and manages
//! scanning, connecting, service discovery and teardown. The Bluetooth stack
//! itself sits behind the [`Radio`] and [`Peripheral`] traits.
//!
//! ## Architecture
//!
//! - [`radio`] - Binding traits and the GATT data model
//! - [`uuids`] - Service and characteristic identifiers
//! - [`serial`] - Bean serial transport framing and reply decoding
//! - [`service`] - Discovered services and their capability operations
//! - [`device`] - Device identity, connection lifecycle and Bean commands
//! - [`registry`] - One device per address
//! - [`scan`] - Scanning state, deadlines and pausing for connects
//! - [`firmware`] - Firmware update and sketch upload collaborators
//! - [`lightblue`] - The orchestrator tying it all together
//! - [`mock`] - In-memory radio binding
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lightblue_core::{mock::MockRadio, LightBlue};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let lightblue = LightBlue::builder(MockRadio::new()).build_and_start().await?;
//! let mut discoveries = lightblue.subscribe();
//!
//! lightblue.start_scanning(None, None).await?;
//! while let Ok(device) = discoveries.recv().await {
//!     println!("{}", device.describe());
//! }
//!
//! lightblue.quit_gracefully().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod firmware;
pub mod lightblue;
pub mod mock;
pub mod radio;
pub mod registry;
pub mod scan;
pub mod serial;
pub mod service;
pub mod uuids;

// Public API exports
pub use config::LightBlueConfig;
pub use device::{Capability, Device, DeviceAddress, DeviceKind, DeviceSummary};
pub use error::{LightBlueError, Result};
pub use firmware::{
    FirmwareImage, FirmwareUpdater, NoFirmwareUpdater, NoSketchUploader, SketchUploader,
};
pub use lightblue::{LightBlue, LightBlueBuilder};
pub use radio::{
    Advertisement, ConnectionState, Peripheral, Radio, RadioEvent, RadioState,
};
pub use registry::{Observation, Registry, Sighting};
pub use scan::{ScanController, ScanSnapshot, ScanState, TimeoutCallback};
pub use serial::{AccelerometerReading, BleConfig, SerialMessage, SketchMetadata};
pub use service::{DeviceInformation, Service, ServiceKind};
