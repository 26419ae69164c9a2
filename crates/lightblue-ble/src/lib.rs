//! Bluetooth Low Energy radio binding for the LightBlue lifecycle manager
//!
//! Implements the `Radio` and `Peripheral` traits from `lightblue-core` on top
//! of btleplug, so the lifecycle manager can scan for and talk to real Beans.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use lightblue_ble::BleRadio;
//! use lightblue_core::LightBlue;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let radio = Arc::new(BleRadio::new().await?);
//! let lightblue = LightBlue::builder(radio).build_and_start().await?;
//! lightblue.start_scanning(None, None).await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod peripheral;
mod radio;

// Public API exports
pub use error::BleError;
pub use peripheral::BlePeripheral;
pub use radio::BleRadio;
