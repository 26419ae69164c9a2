//! Command handlers for the LightBlue CLI

use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use lightblue_core::uuids::normalize_uuid;
use lightblue_core::{Device, LightBlue};
use uuid::Uuid;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::cli::{Cli, Commands};
use crate::config::CliConfig;
use crate::error::{CliError, Result};

const LED_ON_DURATION: Duration = Duration::from_secs(3);
const ACCEL_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

// ----------------------------------------------------------------------------
// Bean Selection
// ----------------------------------------------------------------------------

/// Which Bean a command talks to; with no criteria the first one found wins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeanSelector {
    pub name: Option<String>,
    pub address: Option<String>,
}

impl BeanSelector {
    /// Command line options take precedence over the configuration file
    pub fn from_options(cli: &Cli, config: &CliConfig) -> Self {
        Self {
            name: cli.name.clone().or_else(|| config.default_name.clone()),
            address: cli.address.clone().or_else(|| config.default_address.clone()),
        }
    }

    pub fn matches(&self, device: &Device) -> bool {
        let name_matches = self
            .name
            .as_ref()
            .map_or(true, |name| device.name() == *name);
        let address_matches = self
            .address
            .as_ref()
            .map_or(true, |address| device.address().as_str().eq_ignore_ascii_case(address));
        name_matches && address_matches
    }
}

impl fmt::Display for BeanSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.address) {
            (None, None) => write!(f, "any Bean"),
            (Some(name), None) => write!(f, "Bean named {}", name),
            (None, Some(address)) => write!(f, "Bean at {}", address),
            (Some(name), Some(address)) => write!(f, "Bean named {} at {}", name, address),
        }
    }
}

/// Scan for the selected Bean, connect and set up its services
pub async fn connect_to_bean(lightblue: &LightBlue, selector: &BeanSelector) -> Result<Arc<Device>> {
    let mut discoveries = lightblue.subscribe();
    let (timed_out_tx, mut timed_out) = oneshot::channel();
    let timeout = lightblue.config().scan_timeout;

    lightblue
        .start_scanning(
            Some(timeout),
            Some(Box::new(move || {
                let _ = timed_out_tx.send(());
            })),
        )
        .await?;
    info!("Looking for {}...", selector);

    let device = loop {
        tokio::select! {
            received = discoveries.recv() => match received {
                Ok(device) if selector.matches(&device) => break device,
                Ok(device) => debug!("Skipping {}", device),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {} discoveries", missed);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CliError::NoBeanFound(timeout.as_secs()));
                }
            },
            _ = &mut timed_out => return Err(CliError::NoBeanFound(timeout.as_secs())),
        }
    };

    lightblue.stop_scanning().await?;
    info!("Found {}", device);
    lightblue.connect_to_device(device.address()).await?;

    if let Err(e) = device.discover_services().await {
        warn!("Some services could not be set up: {}", e);
    }
    Ok(device)
}

// ----------------------------------------------------------------------------
// Command Dispatcher
// ----------------------------------------------------------------------------

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command, disconnecting everything afterwards
    pub async fn execute(cli: Cli, config: CliConfig, lightblue: LightBlue) -> Result<()> {
        let selector = BeanSelector::from_options(&cli, &config);

        let result = match cli.command {
            Commands::Scan { timeout, service } => {
                Self::handle_scan_command(
                    &lightblue,
                    timeout.map(Duration::from_secs),
                    service.as_deref(),
                )
                .await
            }
            command => match connect_to_bean(&lightblue, &selector).await {
                Ok(device) => Self::handle_bean_command(command, device).await,
                Err(e) => Err(e),
            },
        };

        let quit = lightblue.quit_gracefully().await;
        lightblue.shutdown();
        result?;
        quit?;
        Ok(())
    }

    async fn handle_bean_command(command: Commands, device: Arc<Device>) -> Result<()> {
        match command {
            Commands::BlinkLed => Self::handle_blink_led(&device).await,
            Commands::ReadAccel { samples } => Self::handle_read_accel(&device, samples).await,
            Commands::ReadConfig => Self::handle_read_config(&device).await,
            Commands::DeviceInfo { json } => Self::handle_device_info(&device, json).await,
            Commands::LogSerial => Self::handle_log_serial(&device).await,
            Commands::SendSerial { data, binary } => {
                Self::handle_send_serial(&device, &data, binary).await
            }
            Commands::Rename { new_name } => {
                println!("Renaming Bean to: {}", new_name);
                device.rename(&new_name).await?;
                Ok(())
            }
            Commands::Scan { .. } => Ok(()),
        }
    }

    /// Print every device found until the scan times out or Ctrl-C
    async fn handle_scan_command(
        lightblue: &LightBlue,
        timeout: Option<Duration>,
        service: Option<&str>,
    ) -> Result<()> {
        let service = service.map(parse_service_filter).transpose()?;
        let mut discoveries = lightblue.subscribe();
        let (done_tx, mut done) = oneshot::channel();

        lightblue
            .start_scanning(
                timeout,
                Some(Box::new(move || {
                    let _ = done_tx.send(());
                })),
            )
            .await?;

        loop {
            tokio::select! {
                received = discoveries.recv() => match received {
                    Ok(device) if advertises(&device, service) => {
                        println!("{}", device.describe())
                    }
                    Ok(device) => debug!("Skipping {}", device),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} discoveries", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = &mut done => break,
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        println!("Found {} devices", lightblue.devices().await.len());
        Ok(())
    }

    async fn handle_blink_led(device: &Device) -> Result<()> {
        println!("Turning LED on...");
        device.set_led(255, 0, 255).await?;
        println!("Waiting for {} seconds...", LED_ON_DURATION.as_secs());
        tokio::time::sleep(LED_ON_DURATION).await;
        println!("Turning LED off...");
        device.set_led(0, 0, 0).await?;
        Ok(())
    }

    async fn handle_read_accel(device: &Device, samples: u32) -> Result<()> {
        for _ in 0..samples {
            let reading = device.read_accelerometer().await?;
            println!(
                "X: {:<10.3}Y: {:<10.3}Z: {:<10.3}",
                reading.x_axis, reading.y_axis, reading.z_axis
            );
            tokio::time::sleep(ACCEL_SAMPLE_INTERVAL).await;
        }
        Ok(())
    }

    async fn handle_read_config(device: &Device) -> Result<()> {
        let config = device.read_ble_config().await?;
        println!();
        println!("    Advertising Interval: {}", config.advertising_interval);
        println!("     Connection Interval: {}", config.connection_interval);
        println!("                Tx Power: {}", config.tx_power);
        println!("        Advertising Mode: {}", config.advertising_mode);
        println!("            iBeacon UUID: {}", config.ibeacon_uuid);
        println!("        iBeacon Major ID: {}", config.ibeacon_major_id);
        println!("        iBeacon Minor ID: {}", config.ibeacon_minor_id);
        println!("              Local Name: {}", config.local_name);
        Ok(())
    }

    async fn handle_device_info(device: &Device, json: bool) -> Result<()> {
        let report = DeviceReport::collect(device).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print!("{}", report);
        }
        Ok(())
    }

    async fn handle_log_serial(device: &Device) -> Result<()> {
        let mut serial = device.subscribe_serial()?;
        println!("Logging serial data...");
        println!();

        let mut stdout = std::io::stdout();
        loop {
            tokio::select! {
                data = serial.recv() => match data {
                    Some(data) => {
                        stdout.write_all(&data)?;
                        stdout.flush()?;
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        Ok(())
    }

    async fn handle_send_serial(device: &Device, data: &str, binary: bool) -> Result<()> {
        let bytes = parse_serial_data(data, binary)?;
        device.send_serial(&bytes).await?;
        println!("Sent {} bytes", bytes.len());
        Ok(())
    }
}

/// Service UUID from any of the textual forms radios report
pub fn parse_service_filter(raw: &str) -> Result<Uuid> {
    normalize_uuid(raw).ok_or_else(|| CliError::InvalidUuid(raw.to_string()))
}

fn advertises(device: &Device, service: Option<Uuid>) -> bool {
    service.map_or(true, |uuid| device.advertised_services().contains(&uuid))
}

/// Hex digits when `binary`, otherwise the raw text
pub fn parse_serial_data(data: &str, binary: bool) -> Result<Vec<u8>> {
    if binary {
        Ok(hex::decode(data)?)
    } else {
        Ok(data.as_bytes().to_vec())
    }
}

// ----------------------------------------------------------------------------
// Device Report
// ----------------------------------------------------------------------------

/// Everything `device-info` prints
#[derive(Debug, Serialize)]
pub struct DeviceReport {
    pub device: lightblue_core::DeviceSummary,
    pub information: lightblue_core::DeviceInformation,
    pub battery_voltage: Option<f32>,
    pub sketch_name: Option<String>,
}

impl DeviceReport {
    async fn collect(device: &Device) -> Result<Self> {
        let information = device
            .device_information_service()?
            .read_device_information()
            .await?;

        let battery_voltage = match device.battery_service() {
            Ok(battery) => battery.read_battery_voltage().await.ok(),
            Err(e) => {
                debug!("No battery voltage: {}", e);
                None
            }
        };
        let sketch_name = match device.read_sketch_info().await {
            Ok(sketch) => Some(sketch.sketch_name),
            Err(e) => {
                debug!("No sketch info: {}", e);
                None
            }
        };

        Ok(Self {
            device: device.summary(),
            information,
            battery_voltage,
            sketch_name,
        })
    }
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_unknown(value: &Option<String>) -> &str {
            value.as_deref().unwrap_or("Unknown")
        }

        writeln!(f)?;
        writeln!(f, "      Manufacturer: {}", or_unknown(&self.information.manufacturer_name))?;
        writeln!(f, "      Model Number: {}", or_unknown(&self.information.model_number))?;
        writeln!(f, "  Hardware Version: {}", or_unknown(&self.information.hardware_version))?;
        writeln!(f, "  Firmware Version: {}", or_unknown(&self.information.firmware_version))?;
        match self.battery_voltage {
            Some(volts) => writeln!(f, "   Battery Voltage: {:.2} V", volts)?,
            None => writeln!(f, "   Battery Voltage: No Battery Service")?,
        }
        writeln!(f, "       Sketch Name: {}", or_unknown(&self.sketch_name))
    }
}
