//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Advertised name of the Bean to use
    #[arg(short, long, global = true)]
    pub name: Option<String>,

    /// Address of the Bean to use
    #[arg(short, long, global = true)]
    pub address: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan and print every device found
    Scan {
        /// Scan duration in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Only print devices advertising this service (16-bit or full UUID)
        #[arg(short, long)]
        service: Option<String>,
    },
    /// Turn the LED on for a few seconds
    BlinkLed,
    /// Print accelerometer readings
    ReadAccel {
        /// Number of readings to take
        #[arg(short, long, default_value_t = 30)]
        samples: u32,
    },
    /// Print the Bean's radio configuration
    ReadConfig,
    /// Print device information, battery voltage and sketch name
    DeviceInfo {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print serial output from the Bean until interrupted
    LogSerial,
    /// Write data to the Bean's serial port
    SendSerial {
        /// Data to send
        data: String,
        /// Interpret data as hex digits
        #[arg(short, long)]
        binary: bool,
    },
    /// Change the Bean's advertised name
    Rename {
        /// New name, at most 20 bytes
        new_name: String,
    },
}
