//! LightBlue CLI library
//!
//! Command definitions, configuration loading and command handlers for the
//! `lightblue` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::{connect_to_bean, BeanSelector, CommandDispatcher};
pub use config::CliConfig;
pub use error::{CliError, Result};
