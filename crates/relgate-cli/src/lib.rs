//! RelGate CLI - operator access to release gating and migration history.

pub mod commands;
pub mod config;
pub mod error;

pub use config::{Args, Command, OutputFormat};
pub use error::{CliError, CliResult};
