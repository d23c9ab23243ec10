//! Command-line interface.

use std::path::PathBuf;

use clap::{ArgAction, Parser};

/// State-first integration hub for Companion Satellite control surfaces.
#[derive(Debug, Parser)]
#[command(name = "satellite-bridge", version, disable_version_flag = true)]
pub struct Cli {
    /// Path to the configuration file (overrides BRIDGE_CONFIG_PATH).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    pub validate: bool,

    /// Print version information.
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}
