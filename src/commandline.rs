use bluetti_lib::SessionConfig;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show the battery level in percent
    Battery,
    /// Show input power, output power and charging status
    Power,
    /// Show model, serial number and firmware version
    Identity,
    /// Read all telemetry registers and show them
    All,
    /// Read identity and telemetry and show the resulting snapshot
    Snapshot,
    /// Poll the device periodically and print every snapshot
    Monitor {
        /// Interval between two polls (e.g., "10s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
        interval: Duration,
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Console)]
        format: OutputFormat,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Console,
    Json,
}

const fn about_text() -> &'static str {
    "bluetti power station command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Advertised Bluetooth name of the power station (e.g., "AC2001234567890")
    #[arg(short, long)]
    pub device: String,

    /// Configuration file with timeouts, GATT profile and identity tables.
    /// Defaults apply if the file does not exist.
    #[arg(long = "config", default_value_t = SessionConfig::DEFAULT_CONFIG_FILE.to_string())]
    pub config_file: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// How long to wait for each response, overrides the config file (e.g., "500ms", "5s")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub timeout: Option<Duration>,

    /// How long to scan for the device (e.g., "30s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "30s")]
    pub scan_timeout: Duration,
}
