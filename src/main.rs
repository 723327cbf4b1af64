use anyhow::{Context, Result};
use bluetti_lib::ble::BleTransport;
use bluetti_lib::{DeviceSession, SessionConfig};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic, path::Path};

mod commandline;
mod monitor;

use commandline::{CliArgs, CliCommands, OutputFormat};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn load_config(args: &CliArgs) -> Result<SessionConfig> {
    let mut config = if Path::new(&args.config_file).exists() {
        SessionConfig::load(&args.config_file)
            .with_context(|| format!("Cannot load config file '{}'", args.config_file))?
    } else {
        debug!("No config file at '{}', using defaults", args.config_file);
        SessionConfig::default()
    };
    if let Some(timeout) = args.timeout {
        config.command_timeout = timeout;
    }
    Ok(config)
}

async fn run_command(session: &DeviceSession<BleTransport>, command: CliCommands) -> Result<()> {
    match command {
        CliCommands::Battery => println!(
            "Battery level: {} %",
            session
                .read_battery()
                .await
                .with_context(|| "Cannot read battery level")?
        ),
        CliCommands::Power => {
            let power = session
                .read_power_triad()
                .await
                .with_context(|| "Cannot read power")?;
            println!("Power input: {} W", power.power_input);
            println!("Power output: {} W", power.power_output);
            println!("Charging status: {}", power.charging_status);
        }
        CliCommands::Identity => println!(
            "Identity: {:?}",
            session
                .read_identity()
                .await
                .with_context(|| "Cannot read identity")?
        ),
        CliCommands::All => println!(
            "Telemetry: {:?}",
            session
                .read_all()
                .await
                .with_context(|| "Cannot read telemetry")?
        ),
        CliCommands::Snapshot => {
            // the identity was read while connecting
            session
                .read_all()
                .await
                .with_context(|| "Cannot read telemetry")?;
            monitor::print_snapshot(&session.current_snapshot(), OutputFormat::Console)?;
        }
        CliCommands::Monitor { interval, format } => {
            monitor::run(session, interval, format).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = load_config(&args)?;
    let transport =
        BleTransport::find_by_name(&args.device, config.gatt.service, args.scan_timeout)
            .await
            .with_context(|| format!("Cannot find device '{}'", args.device))?;

    let session = DeviceSession::new(transport, config);
    session
        .connect()
        .await
        .with_context(|| format!("Cannot connect to '{}'", args.device))?;

    let result = run_command(&session, args.command).await;
    session
        .disconnect()
        .await
        .with_context(|| "Cannot disconnect")?;
    result
}
