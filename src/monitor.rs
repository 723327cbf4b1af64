use crate::commandline::OutputFormat;
use anyhow::{Context, Result};
use bluetti_lib::{ConnectionState, DeviceSession, Error, ErrorCategory, Snapshot, Transport};
use log::{error, info, warn};
use serde_json::json;
use std::fmt::Display;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

fn or_unknown<T: Display>(value: Option<&T>) -> String {
    value.map_or_else(|| "unknown".to_string(), ToString::to_string)
}

pub fn print_snapshot(snapshot: &Snapshot, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Console => {
            let (identity, telemetry) = (&snapshot.identity, &snapshot.telemetry);
            println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
            println!("Model: {}", or_unknown(identity.model.as_ref()));
            println!("Serial number: {}", or_unknown(identity.serial_number.as_ref()));
            println!("Firmware version: {}", or_unknown(identity.firmware_version.as_ref()));
            println!("Battery level: {} %", or_unknown(telemetry.battery_level.as_ref()));
            println!("Power input: {} W", or_unknown(telemetry.power_input.as_ref()));
            println!("Power output: {} W", or_unknown(telemetry.power_output.as_ref()));
            println!("Charging status: {}", or_unknown(telemetry.charging_status.as_ref()));
            if let Some(timestamp) = telemetry.timestamp {
                println!("Measured at: {}", timestamp.with_timezone(&chrono::Local).to_rfc3339());
            }
            println!("--------------------------");
        }
        OutputFormat::Json => {
            let payload = json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "identity": snapshot.identity,
                "telemetry": snapshot.telemetry,
            });
            let payload =
                serde_json::to_string(&payload).with_context(|| "Cannot serialize snapshot")?;
            println!("{payload}");
        }
    }
    Ok(())
}

// Link failures are worth a reconnect on the next tick, anything else is reported only.
fn needs_reconnect(err: &Error) -> bool {
    matches!(
        err.category(),
        ErrorCategory::Transport | ErrorCategory::Lifecycle
    ) || matches!(err, Error::Timeout)
}

pub async fn run<T: Transport>(
    session: &DeviceSession<T>,
    interval: Duration,
    format: OutputFormat,
) -> Result<()> {
    info!("Starting monitor mode: interval={interval:?}, format={format:?}");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if session.state() != ConnectionState::Ready {
            info!("Reconnecting to the device");
            if let Err(err) = session.connect().await {
                error!("Reconnecting failed: {err}");
                continue;
            }
        }

        match session.read_all().await {
            Ok(_) => print_snapshot(&session.current_snapshot(), format)?,
            Err(err) => {
                error!("Error reading telemetry: {err}");
                if needs_reconnect(&err) {
                    if let Err(err) = session.disconnect().await {
                        warn!("Disconnecting failed: {err}");
                    }
                }
            }
        }
    }
}
