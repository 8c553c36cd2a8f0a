//! PZEM-004T Power Meter CLI
//!
//! A command-line interface (CLI) application for interacting with PZEM-004T
//! single phase power meters using Modbus RTU.
//!
//! This tool allows users to:
//! - Read voltage, current, power, energy, frequency and power factor.
//! - Set the Modbus device address.
//! - Reset the accumulated energy counter.
//! - Run in a continuous daemon mode to poll one or more meters and either print
//!   the readings to the console or publish them to an MQTT broker.
//!
//! The CLI leverages the `pzem004t_lib` crate for protocol definitions and client operations.

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use pzem004t_lib::{
    tokio_common::serial_port_builder, tokio_sync::PZEM004T, tokio_sync_safe_client::SafeClient,
};
use std::io::{stdout, Write};
use std::time::Instant;
use std::{panic, time::Duration};

mod commandline;
mod daemon;
mod mqtt;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .context("Cannot init logging")?
        .start()
        .context("Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    Ok(log_handle)
}

macro_rules! print_measurement {
    ($client:expr) => {
        let measurement = $client
            .read_measurement()
            .with_context(|| "Cannot read measurement")?;
        println!("{}", measurement)
    };
}

/// Calculates the minimum recommended delay for Modbus RTU based on baud rate.
/// This is 3.5 character times.
fn minimum_rtu_delay(baud_rate: u32) -> Duration {
    // Modbus character time: start + 8 data + parity or second stop + stop
    let bits_per_char = 11.0;
    if baud_rate == 0 {
        return Duration::from_millis(16);
    }

    let char_time_secs = bits_per_char / baud_rate as f64;
    let inter_frame_delay_secs = 3.5 * char_time_secs;
    let delay_micros = (inter_frame_delay_secs * 1_000_000.0) as u64;

    // Modbus fixes the silence at 1.75 ms above 19200 baud.
    const MIN_INTER_FRAME_DELAY_MICROS: u64 = 1_750;
    Duration::from_micros(delay_micros.max(MIN_INTER_FRAME_DELAY_MICROS))
}

/// Checks if the user-provided RTU delay is sufficient; if not, uses the calculated minimum.
fn check_rtu_delay(user_delay: Duration, baud_rate: u32) -> Duration {
    let min_rtu_delay = minimum_rtu_delay(baud_rate);
    if user_delay < min_rtu_delay {
        warn!(
            "User-defined RTU delay of {user_delay:?} is below the recommended minimum of {min_rtu_delay:?} for {baud_rate} baud. Using minimum."
        );
        min_rtu_delay
    } else {
        user_delay
    }
}

/// Creates a new PZEM-004T client based on the provided command-line arguments.
fn create_client(args: &commandline::CliArgs) -> Result<SafeClient> {
    info!(
        "Attempting to connect via RTU to device {} (Address: {}, Baud: {})...",
        args.device, args.address, args.baud_rate
    );
    let ctx = tokio_modbus::client::sync::rtu::connect_slave(
        &serial_port_builder(&args.device, args.baud_rate, args.timeout),
        tokio_modbus::Slave(*args.address),
    )
    .with_context(|| format!("Cannot open serial port {}", args.device))?;
    let mut client = SafeClient::new(ctx);
    client.set_timeout(args.timeout);
    Ok(client)
}

/// Handles the reset energy command.
///
/// The current counter is shown first, then the vendor reset frame goes out on a
/// freshly opened raw port. A second read shows whether the counter was cleared.
fn handle_reset_energy(args: &commandline::CliArgs, delay: Duration) -> Result<()> {
    info!("Executing: Reset Energy for {}", args.address);
    println!(
        "WARNING: This will reset the accumulated energy counter of the meter at address {} to 0 Wh.",
        args.address
    );
    if !Confirm::new()
        .with_prompt("Are you sure you want to proceed with the energy reset?")
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")?
    {
        info!("Energy reset aborted by user.");
        return Ok(());
    }

    print!("Verifying current connection to device before reset... ");
    stdout().flush().context("Failed to flush stdout")?;
    {
        let mut client = create_client(args)?;
        match client.read_measurement() {
            Ok(measurement) => {
                println!("connection OK.");
                println!("Energy before reset: {} Wh", measurement.energy);
            }
            Err(err) => {
                println!("failed");
                return Err(err.into());
            }
        }
        // The Modbus context owns the port until it is dropped here.
    }
    std::thread::sleep(delay);

    info!("Sending reset energy command...");
    let mut port = serial_port_builder(&args.device, args.baud_rate, args.timeout)
        .open()
        .with_context(|| format!("Cannot open serial port {}", args.device))?;
    let response = PZEM004T::reset_energy(&mut *port, args.address, delay)
        .with_context(|| "Cannot send reset energy command")?;
    drop(port);

    println!("Raw response: {response}");
    if response.is_empty() {
        warn!("No response to the reset energy command");
    } else if response.is_echo_of(args.address) {
        debug!("Device acknowledged the reset energy command");
    } else if response.is_error_reply() {
        warn!("Device answered the reset energy command with an error reply");
    } else if !response.has_valid_crc() {
        warn!("Response to the reset energy command has an invalid checksum");
    } else {
        warn!("Unexpected response to the reset energy command");
    }
    std::thread::sleep(delay);

    let mut client = create_client(args)?;
    let measurement = client
        .read_measurement()
        .with_context(|| "Cannot read measurement after reset")?;
    println!("Energy after reset: {} Wh", measurement.energy);
    if measurement.energy != 0 {
        warn!("Energy counter was not cleared");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;
    info!(
        "PZEM-004T CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    let delay = check_rtu_delay(args.delay, args.baud_rate);

    match &args.command {
        commandline::CliCommands::Daemon {
            poll_interval,
            retry_interval,
            sensors,
            output,
        } => {
            let addresses = if sensors.is_empty() {
                vec![args.address]
            } else {
                sensors.clone()
            };
            let sensors: Vec<daemon::Sensor> = addresses
                .into_iter()
                .map(daemon::Sensor::from_address)
                .collect();
            info!(
                "Starting daemon mode: output={output:?}, interval={poll_interval:?}, retry={retry_interval:?}"
            );
            let mut client = create_client(&args)?;
            match output {
                commandline::DaemonOutput::Console => {
                    let mut schedule = daemon::Schedule::new(
                        sensors,
                        *poll_interval,
                        *retry_interval,
                        Instant::now(),
                    );
                    daemon::run(&mut client, &mut schedule, delay, |sensor, measurement| {
                        println!("[{}] {measurement}", sensor.name);
                        Ok(())
                    })?;
                }
                commandline::DaemonOutput::Mqtt { config_file } => {
                    mqtt::run_daemon(
                        &mut client,
                        sensors,
                        *poll_interval,
                        *retry_interval,
                        delay,
                        config_file,
                    )?;
                }
            }
        }
        commandline::CliCommands::Read => {
            info!("Executing: Read Measurement");
            let mut client = create_client(&args)?;
            print_measurement!(client);
        }
        commandline::CliCommands::SetAddress {
            address: new_address,
        } => {
            info!("Executing: Set Device Address to {new_address}");
            let mut client = create_client(&args)?;
            client
                .set_address(*new_address)
                .with_context(|| format!("Failed to set new address to {new_address}"))?;
            println!(
                "Device address successfully set to {new_address}. Subsequent communication must use this new address."
            );
            std::thread::sleep(delay);
            print_measurement!(client);
        }
        commandline::CliCommands::ResetEnergy => {
            handle_reset_energy(&args, delay)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_rtu_delay_calculation() {
        // 3.5 char times = 3.5 * 11 / baud = 38.5 / baud
        assert_eq!(minimum_rtu_delay(1200).as_micros(), 32083);
        assert_eq!(minimum_rtu_delay(2400).as_micros(), 16041);
        assert_eq!(minimum_rtu_delay(9600).as_micros(), 4010);
        assert_eq!(minimum_rtu_delay(19200).as_micros(), 2005);
        // 38.5 / 115200 is about 334 us
        assert_eq!(minimum_rtu_delay(115200).as_micros(), 1750);
        assert_eq!(minimum_rtu_delay(0), Duration::from_millis(16));
    }

    #[test]
    fn test_check_rtu_delay() {
        let min_delay_9600 = minimum_rtu_delay(9600);

        assert_eq!(check_rtu_delay(Duration::from_millis(3), 9600), min_delay_9600);
        assert_eq!(
            check_rtu_delay(Duration::from_millis(5), 9600),
            Duration::from_millis(5)
        );
        assert_eq!(check_rtu_delay(min_delay_9600, 9600), min_delay_9600);
    }
}
