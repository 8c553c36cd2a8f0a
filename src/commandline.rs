use crate::mqtt::MqttConfig;
use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use pzem004t_lib::{protocol as proto, tokio_common::DEFAULT_BAUD_RATE};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

pub fn parse_address(s: &str) -> Result<proto::Address, String> {
    let address_val =
        clap_num::maybe_hex::<u16>(s).map_err(|e| format!("Invalid address format: {e}"))?;
    proto::Address::try_from(address_val).map_err(|e| e.to_string())
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously read measurements and print them to the standard output (console).
    Console,
    /// Continuously read measurements and publish them to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run in daemon mode: continuously poll one or more power meters.
    /// Several meters may share the bus, each needs its own address.
    /// A failed read, or a reading where every value is zero, is retried
    /// after the retry interval instead of the poll interval.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Interval for fetching measurements (e.g., "10s", "1m")
        #[arg(value_parser = humantime::parse_duration, short, long, default_value = "60s")]
        poll_interval: Duration,

        /// Interval before retrying a failed read (e.g., "2s")
        #[arg(value_parser = humantime::parse_duration, short, long, default_value = "2s")]
        retry_interval: Duration,

        /// Comma separated addresses of the meters to poll.
        /// Defaults to the global --address. A `sensors` list in the
        /// MQTT config file takes precedence over these addresses.
        #[arg(long, value_delimiter = ',', value_parser = parse_address, verbatim_doc_comment)]
        sensors: Vec<proto::Address>,

        /// Specifies the output.
        #[command(subcommand)]
        output: DaemonOutput,
    },

    /// Read and display voltage, current, power, energy, frequency and power factor.
    Read,

    /// Set a new Modbus RTU device address for the meter.
    /// The new address must be unique on the RS485 bus (1-247) to avoid conflicts.
    /// **Important:** After changing the address, you must use the new address
    /// for subsequent communication with this device.
    #[clap(verbatim_doc_comment)]
    SetAddress {
        /// The new Modbus RTU device address (1 to 247).
        /// Can be specified in decimal or hexadecimal (e.g., "0x01" to "0xF7").
        #[arg(value_parser = parse_address, verbatim_doc_comment)]
        address: proto::Address,
    },

    /// Reset the accumulated energy counter of the meter to zero.
    /// **Warning:** This is an irreversible operation.
    #[clap(verbatim_doc_comment)]
    ResetEnergy,
}

const fn about_text() -> &'static str {
    "PZEM-004T Power Meter CLI - Read and configure PZEM-004T power meters via Modbus RTU."
}

#[derive(Parser, Debug)]
#[command(name="pzemcol", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Serial port device name.
    /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
    #[arg(global = true, short, long, default_value_t = default_device_name(), verbatim_doc_comment)]
    pub device: String,

    /// Baud rate for serial communication.
    /// The PZEM-004T v3 only talks 9600 baud.
    #[arg(global = true, long, default_value_t = DEFAULT_BAUD_RATE, verbatim_doc_comment)]
    pub baud_rate: u32,

    /// The Modbus RTU device address, ranging from 1 to 247.
    /// Can be specified in decimal or hexadecimal.
    #[arg(global = true, short, long, default_value_t = proto::Address::default(), value_parser = parse_address, verbatim_doc_comment)]
    pub address: proto::Address,

    /// Modbus I/O timeout for read/write operations.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, default_value = "1s", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,

    /// Minimum delay between multiple Modbus commands sent on the bus.
    /// Important for Modbus RTU, especially with USB-to-RS485 converters that need time
    /// to switch between transmitting (TX) and receiving (RX) modes.
    /// Examples: "50ms", "100ms".
    #[arg(global = true, long, default_value = "100ms", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub delay: Duration,

    /// The command to execute.
    #[command(subcommand)]
    pub command: CliCommands,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn parse_address_formats() {
        assert_eq!(*parse_address("1").unwrap(), 1);
        assert_eq!(*parse_address("0xF7").unwrap(), 247);
        assert_eq!(*parse_address("0xa5").unwrap(), 0xA5);
        assert!(parse_address("0").is_err());
        assert!(parse_address("248").is_err());
        assert!(parse_address("300").is_err());
        assert!(parse_address("abc").is_err());
    }

    #[test]
    fn parse_read_defaults() {
        let args = CliArgs::try_parse_from(["pzemcol", "read"]).unwrap();
        assert_eq!(args.command, CliCommands::Read);
        assert_eq!(args.address, proto::Address::default());
        assert_eq!(args.baud_rate, 9600);
        assert_eq!(args.timeout, Duration::from_secs(1));
    }

    #[test]
    fn parse_set_address() {
        let args =
            CliArgs::try_parse_from(["pzemcol", "--address", "3", "set-address", "0x10"]).unwrap();
        assert_eq!(*args.address, 3);
        assert_eq!(
            args.command,
            CliCommands::SetAddress {
                address: proto::Address::try_from(0x10u8).unwrap()
            }
        );
        assert!(CliArgs::try_parse_from(["pzemcol", "set-address", "0"]).is_err());
    }

    #[test]
    fn parse_daemon() {
        let args = CliArgs::try_parse_from([
            "pzemcol",
            "daemon",
            "--poll-interval",
            "10s",
            "--sensors",
            "1,0xA5",
            "console",
        ])
        .unwrap();
        match args.command {
            CliCommands::Daemon {
                poll_interval,
                retry_interval,
                sensors,
                output,
            } => {
                assert_eq!(poll_interval, Duration::from_secs(10));
                assert_eq!(retry_interval, Duration::from_secs(2));
                assert_eq!(sensors.iter().map(|a| **a).collect::<Vec<_>>(), [1, 0xA5]);
                assert_eq!(output, DaemonOutput::Console);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
