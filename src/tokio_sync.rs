//! Synchronous `tokio-modbus` client for the PZEM-004T power meter.
//!
//! This module provides a low-level API (`PZEM004T` struct) to interact with
//! the PZEM-004T using Modbus RTU. It handles the conversion between Rust types
//! defined in the `crate::protocol` module and the raw Modbus register values.
//!
//! The energy reset is a vendor command outside of the standard function codes. It
//! is written as a raw frame to a plain serial port instead of a Modbus context.
//!
//! # Examples
//!
//! ```no_run
//! use pzem004t_lib::tokio_sync::PZEM004T;
//! use pzem004t_lib::tokio_common::{serial_port_builder, DEFAULT_BAUD_RATE};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let builder = serial_port_builder("/dev/ttyUSB0", DEFAULT_BAUD_RATE, Duration::from_secs(1));
//!     let slave = tokio_modbus::Slave(1);
//!     let mut modbus_ctx = tokio_modbus::client::sync::rtu::connect_slave(&builder, slave)?;
//!     modbus_ctx.set_timeout(Some(Duration::from_secs(1)));
//!
//!     let measurement = PZEM004T::read_measurement(&mut modbus_ctx)?;
//!     println!("Measurement: {}", measurement);
//!
//!     Ok(())
//! }
//! ```

use crate::{protocol as proto, tokio_common::Result};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tokio_modbus::prelude::{SyncReader, SyncWriter};

/// Synchronous client for interacting with the PZEM-004T power meter.
///
/// All methods that interact with the device will block the current thread.
#[derive(Debug)]
pub struct PZEM004T;

impl PZEM004T {
    /// Helper function to map tokio result to our result.
    fn map_tokio_result<T>(result: tokio_modbus::Result<T>) -> Result<T> {
        match result {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(err.into()), // Modbus exception
            Err(err) => Err(err.into()),     // IO error
        }
    }

    /// Reads all electrical quantities with a single read-input-registers request.
    ///
    /// # Errors
    ///
    /// * `tokio_modbus::Error` if a Modbus communication error occurs (e.g., IO error, timeout).
    /// * `tokio_modbus::ExceptionCode` if the device answers with a Modbus exception.
    /// * [`proto::Error::InvalidRegisterCount`] if the device returns an unexpected number
    ///   of registers.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use pzem004t_lib::tokio_sync::PZEM004T;
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let builder = tokio_serial::new("/dev/ttyUSB0", 9600);
    /// # let mut modbus_ctx = tokio_modbus::client::sync::rtu::connect_slave(&builder, tokio_modbus::Slave(1))?;
    /// let measurement = PZEM004T::read_measurement(&mut modbus_ctx)?;
    /// println!("Voltage: {:.1} V, power: {:.1} W", measurement.voltage, measurement.power);
    /// # Ok(())
    /// # }
    /// ```
    pub fn read_measurement(
        ctx: &mut tokio_modbus::client::sync::Context,
    ) -> Result<proto::Measurement> {
        let words = Self::map_tokio_result(
            ctx.read_input_registers(proto::Measurement::ADDRESS, proto::Measurement::QUANTITY),
        )?;
        log::trace!("Measurement registers: {words:?}");
        Ok(proto::Measurement::decode_from_input_registers(&words)?)
    }

    /// Sets a new Modbus device address.
    ///
    /// **Warning:**
    /// * This command must be sent while addressing the device using its **current** address.
    /// * After a successful change, subsequent communication **must** use the new address.
    ///
    /// The range check already happened when the [`proto::Address`] was constructed.
    ///
    /// # Errors
    ///
    /// * `tokio_modbus::Error` for Modbus communication errors.
    /// * `tokio_modbus::ExceptionCode` if the device rejects the write.
    pub fn set_address(
        ctx: &mut tokio_modbus::client::sync::Context,
        new_address: proto::Address,
    ) -> Result<()> {
        Self::map_tokio_result(ctx.write_single_register(
            proto::Address::ADDRESS,
            new_address.encode_for_write_register(),
        ))
    }

    /// Resets the accumulated energy counter of the device at `address`.
    ///
    /// The request frame is written to `port`, then after waiting `settle` the reply
    /// is collected until the port times out. The returned
    /// [`proto::ResetEnergyResponse`] is for diagnostics only, a reply does not
    /// confirm that the counter was cleared.
    ///
    /// # Arguments
    ///
    /// * `port` - A raw serial port opened with a read timeout, see
    ///   [`crate::tokio_common::serial_port_builder`].
    /// * `address` - Address of the device to reset.
    /// * `settle` - Time the device gets to answer before reading starts.
    ///
    /// # Errors
    ///
    /// * [`crate::tokio_common::Error::Io`] if writing the frame or reading the port fails
    ///   for another reason than a timeout.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use pzem004t_lib::protocol::Address;
    /// use pzem004t_lib::tokio_common::{serial_port_builder, DEFAULT_BAUD_RATE};
    /// use pzem004t_lib::tokio_sync::PZEM004T;
    /// use std::time::Duration;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut port = serial_port_builder("/dev/ttyUSB0", DEFAULT_BAUD_RATE, Duration::from_secs(1)).open()?;
    /// let response = PZEM004T::reset_energy(&mut *port, Address::default(), Duration::from_millis(100))?;
    /// println!("Raw response: {}", response);
    /// # Ok(())
    /// # }
    /// ```
    pub fn reset_energy<P>(
        port: &mut P,
        address: proto::Address,
        settle: Duration,
    ) -> Result<proto::ResetEnergyResponse>
    where
        P: Read + Write + ?Sized,
    {
        let request = proto::ResetEnergy::encode_request(address);
        log::debug!("Sending reset energy frame {request:02X?} to {address}");
        port.write_all(&request)?;
        port.flush()?;
        std::thread::sleep(settle);

        let mut raw = Self::read_bytes(port, proto::ResetEnergy::FRAME_LENGTH)?;
        if raw.get(1) == Some(&proto::ResetEnergy::ERROR_FUNCTION_CODE) {
            raw.extend(Self::read_bytes(
                port,
                proto::ResetEnergy::ERROR_REPLY_LENGTH - proto::ResetEnergy::FRAME_LENGTH,
            )?);
        }
        log::debug!("Reset energy response {raw:02X?}");
        Ok(proto::ResetEnergyResponse::new(raw))
    }

    /// Reads up to `max_count` bytes, stopping early at end of stream or when the port
    /// times out.
    ///
    /// There is no timeout argument: `std::io::Read` has no per-call deadline, so every
    /// single read is bounded by the timeout the port was opened with (see
    /// [`crate::tokio_common::serial_port_builder`]). A port without a read timeout
    /// blocks until `max_count` bytes or end of stream arrive.
    pub fn read_bytes<R>(port: &mut R, max_count: usize) -> std::io::Result<Vec<u8>>
    where
        R: Read + ?Sized,
    {
        let mut buffer = vec![0u8; max_count];
        let mut filled = 0;
        while filled < max_count {
            match port.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    log::trace!("Read timed out after {filled} of {max_count} bytes");
                    break;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        buffer.truncate(filled);
        Ok(buffer)
    }
}
