//! Asynchronous `tokio-modbus` client for the PZEM-004T power meter.
//!
//! This module provides a low-level API (`PZEM004T` struct) to interact with
//! the PZEM-004T using Modbus RTU. It handles the conversion between Rust types
//! defined in the `crate::protocol` module and the raw Modbus register values.
//!
//! All client methods are `async` and must be `.await`ed.
//!
//! # Examples
//!
//! ```no_run
//! use pzem004t_lib::tokio_async::PZEM004T;
//! use pzem004t_lib::tokio_common::{serial_port_builder, DEFAULT_BAUD_RATE};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let builder = serial_port_builder("/dev/ttyUSB0", DEFAULT_BAUD_RATE, Duration::from_secs(1));
//!     let port = tokio_serial::SerialStream::open(&builder)?;
//!     let slave = tokio_modbus::Slave(1);
//!     let mut modbus_ctx = tokio_modbus::client::rtu::attach_slave(port, slave);
//!
//!     // Read all quantities with a timeout
//!     let result = tokio::time::timeout(
//!         Duration::from_secs(1),
//!         PZEM004T::read_measurement(&mut modbus_ctx),
//!     )
//!     .await;
//!
//!     match result {
//!         Ok(Ok(measurement)) => println!("Measurement: {}", measurement),
//!         Ok(Err(e)) => eprintln!("Modbus error: {}", e),
//!         Err(e) => eprintln!("Timeout error: {}", e),
//!     }
//!
//!     Ok(())
//! }
//! ```

use crate::{protocol as proto, tokio_common::Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_modbus::prelude::{Reader, Writer};

/// Asynchronous client for interacting with the PZEM-004T power meter.
///
/// All methods that interact with the device are `async` and return `Future`s.
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
    /// * `tokio_modbus::Error` if a Modbus communication error occurs.
    /// * `tokio_modbus::ExceptionCode` if the device answers with a Modbus exception.
    /// * [`proto::Error::InvalidRegisterCount`] if the device returns an unexpected number
    ///   of registers.
    pub async fn read_measurement(
        ctx: &mut tokio_modbus::client::Context,
    ) -> Result<proto::Measurement> {
        let words = Self::map_tokio_result(
            ctx.read_input_registers(proto::Measurement::ADDRESS, proto::Measurement::QUANTITY)
                .await,
        )?;
        log::trace!("Measurement registers: {words:?}");
        Ok(proto::Measurement::decode_from_input_registers(&words)?)
    }

    /// Sets a new Modbus device address.
    ///
    /// Must be sent to the **current** address, afterwards the device only answers
    /// on the new one.
    pub async fn set_address(
        ctx: &mut tokio_modbus::client::Context,
        new_address: proto::Address,
    ) -> Result<()> {
        Self::map_tokio_result(
            ctx.write_single_register(
                proto::Address::ADDRESS,
                new_address.encode_for_write_register(),
            )
            .await,
        )
    }

    /// Resets the accumulated energy counter of the device at `address`.
    ///
    /// Writes the request frame and collects the reply until `timeout` passes without
    /// new data. The returned response is for diagnostics only.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use pzem004t_lib::protocol::Address;
    /// use pzem004t_lib::tokio_async::PZEM004T;
    /// use std::time::Duration;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let builder = tokio_serial::new("/dev/ttyUSB0", 9600);
    /// let mut port = tokio_serial::SerialStream::open(&builder)?;
    /// let response = PZEM004T::reset_energy(&mut port, Address::default(), Duration::from_secs(1)).await?;
    /// println!("Raw response: {}", response);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn reset_energy<P>(
        port: &mut P,
        address: proto::Address,
        timeout: Duration,
    ) -> Result<proto::ResetEnergyResponse>
    where
        P: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let request = proto::ResetEnergy::encode_request(address);
        log::debug!("Sending reset energy frame {request:02X?} to {address}");
        port.write_all(&request).await?;
        port.flush().await?;

        let mut raw = Self::read_bytes(port, proto::ResetEnergy::FRAME_LENGTH, timeout).await?;
        if raw.get(1) == Some(&proto::ResetEnergy::ERROR_FUNCTION_CODE) {
            raw.extend(
                Self::read_bytes(
                    port,
                    proto::ResetEnergy::ERROR_REPLY_LENGTH - proto::ResetEnergy::FRAME_LENGTH,
                    timeout,
                )
                .await?,
            );
        }
        log::debug!("Reset energy response {raw:02X?}");
        Ok(proto::ResetEnergyResponse::new(raw))
    }

    /// Reads up to `max_count` bytes, stopping early at end of stream or when no data
    /// arrives within `timeout`.
    pub async fn read_bytes<R>(
        port: &mut R,
        max_count: usize,
        timeout: Duration,
    ) -> std::io::Result<Vec<u8>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buffer = vec![0u8; max_count];
        let mut filled = 0;
        while filled < max_count {
            match tokio::time::timeout(timeout, port.read(&mut buffer[filled..])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(count)) => filled += count,
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    log::trace!("Read timed out after {filled} of {max_count} bytes");
                    break;
                }
            }
        }
        buffer.truncate(filled);
        Ok(buffer)
    }
}
