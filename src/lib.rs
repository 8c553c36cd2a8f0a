//! A library for reading the PZEM-004T power meter via Modbus RTU.
//!
//! The PZEM-004T measures voltage, current, active power, accumulated energy, line
//! frequency and power factor of a single phase. This crate provides:
//!
//! 1.  **Protocol layer**: Register map, decoding of the measurement block into a
//!     [`protocol::Measurement`], a range checked [`protocol::Address`] and the
//!     CRC-16 frame codec in [`frame`], needed for the vendor specific energy reset.
//!     It does no I/O and needs no feature.
//!
//! 2.  **High-Level, Safe Clients**: Stateful, thread-safe clients that are easy to share
//!     between tasks. See [`tokio_sync_safe_client::SafeClient`] (blocking) and
//!     [`tokio_async_safe_client::SafeClient`] (`async`).
//!
//! 3.  **Low-Level, Stateless Functions**: Functions that directly map to the device's
//!     commands and take the Modbus context or serial port as an argument. See the
//!     [`tokio_sync`] and [`tokio_async`] modules.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pzem004t_lib::{
//!     protocol::Address,
//!     tokio_common::{serial_port_builder, DEFAULT_BAUD_RATE},
//!     tokio_sync_safe_client::SafeClient,
//! };
//! use std::time::Duration;
//! use tokio_modbus::client::sync::rtu;
//! use tokio_modbus::Slave;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let builder = serial_port_builder("/dev/ttyUSB0", DEFAULT_BAUD_RATE, Duration::from_secs(1));
//!     let ctx = rtu::connect_slave(&builder, Slave(*Address::default()))?;
//!     let mut client = SafeClient::new(ctx);
//!
//!     let measurement = client.read_measurement()?;
//!     println!("{}", measurement);
//!
//!     Ok(())
//! }
//! ```
//!
//! Decoding without any transport:
//!
//! ```
//! use pzem004t_lib::protocol::Measurement;
//!
//! let m = Measurement::decode_from_input_registers(&[2200, 0, 1000, 0, 5000, 0, 1234, 500, 95, 0])?;
//! assert_eq!(m.voltage, 220.0);
//! assert_eq!(m.energy, 1234);
//! # Ok::<(), pzem004t_lib::protocol::Error>(())
//! ```

pub mod frame;
pub mod protocol;

#[cfg(any(feature = "tokio-rtu-sync", feature = "tokio-rtu"))]
pub mod tokio_common;

#[cfg_attr(docsrs, doc(cfg(feature = "tokio-rtu-sync")))]
#[cfg(feature = "tokio-rtu-sync")]
pub mod tokio_sync;

#[cfg_attr(docsrs, doc(cfg(feature = "tokio-rtu")))]
#[cfg(feature = "tokio-rtu")]
pub mod tokio_async;

#[cfg_attr(docsrs, doc(cfg(feature = "safe-client-sync")))]
#[cfg(feature = "safe-client-sync")]
pub mod tokio_sync_safe_client;

#[cfg_attr(docsrs, doc(cfg(feature = "safe-client-async")))]
#[cfg(feature = "safe-client-async")]
pub mod tokio_async_safe_client;
