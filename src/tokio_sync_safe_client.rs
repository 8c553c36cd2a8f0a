//! Synchronous `tokio-modbus` client for the PZEM-004T power meter.
//!
//! This module provides a high-level API (`SafeClient` struct) around a shared,
//! lock-protected Modbus RTU context. It can be cloned and handed to several
//! threads, for example one per sensor on a shared RS485 bus.
//!
//! ## Example
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
//!     println!("Measurement: {}", measurement);
//!
//!     Ok(())
//! }
//! ```

use crate::{protocol as proto, tokio_common::Result, tokio_sync};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_modbus::{client::sync::Context, slave::SlaveContext, Slave};

/// Synchronous client for interacting with the PZEM-004T power meter over Modbus.
#[derive(Clone)]
pub struct SafeClient {
    ctx: Arc<Mutex<Context>>,
}

impl SafeClient {
    /// Creates a new `SafeClient` with a given `tokio-modbus` synchronous context.
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx: Arc::new(Mutex::new(ctx)),
        }
    }

    /// Creates a new `SafeClient` from a shared `tokio-modbus` synchronous context.
    pub fn from_shared(ctx: Arc<Mutex<Context>>) -> Self {
        Self { ctx }
    }

    /// Clones the shared `tokio-modbus` synchronous context.
    pub fn clone_shared(&self) -> Arc<Mutex<Context>> {
        self.ctx.clone()
    }

    // A panic while holding the lock leaves the context itself intact.
    fn lock(&self) -> MutexGuard<'_, Context> {
        self.ctx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the timeout for Modbus communication.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.lock().set_timeout(timeout);
    }

    /// Retrieves the current Modbus communication timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.lock().timeout()
    }

    /// Addresses subsequent requests to another device on the same bus.
    pub fn set_slave(&mut self, address: proto::Address) {
        self.lock().set_slave(Slave(*address));
    }

    /// Reads voltage, current, power, energy, frequency and power factor.
    pub fn read_measurement(&mut self) -> Result<proto::Measurement> {
        let mut ctx = self.lock();
        tokio_sync::PZEM004T::read_measurement(&mut ctx)
    }

    /// Sets a new Modbus device address.
    ///
    /// A successful call makes the existing `Context` invalid (as it
    /// still points to the old address). This function automatically
    /// updates the slave ID within its managed `Context`.
    pub fn set_address(&mut self, new_address: proto::Address) -> Result<()> {
        let mut ctx = self.lock();
        tokio_sync::PZEM004T::set_address(&mut ctx, new_address)?;
        ctx.set_slave(Slave(*new_address));
        Ok(())
    }
}
