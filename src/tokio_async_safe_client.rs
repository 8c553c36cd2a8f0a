//! Asynchronous `tokio-modbus` client for the PZEM-004T power meter.
//!
//! This module provides a high-level API (`SafeClient` struct) around a shared
//! Modbus RTU context guarded by a `tokio` mutex.
//!
//! All client methods are `async` and must be `.await`ed.

use crate::{protocol as proto, tokio_async, tokio_common::Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_modbus::{client::Context, slave::SlaveContext, Slave};

/// Asynchronous client for interacting with the PZEM-004T power meter over Modbus.
#[derive(Clone)]
pub struct SafeClient {
    ctx: Arc<Mutex<Context>>,
}

impl SafeClient {
    /// Creates a new `SafeClient` with a given `tokio-modbus` asynchronous context.
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx: Arc::new(Mutex::new(ctx)),
        }
    }

    /// Creates a new `SafeClient` from a shared `tokio-modbus` asynchronous context.
    pub fn from_shared(ctx: Arc<Mutex<Context>>) -> Self {
        Self { ctx }
    }

    /// Clones the shared `tokio-modbus` asynchronous context.
    pub fn clone_shared(&self) -> Arc<Mutex<Context>> {
        self.ctx.clone()
    }

    /// Addresses subsequent requests to another device on the same bus.
    pub async fn set_slave(&self, address: proto::Address) {
        self.ctx.lock().await.set_slave(Slave(*address));
    }

    /// Reads voltage, current, power, energy, frequency and power factor.
    pub async fn read_measurement(&self) -> Result<proto::Measurement> {
        let mut ctx = self.ctx.lock().await;
        tokio_async::PZEM004T::read_measurement(&mut ctx).await
    }

    /// Sets a new Modbus device address and retargets the shared context to it.
    pub async fn set_address(&self, new_address: proto::Address) -> Result<()> {
        let mut ctx = self.ctx.lock().await;
        tokio_async::PZEM004T::set_address(&mut ctx, new_address).await?;
        ctx.set_slave(Slave(*new_address));
        Ok(())
    }
}
