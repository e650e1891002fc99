//! Bus connections: one shared handle per physical Modbus bus.
//!
//! A [`ModbusBus`] wraps a tokio-modbus client context behind an async mutex,
//! so every slave on the same wire serializes its operations. The connection
//! is opened lazily and dropped on any error; the next operation reconnects.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::error::Elapsed;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;

use fieldpoint_common::{Error, Result};

use crate::config::ConnectionConfig;
use crate::hwdef::RegisterKind;

/// Register/coil access to one physical bus, addressed by unit id.
///
/// The scan engine and the devices only ever talk to this trait; tests
/// substitute a scripted implementation (see [`crate::testing`]).
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Bulk-read `count` registers of the given kind starting at `addr`.
    async fn read_registers(
        &self,
        unit: u8,
        kind: RegisterKind,
        addr: u16,
        count: u16,
    ) -> Result<Vec<u16>>;

    /// Write a single coil.
    async fn write_coil(&self, unit: u8, addr: u16, value: bool) -> Result<()>;

    /// Write a single holding register.
    async fn write_register(&self, unit: u8, addr: u16, value: u16) -> Result<()>;

    /// Write a run of holding registers.
    async fn write_registers(&self, unit: u8, addr: u16, values: &[u16]) -> Result<()>;
}

/// Shared handle to a bus transport.
pub type BusHandle = Arc<dyn BusTransport>;

/// Real Modbus bus over TCP or RTU (serial).
pub struct ModbusBus {
    name: String,
    connection: ConnectionConfig,
    timeout: Duration,
    ctx: Mutex<Option<Context>>,
}

impl ModbusBus {
    pub fn new(name: impl Into<String>, connection: ConnectionConfig, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            connection,
            timeout,
            ctx: Mutex::new(None),
        }
    }

    /// Bus name from the topology config.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable endpoint (host or serial port) for snapshots.
    pub fn spec(&self) -> String {
        match &self.connection {
            ConnectionConfig::Tcp { host, .. } => host.clone(),
            ConnectionConfig::Rtu { port, .. } => port.clone(),
        }
    }

    /// Transport label for snapshots ("TCP" or "RTU").
    pub fn transport(&self) -> &'static str {
        match &self.connection {
            ConnectionConfig::Tcp { .. } => "TCP",
            ConnectionConfig::Rtu { .. } => "RTU",
        }
    }

    /// Open a fresh client context for this bus.
    async fn connect(&self) -> Result<Context> {
        match &self.connection {
            ConnectionConfig::Tcp { host, port } => {
                let addr: SocketAddr = format!("{}:{}", host, port)
                    .parse()
                    .map_err(|e| Error::Bus(format!("{}: invalid address: {}", self.name, e)))?;

                let ctx = tokio::time::timeout(self.timeout, tcp::connect(addr))
                    .await
                    .map_err(|_| Error::Bus(format!("{}: connection timeout", self.name)))?
                    .map_err(|e| Error::Bus(format!("{}: connect failed: {}", self.name, e)))?;

                Ok(ctx)
            }
            ConnectionConfig::Rtu {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => {
                let parity = match parity.to_lowercase().as_str() {
                    "none" => tokio_serial::Parity::None,
                    "even" => tokio_serial::Parity::Even,
                    "odd" => tokio_serial::Parity::Odd,
                    _ => tokio_serial::Parity::None,
                };

                let stop_bits = match stop_bits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                };

                let data_bits = match data_bits {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                };

                let builder = tokio_serial::new(port, *baud_rate)
                    .parity(parity)
                    .stop_bits(stop_bits)
                    .data_bits(data_bits);

                let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                    Error::Bus(format!("{}: serial open failed: {}", self.name, e))
                })?;

                Ok(rtu::attach(serial))
            }
        }
    }

    async fn ensure_connected(&self, slot: &mut Option<Context>) -> Result<()> {
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        Ok(())
    }

    /// Collapse the timeout-wrapped nested Modbus response into our error
    /// type.
    fn flatten<T, E1, E2>(
        &self,
        what: &str,
        response: std::result::Result<std::result::Result<std::result::Result<T, E2>, E1>, Elapsed>,
    ) -> Result<T>
    where
        E1: std::fmt::Display,
        E2: std::fmt::Debug,
    {
        match response {
            Err(_) => Err(Error::Bus(format!("{}: {} timeout", self.name, what))),
            Ok(Err(e)) => Err(Error::Bus(format!("{}: {} failed: {}", self.name, what, e))),
            Ok(Ok(Err(e))) => Err(Error::Bus(format!("{}: exception: {:?}", self.name, e))),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }
}

#[async_trait]
impl BusTransport for ModbusBus {
    async fn read_registers(
        &self,
        unit: u8,
        kind: RegisterKind,
        addr: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let mut guard = self.ctx.lock().await;
        self.ensure_connected(&mut guard).await?;
        let Some(ctx) = guard.as_mut() else {
            return Err(Error::Bus(format!("{}: not connected", self.name)));
        };
        ctx.set_slave(Slave(unit));

        let response = match kind {
            RegisterKind::Input => {
                tokio::time::timeout(self.timeout, ctx.read_input_registers(addr, count)).await
            }
            RegisterKind::Holding => {
                tokio::time::timeout(self.timeout, ctx.read_holding_registers(addr, count)).await
            }
        };

        let result = self.flatten("read", response);
        if result.is_err() {
            *guard = None;
        }
        result
    }

    async fn write_coil(&self, unit: u8, addr: u16, value: bool) -> Result<()> {
        let mut guard = self.ctx.lock().await;
        self.ensure_connected(&mut guard).await?;
        let Some(ctx) = guard.as_mut() else {
            return Err(Error::Bus(format!("{}: not connected", self.name)));
        };
        ctx.set_slave(Slave(unit));

        let response = tokio::time::timeout(self.timeout, ctx.write_single_coil(addr, value)).await;

        let result = self.flatten("write", response);
        if result.is_err() {
            *guard = None;
        }
        result
    }

    async fn write_register(&self, unit: u8, addr: u16, value: u16) -> Result<()> {
        let mut guard = self.ctx.lock().await;
        self.ensure_connected(&mut guard).await?;
        let Some(ctx) = guard.as_mut() else {
            return Err(Error::Bus(format!("{}: not connected", self.name)));
        };
        ctx.set_slave(Slave(unit));

        let response =
            tokio::time::timeout(self.timeout, ctx.write_single_register(addr, value)).await;

        let result = self.flatten("write", response);
        if result.is_err() {
            *guard = None;
        }
        result
    }

    async fn write_registers(&self, unit: u8, addr: u16, values: &[u16]) -> Result<()> {
        let mut guard = self.ctx.lock().await;
        self.ensure_connected(&mut guard).await?;
        let Some(ctx) = guard.as_mut() else {
            return Err(Error::Bus(format!("{}: not connected", self.name)));
        };
        ctx.set_slave(Slave(unit));

        let response =
            tokio::time::timeout(self.timeout, ctx.write_multiple_registers(addr, values)).await;

        let result = self.flatten("write", response);
        if result.is_err() {
            *guard = None;
        }
        result
    }
}
