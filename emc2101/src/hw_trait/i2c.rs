//! I2C bus abstraction.

use async_trait::async_trait;
use thiserror::Error;

use super::Result;

/// Bus-level I2C failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum I2cError {
    /// Device did not acknowledge its address or a data byte
    #[error("no acknowledge from device 0x{0:02X}")]
    Nack(u8),

    /// Another controller won arbitration
    #[error("arbitration lost")]
    ArbitrationLost,

    /// Bus or controller fault
    #[error("bus error")]
    Bus,

    /// Transport-specific failure
    #[error("{0}")]
    Other(String),
}

/// An I2C controller.
///
/// Addresses are 7-bit. Implementations issue `write_read` as a single
/// combined transaction with a repeated start where the bus supports it.
#[async_trait]
pub trait I2c: Send {
    /// Write `data` to the device at `addr`.
    async fn write(&mut self, addr: u8, data: &[u8]) -> Result<()>;

    /// Fill `buffer` with bytes read from the device at `addr`.
    async fn read(&mut self, addr: u8, buffer: &mut [u8]) -> Result<()>;

    /// Write `write`, then read into `read`.
    async fn write_read(&mut self, addr: u8, write: &[u8], read: &mut [u8]) -> Result<()>;
}

#[async_trait]
impl<T: I2c + ?Sized> I2c for Box<T> {
    async fn write(&mut self, addr: u8, data: &[u8]) -> Result<()> {
        (**self).write(addr, data).await
    }

    async fn read(&mut self, addr: u8, buffer: &mut [u8]) -> Result<()> {
        (**self).read(addr, buffer).await
    }

    async fn write_read(&mut self, addr: u8, write: &[u8], read: &mut [u8]) -> Result<()> {
        (**self).write_read(addr, write, read).await
    }
}
