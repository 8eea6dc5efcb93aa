//! I2C over the Linux i2c-dev interface.
//!
//! i2c-dev is a blocking ioctl interface, so each transaction runs on the
//! tokio blocking pool with owned buffers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use embedded_hal::i2c::{Error as _, ErrorKind, I2c as _};
use linux_embedded_hal::{I2CError, I2cdev};
use parking_lot::Mutex;

use crate::hw_trait::{I2c, I2cError, Result};
use crate::tracing::prelude::*;

/// An i2c-dev adapter such as `/dev/i2c-1`.
pub struct LinuxI2c {
    path: PathBuf,
    dev: Arc<Mutex<I2cdev>>,
}

impl LinuxI2c {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let dev = I2cdev::new(&path).map_err(|e| {
            I2cError::Other(format!("failed to open {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Opened I2C bus");
        Ok(Self {
            path,
            dev: Arc::new(Mutex::new(dev)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run<T, F>(&self, addr: u8, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut I2cdev) -> std::result::Result<T, I2CError> + Send + 'static,
    {
        let dev = Arc::clone(&self.dev);
        let result = tokio::task::spawn_blocking(move || op(&mut *dev.lock()))
            .await
            .map_err(|e| I2cError::Other(format!("I2C task failed: {}", e)))?;
        result.map_err(|e| map_error(e.kind(), addr, &e).into())
    }
}

fn map_error(kind: ErrorKind, addr: u8, detail: &dyn std::fmt::Display) -> I2cError {
    match kind {
        ErrorKind::NoAcknowledge(_) => I2cError::Nack(addr),
        ErrorKind::ArbitrationLoss => I2cError::ArbitrationLost,
        ErrorKind::Bus => I2cError::Bus,
        _ => I2cError::Other(detail.to_string()),
    }
}

#[async_trait]
impl I2c for LinuxI2c {
    async fn write(&mut self, addr: u8, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        self.run(addr, move |dev| dev.write(addr, &data)).await
    }

    async fn read(&mut self, addr: u8, buffer: &mut [u8]) -> Result<()> {
        let len = buffer.len();
        let data = self
            .run(addr, move |dev| {
                let mut data = vec![0u8; len];
                dev.read(addr, &mut data).map(|_| data)
            })
            .await?;
        buffer.copy_from_slice(&data);
        Ok(())
    }

    async fn write_read(&mut self, addr: u8, write: &[u8], read: &mut [u8]) -> Result<()> {
        let write = write.to_vec();
        let len = read.len();
        let data = self
            .run(addr, move |dev| {
                let mut data = vec![0u8; len];
                dev.write_read(addr, &write, &mut data).map(|_| data)
            })
            .await?;
        read.copy_from_slice(&data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::NoAcknowledgeSource;

    #[test]
    fn error_kinds_map_to_bus_errors() {
        let detail = "ioctl failed";
        for source in [
            NoAcknowledgeSource::Address,
            NoAcknowledgeSource::Data,
            NoAcknowledgeSource::Unknown,
        ] {
            assert_eq!(
                map_error(ErrorKind::NoAcknowledge(source), 0x4C, &detail),
                I2cError::Nack(0x4C)
            );
        }
        assert_eq!(
            map_error(ErrorKind::ArbitrationLoss, 0x4C, &detail),
            I2cError::ArbitrationLost
        );
        assert_eq!(map_error(ErrorKind::Bus, 0x4C, &detail), I2cError::Bus);
        assert_eq!(
            map_error(ErrorKind::Overrun, 0x4C, &detail),
            I2cError::Other("ioctl failed".into())
        );
        assert_eq!(
            map_error(ErrorKind::Other, 0x4C, &detail),
            I2cError::Other("ioctl failed".into())
        );
    }
}
