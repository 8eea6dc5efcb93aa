//! Hardware interface traits.
//!
//! Peripheral drivers are written against these traits rather than a
//! concrete bus, so the same driver runs over Linux i2c-dev or the
//! in-memory simulator used by the tests.

pub mod i2c;

pub use i2c::{I2c, I2cError};

use thiserror::Error;

use crate::peripheral::emc2101::{DiodeFault, Status};

/// Errors raised by hardware drivers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HwError {
    /// Bus-level transaction failure
    #[error("I2C error: {0}")]
    I2c(#[from] I2cError),

    /// Value outside the range a register field can hold
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Identity registers did not match the expected part
    #[error("Device not detected: manufacturer 0x{mfg_id:02X}, product 0x{product_id:02X}")]
    NotDetected { mfg_id: u8, product_id: u8 },

    /// Status register reported an alert condition
    #[error("Status alert: {0}")]
    Alert(Status),

    /// External temperature diode is disconnected or shorted
    #[error("External diode fault: {0}")]
    DiodeFault(DiodeFault),

    /// Read-back value is impossible for the field
    #[error("Corrupt register data: {0}")]
    Corrupt(String),
}

/// Result type for hardware operations.
pub type Result<T> = std::result::Result<T, HwError>;
