//! Driver for the Microchip EMC2101 fan controller and temperature sensor.
//!
//! The [`Emc2101`] driver talks to the chip through the async
//! [`I2c`](hw_trait::I2c) trait. [`transport::LinuxI2c`] provides that trait
//! over Linux i2c-dev and [`SimulatedEmc2101`] over an in-memory register
//! file.
//!
//! ```no_run
//! # async fn example() -> emc2101::hw_trait::Result<()> {
//! use emc2101::{Emc2101, Percent, transport::LinuxI2c};
//!
//! let mut fan = Emc2101::new(LinuxI2c::open("/dev/i2c-1")?);
//! fan.init().await?;
//! fan.set_manual_fan_speed(Percent::new_clamped(60)).await?;
//! println!("{} RPM", fan.get_rpm().await?);
//! # Ok(())
//! # }
//! ```

pub mod hw_trait;
pub mod peripheral;
pub mod tracing;
pub mod transport;

pub use peripheral::emc2101::{
    Emc2101, Emc2101Config, FanSpeedLut, Percent, sim::SimulatedEmc2101,
};
