//! Physical buses the drivers run over.
//!
//! Each transport implements the [`hw_trait`](crate::hw_trait) interfaces
//! for one kind of host controller.

#[cfg(target_os = "linux")]
pub mod linux_i2c;

#[cfg(target_os = "linux")]
pub use linux_i2c::LinuxI2c;
