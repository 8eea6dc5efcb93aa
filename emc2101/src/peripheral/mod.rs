//! Peripheral chip drivers.
//!
//! Drivers are generic over the [`hw_trait`](crate::hw_trait) interfaces,
//! so they run over any bus that implements them.

pub mod emc2101;
