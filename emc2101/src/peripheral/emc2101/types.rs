//! Typed values for EMC2101 register fields.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hw_trait::{HwError, Result};

/// Fan speed percentage (0-100)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Percent(u8);

impl Percent {
    /// Creates a new percentage, clamping to 0-100 range
    pub const fn new_clamped(value: u8) -> Self {
        if value > 100 { Self(100) } else { Self(value) }
    }

    /// Creates a new percentage if value is in range
    pub const fn new(value: u8) -> Option<Self> {
        if value <= 100 {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Zero speed (0%)
    pub const ZERO: Self = Self(0);

    /// Full speed (100%)
    pub const FULL: Self = Self(100);

    /// Scale `full` by this percentage, rounding to the nearest step (ties
    /// to even).
    pub fn of(self, full: f32) -> u8 {
        (self.0 as f32 / 100.0 * full).round_ties_even() as u8
    }
}

impl From<Percent> for u8 {
    fn from(p: Percent) -> u8 {
        p.0
    }
}

impl TryFrom<u8> for Percent {
    type Error = HwError;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value).ok_or_else(|| {
            HwError::InvalidParameter(format!("Percent value {} out of range 0-100", value))
        })
    }
}

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Implements `TryFrom<u8>` and `From<Self> for u8` for a fieldless
/// register enum with explicit discriminants.
macro_rules! register_enum {
    ($name:ident, $what:literal, { $($variant:ident = $value:literal),+ $(,)? }) => {
        impl TryFrom<u8> for $name {
            type Error = HwError;

            fn try_from(value: u8) -> Result<Self> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    _ => Err(HwError::InvalidParameter(format!(
                        "{} value {} out of range",
                        $what, value
                    ))),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                value as u8
            }
        }
    };
}

/// Temperature conversion rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConversionRate {
    /// One conversion every 16 seconds
    #[serde(rename = "1/16")]
    Rate1_16 = 0,
    #[serde(rename = "1/8")]
    Rate1_8 = 1,
    #[serde(rename = "1/4")]
    Rate1_4 = 2,
    #[serde(rename = "1/2")]
    Rate1_2 = 3,
    #[serde(rename = "1")]
    Rate1 = 4,
    #[serde(rename = "2")]
    Rate2 = 5,
    #[serde(rename = "4")]
    Rate4 = 6,
    #[serde(rename = "8")]
    Rate8 = 7,
    /// Power-on default
    #[default]
    #[serde(rename = "16")]
    Rate16 = 8,
    #[serde(rename = "32")]
    Rate32 = 9,
}

register_enum!(ConversionRate, "Conversion rate", {
    Rate1_16 = 0,
    Rate1_8 = 1,
    Rate1_4 = 2,
    Rate1_2 = 3,
    Rate1 = 4,
    Rate2 = 5,
    Rate4 = 6,
    Rate8 = 7,
    Rate16 = 8,
    Rate32 = 9,
});

impl ConversionRate {
    /// Decode the 4-bit register field. Codes above 9 select 32 Hz.
    pub fn from_field(value: u8) -> Self {
        Self::try_from(value & 0x0F).unwrap_or(Self::Rate32)
    }

    /// Conversions per second
    pub fn hz(self) -> f32 {
        (1u32 << (self as u8)) as f32 / 16.0
    }
}

/// Drive level applied while the fan spins up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SpinupDrive {
    /// No spin-up boost
    Bypass = 0,
    Drive50 = 1,
    Drive75 = 2,
    #[default]
    Drive100 = 3,
}

register_enum!(SpinupDrive, "Spin-up drive", {
    Bypass = 0,
    Drive50 = 1,
    Drive75 = 2,
    Drive100 = 3,
});

impl fmt::Display for SpinupDrive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bypass => write!(f, "Disabled"),
            Self::Drive50 => write!(f, "50% Duty Cycle"),
            Self::Drive75 => write!(f, "75% Duty Cycle"),
            Self::Drive100 => write!(f, "100% Duty Cycle"),
        }
    }
}

/// Duration of the spin-up boost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SpinupTime {
    /// No spin-up boost
    Bypass = 0,
    Spin0_05Sec = 1,
    Spin0_1Sec = 2,
    Spin0_2Sec = 3,
    Spin0_4Sec = 4,
    Spin0_8Sec = 5,
    #[default]
    Spin1_6Sec = 6,
    Spin3_2Sec = 7,
}

register_enum!(SpinupTime, "Spin-up time", {
    Bypass = 0,
    Spin0_05Sec = 1,
    Spin0_1Sec = 2,
    Spin0_2Sec = 3,
    Spin0_4Sec = 4,
    Spin0_8Sec = 5,
    Spin1_6Sec = 6,
    Spin3_2Sec = 7,
});

impl SpinupTime {
    /// Spin-up duration in milliseconds
    pub fn millis(self) -> u32 {
        match self {
            Self::Bypass => 0,
            other => 50 << (other as u8 - 1),
        }
    }
}

/// Digital averaging applied to external temperature readings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AveragingFilter {
    #[default]
    Disabled = 0,
    Level1 = 1,
    Level2 = 2,
}

impl AveragingFilter {
    /// Decode the 2-bit field. Both codes with bit 1 set select level 2.
    pub fn from_field(value: u8) -> Self {
        match value & 0x03 {
            0 => Self::Disabled,
            1 => Self::Level1,
            _ => Self::Level2,
        }
    }
}

/// External diode failure reported through the temperature reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiodeFault {
    /// DP/DN pins are not connected
    OpenCircuit,
    /// DP and DN are shorted together or to ground
    Short,
}

impl fmt::Display for DiodeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenCircuit => write!(f, "open circuit"),
            Self::Short => write!(f, "short circuit"),
        }
    }
}

/// Snapshot of the STATUS register.
///
/// The chip clears STATUS when it is read, so a second read only shows
/// conditions that are still present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status(u8);

impl Status {
    /// ADC conversion in progress
    pub const BUSY: u8 = 1 << 7;
    /// Internal temperature above its high limit
    pub const INT_HIGH: u8 = 1 << 6;
    /// Error loading defaults at power-up
    pub const EEPROM: u8 = 1 << 5;
    /// External temperature above its high limit
    pub const EXT_HIGH: u8 = 1 << 4;
    /// External temperature below its low limit
    pub const EXT_LOW: u8 = 1 << 3;
    /// External diode open or shorted
    pub const FAULT: u8 = 1 << 2;
    /// External temperature at or above TCRIT
    pub const TCRIT: u8 = 1 << 1;
    /// TACH count above the TACH limit (fan too slow)
    pub const TACH: u8 = 1 << 0;

    /// Bits that indicate an alert condition
    pub const ALERT: u8 = Self::INT_HIGH
        | Self::EEPROM
        | Self::EXT_HIGH
        | Self::EXT_LOW
        | Self::FAULT
        | Self::TCRIT
        | Self::TACH;

    const NAMES: [(u8, &'static str); 8] = [
        (Self::BUSY, "BUSY"),
        (Self::INT_HIGH, "INT_HIGH"),
        (Self::EEPROM, "EEPROM"),
        (Self::EXT_HIGH, "EXT_HIGH"),
        (Self::EXT_LOW, "EXT_LOW"),
        (Self::FAULT, "FAULT"),
        (Self::TCRIT, "TCRIT"),
        (Self::TACH, "TACH"),
    ];

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, mask: u8) -> bool {
        self.0 & mask == mask
    }

    /// True if any alert bit is set
    pub const fn is_alert(self) -> bool {
        self.0 & Self::ALERT != 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "0x{:02X} (clear)", self.0)
        } else {
            write!(f, "0x{:02X} ({})", self.0, set.join("|"))
        }
    }
}
