//! EMC2101 register map and transaction decoding.
//!
//! The chip only supports single-byte transfers, so multi-byte quantities
//! are split across register pairs. Two of those pairs are interlocked:
//! reading the external temperature MSB latches the LSB, and reading the
//! TACH LSB latches the MSB.

/// Default I2C address for EMC2101
pub const DEFAULT_ADDRESS: u8 = 0x4C;

/// Expected manufacturer ID (SMSC, now Microchip)
pub const EXPECTED_MFG_ID: u8 = 0x5D;

/// Product ID of the EMC2101
pub const PRODUCT_ID_EMC2101: u8 = 0x16;

/// Product ID of the EMC2101-R
pub const PRODUCT_ID_EMC2101_R: u8 = 0x28;

/// Largest value of the 6-bit fan drive setting
pub const MAX_LUT_SPEED: u8 = 0x3F;

/// Largest value of the 7-bit LUT temperature
pub const MAX_LUT_TEMP: u8 = 0x7F;

/// Number of (temperature, speed) pairs in the LUT
pub const LUT_ENTRIES: usize = 8;

/// TACH count to RPM numerator (datasheet section 6.14)
pub const FAN_RPM_DIVISOR: u32 = 5_400_000;

/// Raw 11-bit external reading when the diode pins are open
pub const TEMP_FAULT_OPEN_CIRCUIT: u16 = 0x3F8;

/// Raw 11-bit external reading when the diode is shorted
pub const TEMP_FAULT_SHORT: u16 = 0x3FF;

/// EMC2101 register addresses
pub mod regs {
    /// Internal temperature reading
    pub const INTERNAL_TEMP: u8 = 0x00;
    /// External temperature reading high byte (read first)
    pub const EXTERNAL_TEMP_MSB: u8 = 0x01;
    /// Status register, cleared on read
    pub const STATUS: u8 = 0x02;
    /// Configuration register
    pub const CONFIG: u8 = 0x03;
    /// Conversion rate register
    pub const CONVERSION_RATE: u8 = 0x04;
    /// Internal temperature high limit
    pub const INTERNAL_TEMP_LIMIT: u8 = 0x05;
    /// External temperature high limit high byte
    pub const EXT_HIGH_LIMIT_MSB: u8 = 0x07;
    /// External temperature low limit high byte
    pub const EXT_LOW_LIMIT_MSB: u8 = 0x08;
    /// External temperature force value
    pub const TEMP_FORCE: u8 = 0x0C;
    /// One-shot conversion trigger
    pub const ONE_SHOT: u8 = 0x0F;
    /// External temperature reading low byte
    pub const EXTERNAL_TEMP_LSB: u8 = 0x10;
    /// Scratchpad 1
    pub const SCRATCH_1: u8 = 0x11;
    /// Scratchpad 2
    pub const SCRATCH_2: u8 = 0x12;
    /// External temperature high limit low byte
    pub const EXT_HIGH_LIMIT_LSB: u8 = 0x13;
    /// External temperature low limit low byte
    pub const EXT_LOW_LIMIT_LSB: u8 = 0x14;
    /// Alert mask register
    pub const ALERT_MASK: u8 = 0x16;
    /// External diode ideality factor
    pub const EXT_IDEALITY: u8 = 0x17;
    /// External diode beta compensation
    pub const EXT_BETA_COMP: u8 = 0x18;
    /// Critical temperature limit (write once)
    pub const TCRIT_LIMIT: u8 = 0x19;
    /// Critical temperature hysteresis
    pub const TCRIT_HYST: u8 = 0x21;
    /// TACH reading low byte (read first)
    pub const TACH_LSB: u8 = 0x46;
    /// TACH reading high byte
    pub const TACH_MSB: u8 = 0x47;
    /// TACH limit low byte
    pub const TACH_LIMIT_LSB: u8 = 0x48;
    /// TACH limit high byte
    pub const TACH_LIMIT_MSB: u8 = 0x49;
    /// Fan configuration register
    pub const FAN_CONFIG: u8 = 0x4A;
    /// Fan spin-up configuration
    pub const FAN_SPINUP: u8 = 0x4B;
    /// Fan setting register (drive duty cycle)
    pub const FAN_SETTING: u8 = 0x4C;
    /// PWM frequency register
    pub const PWM_FREQ: u8 = 0x4D;
    /// PWM frequency divide register
    pub const PWM_DIV: u8 = 0x4E;
    /// LUT temperature hysteresis
    pub const FAN_TEMP_HYST: u8 = 0x4F;
    /// First LUT register (temperature of entry 0)
    pub const LUT_BASE: u8 = 0x50;
    /// Last LUT register (speed of entry 7)
    pub const LUT_END: u8 = 0x5F;
    /// Averaging filter and alert pin mode
    pub const AVG_FILTER: u8 = 0xBF;
    /// Product ID register
    pub const PRODUCT_ID: u8 = 0xFD;
    /// Manufacturer ID register
    pub const MFG_ID: u8 = 0xFE;
    /// Revision register
    pub const REVISION: u8 = 0xFF;
}

/// CONFIG register bits
pub mod config {
    /// Require three consecutive out-of-limit readings before alerting
    pub const QUEUE: u8 = 1 << 0;
    /// Unlock the one-time TCRIT limit write
    pub const TCRIT_OVERRIDE: u8 = 1 << 1;
    /// ALERT/TACH pin operates as TACH input
    pub const ALT_TACH: u8 = 1 << 2;
    /// Drive the fan output as a DAC voltage instead of PWM
    pub const DAC: u8 = 1 << 4;
    /// Keep the fan driven while in standby
    pub const FAN_STANDBY: u8 = 1 << 5;
    /// Standby: stop conversions
    pub const STANDBY: u8 = 1 << 6;
}

/// FAN_CONFIG register bits
pub mod fan_config {
    /// Use PWM_DIV instead of the preset clock
    pub const CLK_OVR: u8 = 1 << 2;
    /// Select the 1.4 kHz base clock instead of 360 kHz
    pub const CLK_SEL: u8 = 1 << 3;
    /// Invert the fan drive polarity
    pub const POLARITY: u8 = 1 << 4;
    /// LUT programming enabled (LUT not driving the fan)
    pub const PROG: u8 = 1 << 5;
    /// Feed TEMP_FORCE to the LUT instead of the measured temperature
    pub const FORCE: u8 = 1 << 6;
}

/// FAN_SPINUP register fields
pub mod spinup {
    /// Spin-up time, bits 2:0
    pub const TIME_MASK: u8 = 0x07;
    /// Spin-up drive, bits 4:3
    pub const DRIVE_MASK: u8 = 0x18;
    /// Spin-up drive shift
    pub const DRIVE_SHIFT: u8 = 3;
    /// End spin-up once the TACH limit is reached
    pub const TACH_LIMIT: u8 = 1 << 5;
}

/// AVG_FILTER register fields
pub mod avg_filter {
    /// ALERT pin acts as a comparator output
    pub const ALERT_COMPARATOR: u8 = 1 << 0;
    /// Filter level, bits 2:1
    pub const FILTER_MASK: u8 = 0x06;
    /// Filter level shift
    pub const FILTER_SHIFT: u8 = 1;
}

/// Mask of the 5-bit fields (PWM_FREQ, FAN_TEMP_HYST, EXT_IDEALITY, EXT_BETA_COMP)
pub const FIVE_BIT_MASK: u8 = 0x1F;

/// Mask of the 4-bit conversion rate field
pub const CONVERSION_RATE_MASK: u8 = 0x0F;

/// Fraction bits (0.5, 0.25, 0.125 degC) in the low byte of 11-bit temperatures
pub const FRACTION_MASK: u8 = 0xE0;

/// Shift of the fraction bits in the low byte
pub const FRACTION_SHIFT: u8 = 5;

/// Readable registers outside the LUT, in address order
pub const READABLE_REGISTERS: &[u8] = &[
    regs::INTERNAL_TEMP,
    regs::EXTERNAL_TEMP_MSB,
    regs::STATUS,
    regs::CONFIG,
    regs::CONVERSION_RATE,
    regs::INTERNAL_TEMP_LIMIT,
    regs::EXT_HIGH_LIMIT_MSB,
    regs::EXT_LOW_LIMIT_MSB,
    regs::TEMP_FORCE,
    regs::EXTERNAL_TEMP_LSB,
    regs::SCRATCH_1,
    regs::SCRATCH_2,
    regs::EXT_HIGH_LIMIT_LSB,
    regs::EXT_LOW_LIMIT_LSB,
    regs::ALERT_MASK,
    regs::EXT_IDEALITY,
    regs::EXT_BETA_COMP,
    regs::TCRIT_LIMIT,
    regs::TCRIT_HYST,
    regs::TACH_LSB,
    regs::TACH_MSB,
    regs::TACH_LIMIT_LSB,
    regs::TACH_LIMIT_MSB,
    regs::FAN_CONFIG,
    regs::FAN_SPINUP,
    regs::FAN_SETTING,
    regs::PWM_FREQ,
    regs::PWM_DIV,
    regs::FAN_TEMP_HYST,
    regs::AVG_FILTER,
    regs::PRODUCT_ID,
    regs::MFG_ID,
    regs::REVISION,
];

/// Get register name from address
pub fn register_name(addr: u8) -> String {
    let name = match addr {
        regs::INTERNAL_TEMP => "INTERNAL_TEMP",
        regs::EXTERNAL_TEMP_MSB => "EXTERNAL_TEMP_MSB",
        regs::STATUS => "STATUS",
        regs::CONFIG => "CONFIG",
        regs::CONVERSION_RATE => "CONVERSION_RATE",
        regs::INTERNAL_TEMP_LIMIT => "INTERNAL_TEMP_LIMIT",
        regs::EXT_HIGH_LIMIT_MSB => "EXT_HIGH_LIMIT_MSB",
        regs::EXT_LOW_LIMIT_MSB => "EXT_LOW_LIMIT_MSB",
        regs::TEMP_FORCE => "TEMP_FORCE",
        regs::ONE_SHOT => "ONE_SHOT",
        regs::EXTERNAL_TEMP_LSB => "EXTERNAL_TEMP_LSB",
        regs::SCRATCH_1 => "SCRATCH_1",
        regs::SCRATCH_2 => "SCRATCH_2",
        regs::EXT_HIGH_LIMIT_LSB => "EXT_HIGH_LIMIT_LSB",
        regs::EXT_LOW_LIMIT_LSB => "EXT_LOW_LIMIT_LSB",
        regs::ALERT_MASK => "ALERT_MASK",
        regs::EXT_IDEALITY => "EXT_IDEALITY",
        regs::EXT_BETA_COMP => "EXT_BETA_COMP",
        regs::TCRIT_LIMIT => "TCRIT_LIMIT",
        regs::TCRIT_HYST => "TCRIT_HYST",
        regs::TACH_LSB => "TACH_LSB",
        regs::TACH_MSB => "TACH_MSB",
        regs::TACH_LIMIT_LSB => "TACH_LIMIT_LSB",
        regs::TACH_LIMIT_MSB => "TACH_LIMIT_MSB",
        regs::FAN_CONFIG => "FAN_CONFIG",
        regs::FAN_SPINUP => "FAN_SPINUP",
        regs::FAN_SETTING => "FAN_SETTING",
        regs::PWM_FREQ => "PWM_FREQ",
        regs::PWM_DIV => "PWM_DIV",
        regs::FAN_TEMP_HYST => "FAN_TEMP_HYST",
        regs::LUT_BASE..=regs::LUT_END => {
            let offset = addr - regs::LUT_BASE;
            let kind = if offset % 2 == 0 { "TEMP" } else { "SPEED" };
            return format!("LUT{}_{}", offset / 2, kind);
        }
        regs::AVG_FILTER => "AVG_FILTER",
        regs::PRODUCT_ID => "PRODUCT_ID",
        regs::MFG_ID => "MFG_ID",
        regs::REVISION => "REVISION",
        _ => return format!("UNKNOWN[0x{:02x}]", addr),
    };
    name.to_string()
}

/// Decode temperature value (signed 8-bit)
pub fn decode_temperature(value: u8) -> String {
    let temp = value as i8;
    format!("{} degC", temp)
}

/// Decode a fan drive setting as a share of `full_speed`, the setting that
/// means 100% in the current output mode
pub fn decode_drive_percent(value: u8, full_speed: f32) -> String {
    let drive = (value & MAX_LUT_SPEED) as f32;
    let percent = drive * 100.0 / full_speed.max(1.0);
    format!("{:.0}% (0x{:02x})", percent, value)
}

/// Format an EMC2101 I2C transaction. Drive settings are decoded against
/// `full_speed`.
pub fn format_transaction(
    reg: u8,
    data: Option<&[u8]>,
    is_read: bool,
    full_speed: f32,
) -> String {
    let reg_name = register_name(reg);

    match (is_read, data) {
        (true, Some([value])) => {
            let value = *value;
            let decoded = match reg {
                regs::INTERNAL_TEMP
                | regs::EXTERNAL_TEMP_MSB
                | regs::INTERNAL_TEMP_LIMIT
                | regs::TCRIT_LIMIT
                | regs::TEMP_FORCE => format!("0x{:02x} ({})", value, decode_temperature(value)),
                regs::FAN_SETTING => decode_drive_percent(value, full_speed),
                regs::MFG_ID => format!(
                    "0x{:02x} ({})",
                    value,
                    if value == EXPECTED_MFG_ID {
                        "SMSC/Microchip"
                    } else {
                        "Unknown"
                    }
                ),
                regs::CONVERSION_RATE => {
                    let rate_desc = match value & CONVERSION_RATE_MASK {
                        0x00 => "1/16 Hz",
                        0x01 => "1/8 Hz",
                        0x02 => "1/4 Hz",
                        0x03 => "1/2 Hz",
                        0x04 => "1 Hz",
                        0x05 => "2 Hz",
                        0x06 => "4 Hz",
                        0x07 => "8 Hz",
                        0x08 => "16 Hz",
                        _ => "32 Hz",
                    };
                    format!("0x{:02x} ({})", value, rate_desc)
                }
                _ => format!("0x{:02x}", value),
            };
            format!("-> READ {}={}", reg_name, decoded)
        }
        (true, Some(data)) => format!("-> READ {}={:02x?}", reg_name, data),
        (true, None) => format!("-> READ {}", reg_name),
        (false, Some([value])) => {
            let decoded = match reg {
                regs::FAN_SETTING => decode_drive_percent(*value, full_speed),
                regs::LUT_BASE..=regs::LUT_END if (reg - regs::LUT_BASE) % 2 == 1 => {
                    decode_drive_percent(*value, full_speed)
                }
                _ => format!("0x{:02x}", value),
            };
            format!("<- WRITE {}={}", reg_name, decoded)
        }
        (false, Some(data)) => format!("<- WRITE {}={:02x?}", reg_name, data),
        (false, None) => format!("<- WRITE REG[0x{:02x}]", reg),
    }
}
