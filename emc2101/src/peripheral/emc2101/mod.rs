//! EMC2101 PWM fan controller and temperature sensor driver.
//!
//! The EMC2101 is an I2C fan controller with integrated temperature sensing.
//! It can monitor external temperature via a diode-connected transistor and
//! control fan speed using PWM or DAC output, either from a manual setting
//! or from an on-chip temperature to drive lookup table (LUT).
//!
//! Datasheet: <https://www.microchip.com/en-us/product/emc2101>

mod alert;
mod config;
mod lut;
pub mod protocol;
pub mod sim;
mod types;

pub use config::{ConfigError, Emc2101Config, ExternalLimits, PwmClock};
pub use lut::FanSpeedLut;
pub use protocol::DEFAULT_ADDRESS;
pub use types::{
    AveragingFilter, ConversionRate, DiodeFault, Percent, SpinupDrive, SpinupTime, Status,
};

use crate::{
    hw_trait::{HwError, Result, i2c::I2c},
    tracing::prelude::*,
};
use protocol::{
    EXPECTED_MFG_ID, FAN_RPM_DIVISOR, FIVE_BIT_MASK, FRACTION_SHIFT, MAX_LUT_SPEED,
    PRODUCT_ID_EMC2101, PRODUCT_ID_EMC2101_R, READABLE_REGISTERS, TEMP_FAULT_OPEN_CIRCUIT,
    TEMP_FAULT_SHORT, config as config_bits, fan_config, format_transaction, regs, spinup,
};

/// Base PWM clock with CLK_SEL clear
const PWM_CLOCK_FAST_HZ: f32 = 360_000.0;

/// Base PWM clock with CLK_SEL set
const PWM_CLOCK_SLOW_HZ: f32 = 1_400.0;

/// Drive setting that corresponds to 100% fan output.
///
/// In DAC mode the full 6-bit range is used. In PWM mode the duty cycle
/// reaches 100% at twice the PWM_FREQ value, and PWM_FREQ 0 behaves as 1.
pub fn full_speed_setting(dac: bool, pwm_freq: u8) -> f32 {
    if dac {
        MAX_LUT_SPEED as f32
    } else {
        2.0 * (pwm_freq & FIVE_BIT_MASK).max(1) as f32
    }
}

/// EMC2101 driver
pub struct Emc2101<I: I2c> {
    i2c: I,
    address: u8,
    /// Drive setting for 100% output under the current PWM/DAC configuration
    full_speed: f32,
    /// Entries last uploaded to the chip
    lut: FanSpeedLut,
    last_status: Status,
    auto_check_status: bool,
}

impl<I: I2c> Emc2101<I> {
    /// Create a new EMC2101 driver with default address
    pub fn new(i2c: I) -> Self {
        Self::new_with_address(i2c, DEFAULT_ADDRESS)
    }

    /// Create a new EMC2101 driver with custom address
    pub fn new_with_address(i2c: I, address: u8) -> Self {
        Self {
            i2c,
            address,
            full_speed: MAX_LUT_SPEED as f32,
            lut: FanSpeedLut::new(),
            last_status: Status::default(),
            auto_check_status: false,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Give back the bus.
    pub fn release(self) -> I {
        self.i2c
    }

    /// Verify the part and reset it to the driver's default configuration.
    pub async fn init(&mut self) -> Result<()> {
        self.detect().await?;
        self.initialize().await
    }

    /// Verify the part without changing its configuration.
    ///
    /// Picks up the current output mode so percentages are scaled the way
    /// the chip is set up. Returns the revision.
    pub async fn detect(&mut self) -> Result<u8> {
        let (mfg_id, product_id, revision) = self.get_part_info().await?;

        if mfg_id != EXPECTED_MFG_ID
            || (product_id != PRODUCT_ID_EMC2101 && product_id != PRODUCT_ID_EMC2101_R)
        {
            return Err(HwError::NotDetected { mfg_id, product_id });
        }

        debug!(
            mfg_id = format!("{:#04x}", mfg_id),
            product_id = format!("{:#04x}", product_id),
            revision = format!("{:#04x}", revision),
            "Detected EMC2101 variant"
        );

        self.refresh_full_speed().await?;
        Ok(revision)
    }

    /// Reset the controller to the default configuration.
    ///
    /// Enables the TACH input, hands the fan to the manual setting (LUT
    /// disabled), selects the PWM_DIV clock path, stops forcing the
    /// external temperature, and disables the spin-up TACH exit.
    pub async fn initialize(&mut self) -> Result<()> {
        self.auto_check_status = false;
        self.last_status = Status::default();

        self.update_register(regs::CONFIG, config_bits::ALT_TACH, config_bits::ALT_TACH)
            .await?;

        // Small delay after enabling TACH for it to stabilize
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        self.update_register(
            regs::FAN_CONFIG,
            fan_config::PROG | fan_config::CLK_OVR | fan_config::FORCE,
            fan_config::PROG | fan_config::CLK_OVR,
        )
        .await?;
        self.write_flag(regs::FAN_SPINUP, spinup::TACH_LIMIT, false)
            .await?;

        self.refresh_full_speed().await
    }

    /// Manufacturer ID, product ID and revision. Normally (0x5D, 0x16, 0x01).
    pub async fn get_part_info(&mut self) -> Result<(u8, u8, u8)> {
        let mfg_id = self.read_register(regs::MFG_ID).await?;
        let product_id = self.read_register(regs::PRODUCT_ID).await?;
        let revision = self.read_register(regs::REVISION).await?;
        Ok((mfg_id, product_id, revision))
    }

    /// Read internal temperature in Celsius (1 degC resolution)
    pub async fn get_internal_temperature(&mut self) -> Result<i8> {
        self.auto_check().await?;
        let raw = self.read_register(regs::INTERNAL_TEMP).await?;
        Ok(raw as i8)
    }

    /// Read external temperature in Celsius
    ///
    /// This is typically connected to a diode-connected transistor or the
    /// thermal diode of the cooled device. Range is -64 to just under
    /// 128 degC with 0.125 degC resolution.
    pub async fn get_external_temperature(&mut self) -> Result<f32> {
        self.auto_check().await?;

        // MSB first: reading it latches the LSB
        let high = self.read_register(regs::EXTERNAL_TEMP_MSB).await?;
        let low = self.read_register(regs::EXTERNAL_TEMP_LSB).await?;

        let raw = ((high as u16) << 3) | ((low as u16) >> FRACTION_SHIFT);
        match raw {
            TEMP_FAULT_OPEN_CIRCUIT => return Err(HwError::DiodeFault(DiodeFault::OpenCircuit)),
            TEMP_FAULT_SHORT => return Err(HwError::DiodeFault(DiodeFault::Short)),
            _ => {}
        }

        Ok(decode_temperature(high, low))
    }

    /// Read TACH count (fan speed measurement)
    /// Returns raw TACH count - convert to RPM based on fan specs
    pub async fn get_tach_count(&mut self) -> Result<u16> {
        // LSB first: reading it latches the MSB
        let low = self.read_register(regs::TACH_LSB).await?;
        let high = self.read_register(regs::TACH_MSB).await?;

        let count = ((high as u16) << 8) | (low as u16);
        trace!(
            "TACH registers: HIGH=0x{:02X}, LOW=0x{:02X}, combined=0x{:04X}",
            high, low, count
        );

        Ok(count)
    }

    /// Get fan RPM
    /// RPM = 5400000 / TACH_count
    pub async fn get_rpm(&mut self) -> Result<u32> {
        self.auto_check().await?;
        let tach = self.get_tach_count().await?;

        const TACH_ERROR_VALUE: u16 = 0xFFFF; // Indicates fan stopped/error
        if tach == 0 || tach == TACH_ERROR_VALUE {
            return Ok(0); // Fan stopped or error
        }

        let rpm = FAN_RPM_DIVISOR / (tach as u32);

        // Counts just short of the 0xFFFF overflow all land on 82 RPM,
        // which is a stalled fan rather than a real speed.
        const STALLED_RPM: u32 = 82;
        if rpm == STALLED_RPM {
            return Ok(0);
        }

        Ok(rpm)
    }

    /// Fan drive as a percentage of full output.
    ///
    /// This is the manual setting while the LUT is disabled and the LUT's
    /// current selection while it is enabled.
    pub async fn get_manual_fan_speed(&mut self) -> Result<f32> {
        let raw = self.read_register(regs::FAN_SETTING).await? & MAX_LUT_SPEED;
        Ok((raw as f32 / self.full_speed * 100.0).min(100.0))
    }

    /// Set the fan drive used while the LUT is disabled.
    ///
    /// FAN_SETTING is only writable with LUT programming enabled, so the
    /// programming bit is set for the write and then restored.
    pub async fn set_manual_fan_speed(&mut self, speed: Percent) -> Result<()> {
        let setting = speed.of(self.full_speed);
        let fan_config = self.read_register(regs::FAN_CONFIG).await?;

        self.write_register(regs::FAN_CONFIG, fan_config | fan_config::PROG)
            .await?;
        self.write_register(regs::FAN_SETTING, setting).await?;
        if fan_config & fan_config::PROG == 0 {
            self.write_register(regs::FAN_CONFIG, fan_config).await?;
        }

        debug!(speed = %speed, setting, "Set manual fan speed");
        Ok(())
    }

    /// Drive setting that corresponds to 100% output, as last computed.
    pub fn full_speed(&self) -> f32 {
        self.full_speed
    }

    /// Whether the fan is driven with a DC voltage instead of PWM.
    pub async fn get_dac_output_enabled(&mut self) -> Result<bool> {
        self.read_flag(regs::CONFIG, config_bits::DAC).await
    }

    pub async fn set_dac_output_enabled(&mut self, enabled: bool) -> Result<()> {
        self.write_flag(regs::CONFIG, config_bits::DAC, enabled)
            .await?;
        self.refresh_full_speed().await
    }

    /// Whether the fan drive polarity is inverted (0 = full speed).
    pub async fn get_invert_fan_output(&mut self) -> Result<bool> {
        self.read_flag(regs::FAN_CONFIG, fan_config::POLARITY).await
    }

    pub async fn set_invert_fan_output(&mut self, invert: bool) -> Result<()> {
        self.write_flag(regs::FAN_CONFIG, fan_config::POLARITY, invert)
            .await
    }

    /// Minimum expected fan speed in RPM, below which the TACH alert fires.
    pub async fn get_tach_limit(&mut self) -> Result<u32> {
        let low = self.read_register(regs::TACH_LIMIT_LSB).await?;
        let high = self.read_register(regs::TACH_LIMIT_MSB).await?;
        let raw = ((high as u16) << 8) | (low as u16);
        if raw == 0 {
            return Err(HwError::Corrupt("TACH limit count is zero".to_string()));
        }
        Ok(FAN_RPM_DIVISOR / raw as u32)
    }

    pub async fn set_tach_limit(&mut self, rpm: u32) -> Result<()> {
        let raw = FAN_RPM_DIVISOR.checked_div(rpm).unwrap_or(u32::MAX);
        if raw == 0 || raw > u16::MAX as u32 {
            return Err(HwError::InvalidParameter(format!(
                "TACH limit {} RPM out of range {}-{}",
                rpm,
                FAN_RPM_DIVISOR / u16::MAX as u32 + 1,
                FAN_RPM_DIVISOR
            )));
        }
        self.write_register(regs::TACH_LIMIT_LSB, raw as u8).await?;
        self.write_register(regs::TACH_LIMIT_MSB, (raw >> 8) as u8)
            .await
    }

    /// Time the fan is driven at the spin-up drive level.
    pub async fn get_spinup_time(&mut self) -> Result<SpinupTime> {
        let value = self.read_register(regs::FAN_SPINUP).await?;
        SpinupTime::try_from(value & spinup::TIME_MASK)
    }

    pub async fn set_spinup_time(&mut self, time: SpinupTime) -> Result<()> {
        self.update_register(regs::FAN_SPINUP, spinup::TIME_MASK, time.into())
            .await
    }

    /// Drive strength applied during spin-up.
    pub async fn get_spinup_drive(&mut self) -> Result<SpinupDrive> {
        let value = self.read_register(regs::FAN_SPINUP).await?;
        SpinupDrive::try_from((value & spinup::DRIVE_MASK) >> spinup::DRIVE_SHIFT)
    }

    pub async fn set_spinup_drive(&mut self, drive: SpinupDrive) -> Result<()> {
        self.update_register(
            regs::FAN_SPINUP,
            spinup::DRIVE_MASK,
            u8::from(drive) << spinup::DRIVE_SHIFT,
        )
        .await
    }

    /// Whether spin-up ends early once the TACH limit is reached.
    pub async fn get_spinup_tach_limit(&mut self) -> Result<bool> {
        self.read_flag(regs::FAN_SPINUP, spinup::TACH_LIMIT).await
    }

    pub async fn set_spinup_tach_limit(&mut self, enabled: bool) -> Result<()> {
        self.write_flag(regs::FAN_SPINUP, spinup::TACH_LIMIT, enabled)
            .await
    }

    /// Rate at which temperature measurements are taken.
    pub async fn get_conversion_rate(&mut self) -> Result<ConversionRate> {
        let value = self.read_register(regs::CONVERSION_RATE).await?;
        Ok(ConversionRate::from_field(value))
    }

    pub async fn set_conversion_rate(&mut self, rate: ConversionRate) -> Result<()> {
        self.update_register(
            regs::CONVERSION_RATE,
            protocol::CONVERSION_RATE_MASK,
            rate.into(),
        )
        .await
    }

    /// Select the PWM clock source.
    ///
    /// With `use_preset` the base clock is used directly, 1.4 kHz if
    /// `use_slow` and 360 kHz otherwise. Without it, the base clock is
    /// further divided by the PWM frequency divisor.
    pub async fn set_pwm_clock(&mut self, use_preset: bool, use_slow: bool) -> Result<()> {
        let mut value = 0;
        if !use_preset {
            value |= fan_config::CLK_OVR;
        }
        if use_slow {
            value |= fan_config::CLK_SEL;
        }
        self.update_register(
            regs::FAN_CONFIG,
            fan_config::CLK_OVR | fan_config::CLK_SEL,
            value,
        )
        .await
    }

    /// 5-bit PWM frequency setting.
    pub async fn get_pwm_frequency(&mut self) -> Result<u8> {
        Ok(self.read_register(regs::PWM_FREQ).await? & FIVE_BIT_MASK)
    }

    /// Set the 5-bit PWM frequency (0-31). Also sets the drive value that
    /// counts as 100% in PWM mode.
    pub async fn set_pwm_frequency(&mut self, value: u8) -> Result<()> {
        if value > FIVE_BIT_MASK {
            return Err(HwError::InvalidParameter(format!(
                "PWM frequency {} out of range 0-31",
                value
            )));
        }
        self.update_register(regs::PWM_FREQ, FIVE_BIT_MASK, value)
            .await?;
        self.refresh_full_speed().await
    }

    /// Divisor applied to the base clock when the clock override is set.
    pub async fn get_pwm_frequency_divisor(&mut self) -> Result<u8> {
        self.read_register(regs::PWM_DIV).await
    }

    pub async fn set_pwm_frequency_divisor(&mut self, divisor: u8) -> Result<()> {
        self.write_register(regs::PWM_DIV, divisor).await
    }

    /// Resulting PWM output frequency in Hz.
    pub async fn get_pwm_output_frequency(&mut self) -> Result<f32> {
        let fan_config = self.read_register(regs::FAN_CONFIG).await?;
        let pwm_freq = self.get_pwm_frequency().await?.max(1);
        let divisor = if fan_config & fan_config::CLK_OVR != 0 {
            self.get_pwm_frequency_divisor().await?.max(1)
        } else {
            1
        };
        let base = if fan_config & fan_config::CLK_SEL != 0 {
            PWM_CLOCK_SLOW_HZ
        } else {
            PWM_CLOCK_FAST_HZ
        };
        Ok(base / (2.0 * pwm_freq as f32 * divisor as f32))
    }

    /// Put the chip in standby (no conversions).
    pub async fn get_standby(&mut self) -> Result<bool> {
        self.read_flag(regs::CONFIG, config_bits::STANDBY).await
    }

    pub async fn set_standby(&mut self, standby: bool) -> Result<()> {
        self.write_flag(regs::CONFIG, config_bits::STANDBY, standby)
            .await
    }

    /// Whether the fan output stays driven in standby.
    pub async fn get_fan_standby(&mut self) -> Result<bool> {
        self.read_flag(regs::CONFIG, config_bits::FAN_STANDBY).await
    }

    pub async fn set_fan_standby(&mut self, enabled: bool) -> Result<()> {
        self.write_flag(regs::CONFIG, config_bits::FAN_STANDBY, enabled)
            .await
    }

    /// Start a single conversion while in standby.
    pub async fn one_shot(&mut self) -> Result<()> {
        self.write_register(regs::ONE_SHOT, 0).await
    }

    /// Read one of the two scratchpad registers (index 0 or 1).
    pub async fn get_scratch(&mut self, index: usize) -> Result<u8> {
        let reg = scratch_register(index)?;
        self.read_register(reg).await
    }

    pub async fn set_scratch(&mut self, index: usize, value: u8) -> Result<()> {
        let reg = scratch_register(index)?;
        self.write_register(reg, value).await
    }

    /// Read every named register, LUT included, in address order.
    ///
    /// This reads STATUS, which clears any latched alerts.
    pub async fn dump_registers(&mut self) -> Result<Vec<(u8, u8)>> {
        let mut addrs: Vec<u8> = READABLE_REGISTERS
            .iter()
            .copied()
            .chain(regs::LUT_BASE..=regs::LUT_END)
            .collect();
        addrs.sort_unstable();

        let mut values = Vec::with_capacity(addrs.len());
        for reg in addrs {
            let value = self.read_register(reg).await?;
            if reg == regs::STATUS {
                self.last_status = Status::from_bits(value);
            }
            values.push((reg, value));
        }
        Ok(values)
    }

    async fn refresh_full_speed(&mut self) -> Result<()> {
        let dac = self.get_dac_output_enabled().await?;
        let pwm_freq = if dac {
            0
        } else {
            self.get_pwm_frequency().await?
        };
        self.full_speed = full_speed_setting(dac, pwm_freq);
        trace!(full_speed = self.full_speed, dac, pwm_freq, "Full speed setting");
        Ok(())
    }

    // Helper methods for register access

    async fn read_register(&mut self, reg: u8) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.i2c.write_read(self.address, &[reg], &mut buf).await?;
        trace!("{}", format_transaction(reg, Some(&buf), true, self.full_speed));
        Ok(buf[0])
    }

    async fn write_register(&mut self, reg: u8, value: u8) -> Result<()> {
        trace!("{}", format_transaction(reg, Some(&[value]), false, self.full_speed));
        self.i2c.write(self.address, &[reg, value]).await
    }

    /// Read-modify-write of the bits in `mask`.
    async fn update_register(&mut self, reg: u8, mask: u8, value: u8) -> Result<()> {
        let current = self.read_register(reg).await?;
        let updated = (current & !mask) | (value & mask);
        self.write_register(reg, updated).await
    }

    async fn read_flag(&mut self, reg: u8, bit: u8) -> Result<bool> {
        Ok(self.read_register(reg).await? & bit != 0)
    }

    async fn write_flag(&mut self, reg: u8, bit: u8, on: bool) -> Result<()> {
        self.update_register(reg, bit, if on { bit } else { 0 })
            .await
    }
}

/// Decode an 11-bit temperature split across a signed integer byte and
/// a fraction byte holding 0.5, 0.25 and 0.125 degC in bits 7:5.
pub fn decode_temperature(high: u8, low: u8) -> f32 {
    const RESOLUTION: f32 = 0.125; // degC per LSB
    let raw = ((high as i8 as i16) << 3) | ((low >> FRACTION_SHIFT) as i16);
    raw as f32 * RESOLUTION
}

/// Encode a temperature into integer and fraction bytes, truncating to
/// 0.125 degC steps toward zero.
pub fn encode_temperature(celsius: f32) -> (u8, u8) {
    let raw = (celsius * 8.0) as i16;
    ((raw >> 3) as u8, ((raw & 0x07) as u8) << FRACTION_SHIFT)
}

fn scratch_register(index: usize) -> Result<u8> {
    match index {
        0 => Ok(regs::SCRATCH_1),
        1 => Ok(regs::SCRATCH_2),
        _ => Err(HwError::InvalidParameter(format!(
            "Scratch register index {} out of range 0-1",
            index
        ))),
    }
}
