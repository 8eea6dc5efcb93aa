//! In-memory EMC2101 register file.
//!
//! [`SimulatedEmc2101`] implements [`I2c`] on top of a 256-byte register
//! file with the chip's power-on defaults and the access rules the driver
//! depends on: read-only identity and measurement registers, clear-on-read
//! STATUS, the one-time TCRIT write, and write protection of FAN_SETTING and
//! the LUT while the LUT is driving the fan. With the LUT enabled, reads of
//! FAN_SETTING return the drive the chip would select for the current (or
//! forced) external temperature.
//!
//! Clones share the same register file, so a test can keep one handle for
//! inspection while the driver owns another.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::protocol::{
    DEFAULT_ADDRESS, EXPECTED_MFG_ID, FAN_RPM_DIVISOR, LUT_ENTRIES, MAX_LUT_SPEED, MAX_LUT_TEMP,
    PRODUCT_ID_EMC2101, config, fan_config, regs,
};
use crate::hw_trait::{HwError, I2c, I2cError, Result};
use crate::tracing::prelude::*;

/// One register access seen by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transaction {
    Read { reg: u8, value: u8 },
    Write { reg: u8, value: u8 },
}

impl Transaction {
    pub fn reg(&self) -> u8 {
        match self {
            Self::Read { reg, .. } | Self::Write { reg, .. } => *reg,
        }
    }
}

struct RegisterFile {
    regs: [u8; 256],
    pointer: u8,
    tcrit_written: bool,
    fail_next: Option<I2cError>,
    log: Vec<Transaction>,
}

impl RegisterFile {
    fn power_on() -> Self {
        let mut regs = [0u8; 256];
        regs[regs::INTERNAL_TEMP as usize] = 25;
        regs[regs::EXTERNAL_TEMP_MSB as usize] = 25;
        regs[regs::CONVERSION_RATE as usize] = 0x08;
        regs[regs::INTERNAL_TEMP_LIMIT as usize] = 0x46;
        regs[regs::EXT_HIGH_LIMIT_MSB as usize] = 0x55;
        regs[regs::ALERT_MASK as usize] = 0xA4;
        regs[regs::EXT_IDEALITY as usize] = 0x12;
        regs[regs::EXT_BETA_COMP as usize] = 0x08;
        regs[regs::TCRIT_LIMIT as usize] = 0x55;
        regs[regs::TCRIT_HYST as usize] = 0x0A;
        regs[regs::TACH_LSB as usize] = 0xFF;
        regs[regs::TACH_MSB as usize] = 0xFF;
        regs[regs::TACH_LIMIT_LSB as usize] = 0xFF;
        regs[regs::TACH_LIMIT_MSB as usize] = 0xFF;
        regs[regs::FAN_CONFIG as usize] = fan_config::PROG;
        regs[regs::FAN_SPINUP as usize] = 0x3F;
        regs[regs::PWM_FREQ as usize] = 0x17;
        regs[regs::PWM_DIV as usize] = 0x01;
        regs[regs::FAN_TEMP_HYST as usize] = 0x04;
        for slot in 0..LUT_ENTRIES {
            regs[regs::LUT_BASE as usize + slot * 2] = MAX_LUT_TEMP;
            regs[regs::LUT_BASE as usize + slot * 2 + 1] = MAX_LUT_SPEED;
        }
        regs[regs::PRODUCT_ID as usize] = PRODUCT_ID_EMC2101;
        regs[regs::MFG_ID as usize] = EXPECTED_MFG_ID;
        regs[regs::REVISION as usize] = 0x01;

        Self {
            regs,
            pointer: 0,
            tcrit_written: false,
            fail_next: None,
            log: Vec::new(),
        }
    }

    fn lut_programming(&self) -> bool {
        self.regs[regs::FAN_CONFIG as usize] & fan_config::PROG != 0
    }

    /// Drive selected by the LUT for the current temperature input.
    fn lut_drive(&self) -> u8 {
        let temp = if self.regs[regs::FAN_CONFIG as usize] & fan_config::FORCE != 0 {
            self.regs[regs::TEMP_FORCE as usize] as i8
        } else {
            self.regs[regs::EXTERNAL_TEMP_MSB as usize] as i8
        };

        let mut drive = 0;
        for slot in 0..LUT_ENTRIES {
            let entry_temp = self.regs[regs::LUT_BASE as usize + slot * 2];
            if entry_temp == MAX_LUT_TEMP || temp < entry_temp as i8 {
                break;
            }
            drive = self.regs[regs::LUT_BASE as usize + slot * 2 + 1];
        }
        drive
    }

    fn read(&mut self, reg: u8) -> u8 {
        let value = match reg {
            regs::FAN_SETTING if !self.lut_programming() => self.lut_drive(),
            _ => self.regs[reg as usize],
        };
        if reg == regs::STATUS {
            self.regs[regs::STATUS as usize] = 0;
        }
        self.log.push(Transaction::Read { reg, value });
        value
    }

    fn write(&mut self, reg: u8, value: u8) {
        self.log.push(Transaction::Write { reg, value });
        match reg {
            regs::INTERNAL_TEMP
            | regs::EXTERNAL_TEMP_MSB
            | regs::EXTERNAL_TEMP_LSB
            | regs::STATUS
            | regs::TACH_LSB
            | regs::TACH_MSB
            | regs::PRODUCT_ID
            | regs::MFG_ID
            | regs::REVISION => {
                trace!(reg = format!("{:#04x}", reg), "Write to read-only register ignored");
            }
            regs::ONE_SHOT => {}
            regs::TCRIT_LIMIT => {
                let unlocked = self.regs[regs::CONFIG as usize] & config::TCRIT_OVERRIDE != 0;
                if unlocked && !self.tcrit_written {
                    self.regs[reg as usize] = value;
                    self.tcrit_written = true;
                }
            }
            regs::FAN_SETTING | regs::LUT_BASE..=regs::LUT_END => {
                if self.lut_programming() {
                    self.regs[reg as usize] = value;
                }
            }
            _ => self.regs[reg as usize] = value,
        }
    }

    fn take_failure(&mut self) -> Result<()> {
        match self.fail_next.take() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

/// Simulated EMC2101 reachable at a fixed address.
#[derive(Clone)]
pub struct SimulatedEmc2101 {
    address: u8,
    state: Arc<Mutex<RegisterFile>>,
}

impl Default for SimulatedEmc2101 {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEmc2101 {
    /// Create a simulator at the default address in its power-on state.
    pub fn new() -> Self {
        Self::with_address(DEFAULT_ADDRESS)
    }

    pub fn with_address(address: u8) -> Self {
        Self {
            address,
            state: Arc::new(Mutex::new(RegisterFile::power_on())),
        }
    }

    /// Raw register contents, bypassing access rules and the log.
    pub fn register(&self, reg: u8) -> u8 {
        self.state.lock().regs[reg as usize]
    }

    /// Overwrite a register, bypassing access rules and the log.
    pub fn set_register(&self, reg: u8, value: u8) {
        self.state.lock().regs[reg as usize] = value;
    }

    /// Set the measured external temperature (0.125 degC resolution).
    pub fn set_external_temperature(&self, celsius: f32) {
        let raw = (celsius * 8.0) as i16;
        let mut state = self.state.lock();
        state.regs[regs::EXTERNAL_TEMP_MSB as usize] = (raw >> 3) as u8;
        state.regs[regs::EXTERNAL_TEMP_LSB as usize] = ((raw & 0x07) as u8) << 5;
    }

    /// Set the measured internal temperature.
    pub fn set_internal_temperature(&self, celsius: i8) {
        self.set_register(regs::INTERNAL_TEMP, celsius as u8);
    }

    /// Set the TACH count the chip reports.
    pub fn set_tach_count(&self, count: u16) {
        let mut state = self.state.lock();
        state.regs[regs::TACH_LSB as usize] = count as u8;
        state.regs[regs::TACH_MSB as usize] = (count >> 8) as u8;
    }

    /// Set the TACH count that corresponds to `rpm`.
    pub fn set_fan_rpm(&self, rpm: u32) {
        let count = FAN_RPM_DIVISOR.checked_div(rpm).unwrap_or(u32::from(u16::MAX));
        self.set_tach_count(count.min(u32::from(u16::MAX)) as u16);
    }

    /// OR `bits` into STATUS; they clear on the next read.
    pub fn raise_status(&self, bits: u8) {
        self.state.lock().regs[regs::STATUS as usize] |= bits;
    }

    /// Make the next bus transaction fail with `err`.
    pub fn fail_next(&self, err: I2cError) {
        self.state.lock().fail_next = Some(err);
    }

    /// Register accesses seen so far.
    pub fn log(&self) -> Vec<Transaction> {
        self.state.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Registers written since the log was last cleared, in order.
    pub fn writes(&self) -> Vec<(u8, u8)> {
        self.state
            .lock()
            .log
            .iter()
            .filter_map(|t| match *t {
                Transaction::Write { reg, value } => Some((reg, value)),
                Transaction::Read { .. } => None,
            })
            .collect()
    }

    fn check_address(&self, addr: u8) -> Result<()> {
        if addr == self.address {
            Ok(())
        } else {
            Err(HwError::I2c(I2cError::Nack(addr)))
        }
    }
}

#[async_trait]
impl I2c for SimulatedEmc2101 {
    async fn write(&mut self, addr: u8, data: &[u8]) -> Result<()> {
        self.check_address(addr)?;
        let mut state = self.state.lock();
        state.take_failure()?;
        match *data {
            [reg] => state.pointer = reg,
            [reg, value] => {
                state.pointer = reg;
                state.write(reg, value);
            }
            _ => {
                return Err(HwError::I2c(I2cError::Other(format!(
                    "EMC2101 does not support {}-byte writes",
                    data.len()
                ))));
            }
        }
        Ok(())
    }

    async fn read(&mut self, addr: u8, buffer: &mut [u8]) -> Result<()> {
        self.check_address(addr)?;
        let mut state = self.state.lock();
        state.take_failure()?;
        if buffer.len() != 1 {
            return Err(HwError::I2c(I2cError::Other(format!(
                "EMC2101 does not support {}-byte reads",
                buffer.len()
            ))));
        }
        let reg = state.pointer;
        buffer[0] = state.read(reg);
        Ok(())
    }

    async fn write_read(&mut self, addr: u8, write: &[u8], read: &mut [u8]) -> Result<()> {
        self.check_address(addr)?;
        let mut state = self.state.lock();
        state.take_failure()?;
        if write.len() != 1 || read.len() != 1 {
            return Err(HwError::I2c(I2cError::Other(format!(
                "EMC2101 supports 1-byte register reads, got write {} read {}",
                write.len(),
                read.len()
            ))));
        }
        let reg = write[0];
        state.pointer = reg;
        read[0] = state.read(reg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identity_and_defaults() {
        let mut sim = SimulatedEmc2101::new();
        let mut buf = [0u8];
        sim.write_read(DEFAULT_ADDRESS, &[regs::MFG_ID], &mut buf)
            .await
            .unwrap();
        assert_eq!(buf[0], 0x5D);
        sim.write_read(DEFAULT_ADDRESS, &[regs::PWM_FREQ], &mut buf)
            .await
            .unwrap();
        assert_eq!(buf[0], 0x17);
    }

    #[tokio::test]
    async fn wrong_address_nacks() {
        let mut sim = SimulatedEmc2101::new();
        let err = sim.write(0x4D, &[regs::CONFIG, 0]).await.unwrap_err();
        assert_eq!(err, HwError::I2c(I2cError::Nack(0x4D)));
    }

    #[tokio::test]
    async fn status_clears_on_read() {
        let mut sim = SimulatedEmc2101::new();
        sim.raise_status(0x10);
        let mut buf = [0u8];
        sim.write_read(DEFAULT_ADDRESS, &[regs::STATUS], &mut buf)
            .await
            .unwrap();
        assert_eq!(buf[0], 0x10);
        sim.write_read(DEFAULT_ADDRESS, &[regs::STATUS], &mut buf)
            .await
            .unwrap();
        assert_eq!(buf[0], 0);
    }

    #[tokio::test]
    async fn send_byte_then_receive_byte() {
        let mut sim = SimulatedEmc2101::new();
        sim.write(DEFAULT_ADDRESS, &[regs::REVISION]).await.unwrap();
        let mut buf = [0u8];
        sim.read(DEFAULT_ADDRESS, &mut buf).await.unwrap();
        assert_eq!(buf[0], 0x01);
    }

    #[tokio::test]
    async fn lut_and_fan_setting_locked_while_lut_runs() {
        let mut sim = SimulatedEmc2101::new();
        sim.set_register(regs::FAN_CONFIG, 0);
        sim.write(DEFAULT_ADDRESS, &[regs::LUT_BASE, 30]).await.unwrap();
        sim.write(DEFAULT_ADDRESS, &[regs::FAN_SETTING, 10])
            .await
            .unwrap();
        assert_eq!(sim.register(regs::LUT_BASE), MAX_LUT_TEMP);
        assert_eq!(sim.register(regs::FAN_SETTING), 0);
    }

    #[tokio::test]
    async fn lut_drives_fan_setting_from_forced_temperature() {
        let mut sim = SimulatedEmc2101::new();
        for (reg, value) in [(0x50, 20), (0x51, 10), (0x52, 40), (0x53, 30)] {
            sim.set_register(reg, value);
        }
        sim.set_register(regs::TEMP_FORCE, 30);
        sim.set_register(regs::FAN_CONFIG, fan_config::FORCE);

        let mut buf = [0u8];
        sim.write_read(DEFAULT_ADDRESS, &[regs::FAN_SETTING], &mut buf)
            .await
            .unwrap();
        assert_eq!(buf[0], 10);

        sim.set_register(regs::TEMP_FORCE, 45);
        sim.write_read(DEFAULT_ADDRESS, &[regs::FAN_SETTING], &mut buf)
            .await
            .unwrap();
        assert_eq!(buf[0], 30);
    }

    #[tokio::test]
    async fn tcrit_accepts_one_write_after_override() {
        let mut sim = SimulatedEmc2101::new();
        sim.write(DEFAULT_ADDRESS, &[regs::TCRIT_LIMIT, 70]).await.unwrap();
        assert_eq!(sim.register(regs::TCRIT_LIMIT), 0x55);

        sim.set_register(regs::CONFIG, config::TCRIT_OVERRIDE);
        sim.write(DEFAULT_ADDRESS, &[regs::TCRIT_LIMIT, 70]).await.unwrap();
        sim.write(DEFAULT_ADDRESS, &[regs::TCRIT_LIMIT, 60]).await.unwrap();
        assert_eq!(sim.register(regs::TCRIT_LIMIT), 70);
    }

    #[tokio::test]
    async fn injected_failure_hits_once() {
        let mut sim = SimulatedEmc2101::new();
        sim.fail_next(I2cError::Bus);
        let mut buf = [0u8];
        assert!(
            sim.write_read(DEFAULT_ADDRESS, &[regs::CONFIG], &mut buf)
                .await
                .is_err()
        );
        sim.write_read(DEFAULT_ADDRESS, &[regs::CONFIG], &mut buf)
            .await
            .unwrap();
    }

    #[test]
    fn external_temperature_encoding() {
        let sim = SimulatedEmc2101::new();
        sim.set_external_temperature(-1.5);
        assert_eq!(sim.register(regs::EXTERNAL_TEMP_MSB), 0xFE);
        assert_eq!(sim.register(regs::EXTERNAL_TEMP_LSB), 0x80);
        sim.set_external_temperature(42.625);
        assert_eq!(sim.register(regs::EXTERNAL_TEMP_MSB), 42);
        assert_eq!(sim.register(regs::EXTERNAL_TEMP_LSB), 0xA0);
    }
}
