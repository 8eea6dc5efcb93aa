//! Temperature to fan-speed lookup table.
//!
//! The chip holds 8 (temperature, drive) pairs at 0x50-0x5F, lowest
//! temperature first. Once the LUT is enabled the chip selects the drive of
//! the highest entry whose temperature the external reading has reached,
//! with no further involvement from the host. Unused slots hold
//! (0x7F, 0x3F), which the chip treats as end of table.
//!
//! The registers are only writable while LUT programming is enabled (the
//! LUT is disabled), so every upload disables the LUT and restores its
//! previous state afterwards.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::Emc2101;
use super::protocol::{FIVE_BIT_MASK, LUT_ENTRIES, MAX_LUT_SPEED, MAX_LUT_TEMP, fan_config, regs};
use crate::{
    hw_trait::{HwError, I2c, Result},
    tracing::prelude::*,
};

/// Up to 8 temperature (degC) to fan drive (percent) points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<u8, f32>", into = "BTreeMap<u8, f32>")]
pub struct FanSpeedLut {
    entries: BTreeMap<u8, f32>,
}

impl FanSpeedLut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the drive for `temp`, replacing any existing point.
    pub fn insert(&mut self, temp: u8, speed: f32) -> Result<()> {
        if temp > MAX_LUT_TEMP {
            return Err(HwError::InvalidParameter(format!(
                "LUT temperature {} out of range 0-{}",
                temp, MAX_LUT_TEMP
            )));
        }
        if !(0.0..=100.0).contains(&speed) {
            return Err(HwError::InvalidParameter(format!(
                "LUT values must be a fan speed from 0-100%, got {}",
                speed
            )));
        }
        if self.entries.len() >= LUT_ENTRIES && !self.entries.contains_key(&temp) {
            return Err(HwError::InvalidParameter(format!(
                "LUT can only contain a maximum of {} items",
                LUT_ENTRIES
            )));
        }
        self.entries.insert(temp, speed);
        Ok(())
    }

    /// Remove the point for `temp`, returning its speed.
    pub fn remove(&mut self, temp: u8) -> Option<f32> {
        self.entries.remove(&temp)
    }

    pub fn get(&self, temp: u8) -> Option<f32> {
        self.entries.get(&temp).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Points in ascending temperature order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, f32)> + '_ {
        self.entries.iter().map(|(&temp, &speed)| (temp, speed))
    }

    /// Register image for all 8 slots given the drive that means 100%.
    pub fn register_pairs(&self, full_speed: f32) -> [(u8, u8); LUT_ENTRIES] {
        let mut pairs = [(MAX_LUT_TEMP, MAX_LUT_SPEED); LUT_ENTRIES];
        for (slot, (temp, speed)) in pairs.iter_mut().zip(self.iter()) {
            let setting = (speed / 100.0 * full_speed).round_ties_even() as u8;
            *slot = (temp, setting.min(MAX_LUT_SPEED));
        }
        pairs
    }
}

impl TryFrom<BTreeMap<u8, f32>> for FanSpeedLut {
    type Error = HwError;

    fn try_from(entries: BTreeMap<u8, f32>) -> Result<Self> {
        let mut lut = Self::new();
        for (temp, speed) in entries {
            lut.insert(temp, speed)?;
        }
        Ok(lut)
    }
}

impl From<FanSpeedLut> for BTreeMap<u8, f32> {
    fn from(lut: FanSpeedLut) -> Self {
        lut.entries
    }
}

impl fmt::Display for FanSpeedLut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (temp, speed)) in self.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{} deg C => {:.1}% duty cycle", temp, speed)?;
        }
        Ok(())
    }
}

impl<I: I2c> Emc2101<I> {
    /// Whether the LUT is driving the fan.
    pub async fn get_lut_enabled(&mut self) -> Result<bool> {
        Ok(!self.read_flag(regs::FAN_CONFIG, fan_config::PROG).await?)
    }

    /// Hand the fan to the LUT (`true`) or to the manual setting (`false`).
    pub async fn set_lut_enabled(&mut self, enabled: bool) -> Result<()> {
        self.write_flag(regs::FAN_CONFIG, fan_config::PROG, !enabled)
            .await
    }

    /// Hysteresis in degC applied as the temperature falls past an entry.
    pub async fn get_lut_temperature_hysteresis(&mut self) -> Result<u8> {
        Ok(self.read_register(regs::FAN_TEMP_HYST).await? & FIVE_BIT_MASK)
    }

    pub async fn set_lut_temperature_hysteresis(&mut self, hysteresis: u8) -> Result<()> {
        if hysteresis > FIVE_BIT_MASK {
            return Err(HwError::InvalidParameter(format!(
                "LUT hysteresis {} out of range 0-31",
                hysteresis
            )));
        }
        self.update_register(regs::FAN_TEMP_HYST, FIVE_BIT_MASK, hysteresis)
            .await
    }

    /// Temperature fed to the LUT while forcing is enabled.
    pub async fn get_forced_external_temperature(&mut self) -> Result<i8> {
        Ok(self.read_register(regs::TEMP_FORCE).await? as i8)
    }

    pub async fn set_forced_external_temperature(&mut self, celsius: i8) -> Result<()> {
        self.write_register(regs::TEMP_FORCE, celsius as u8).await
    }

    /// Whether the LUT reads the forced temperature instead of the measured
    /// one. Useful for exercising the LUT without heating anything.
    pub async fn get_forced_temp_enabled(&mut self) -> Result<bool> {
        self.read_flag(regs::FAN_CONFIG, fan_config::FORCE).await
    }

    pub async fn set_forced_temp_enabled(&mut self, enabled: bool) -> Result<()> {
        self.write_flag(regs::FAN_CONFIG, fan_config::FORCE, enabled)
            .await
    }

    /// Points last uploaded by this driver.
    pub fn lut(&self) -> &FanSpeedLut {
        &self.lut
    }

    /// Replace the whole table and upload it.
    pub async fn set_lut(&mut self, lut: FanSpeedLut) -> Result<()> {
        self.lut = lut;
        self.upload_lut().await
    }

    /// Set one point and upload the table.
    pub async fn set_lut_entry(&mut self, temp: u8, speed: f32) -> Result<()> {
        let mut lut = self.lut.clone();
        lut.insert(temp, speed)?;
        self.set_lut(lut).await
    }

    /// Remove one point and upload the table.
    pub async fn remove_lut_entry(&mut self, temp: u8) -> Result<Option<f32>> {
        let removed = self.lut.remove(temp);
        self.upload_lut().await?;
        Ok(removed)
    }

    /// Remove all points and upload the empty table.
    pub async fn clear_lut(&mut self) -> Result<()> {
        self.lut.clear();
        self.upload_lut().await
    }

    /// Raw (temperature, drive) pairs currently in the chip.
    pub async fn read_lut_registers(&mut self) -> Result<[(u8, u8); LUT_ENTRIES]> {
        let mut pairs = [(0, 0); LUT_ENTRIES];
        for (slot, pair) in pairs.iter_mut().enumerate() {
            let reg = regs::LUT_BASE + (slot as u8) * 2;
            *pair = (
                self.read_register(reg).await?,
                self.read_register(reg + 1).await?,
            );
        }
        Ok(pairs)
    }

    async fn upload_lut(&mut self) -> Result<()> {
        let pairs = self.lut.register_pairs(self.full_speed);
        let was_enabled = self.get_lut_enabled().await?;

        if was_enabled {
            self.set_lut_enabled(false).await?;
        }

        for (slot, (temp, setting)) in pairs.iter().enumerate() {
            let reg = regs::LUT_BASE + (slot as u8) * 2;
            self.write_register(reg, *temp).await?;
            self.write_register(reg + 1, *setting).await?;
        }

        if was_enabled {
            self.set_lut_enabled(true).await?;
        }

        debug!(entries = self.lut.len(), "Uploaded fan speed LUT");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::emc2101::sim::SimulatedEmc2101;

    async fn driver() -> (Emc2101<SimulatedEmc2101>, SimulatedEmc2101) {
        let sim = SimulatedEmc2101::new();
        let mut emc = Emc2101::new(sim.clone());
        emc.init().await.unwrap();
        sim.clear_log();
        (emc, sim)
    }

    #[test]
    fn insert_validates_range() {
        let mut lut = FanSpeedLut::new();
        assert!(lut.insert(40, 100.5).is_err());
        assert!(lut.insert(40, -1.0).is_err());
        assert!(lut.insert(128, 50.0).is_err());
        assert!(lut.is_empty());

        lut.insert(40, 62.5).unwrap();
        assert_eq!(lut.get(40), Some(62.5));
    }

    #[test]
    fn holds_at_most_eight_points() {
        let mut lut = FanSpeedLut::new();
        for temp in 0..8 {
            lut.insert(temp * 10, 50.0).unwrap();
        }
        assert!(lut.insert(90, 50.0).is_err());
        // Updating an existing point is still allowed
        lut.insert(70, 80.0).unwrap();
        assert_eq!(lut.len(), 8);
    }

    #[test]
    fn orders_by_temperature_and_pads() {
        let mut lut = FanSpeedLut::new();
        lut.insert(50, 100.0).unwrap();
        lut.insert(20, 0.0).unwrap();
        lut.insert(35, 50.0).unwrap();

        let pairs = lut.register_pairs(63.0);
        assert_eq!(pairs[0], (20, 0));
        assert_eq!(pairs[1], (35, 32));
        assert_eq!(pairs[2], (50, 63));
        for pair in &pairs[3..] {
            assert_eq!(*pair, (MAX_LUT_TEMP, MAX_LUT_SPEED));
        }
    }

    #[test]
    fn speed_ties_round_to_even() {
        let mut lut = FanSpeedLut::new();
        lut.insert(30, 25.0).unwrap();
        lut.insert(40, 75.0).unwrap();

        // 11.5 and 34.5 steps of a 46-step range
        let pairs = lut.register_pairs(46.0);
        assert_eq!(pairs[0], (30, 12));
        assert_eq!(pairs[1], (40, 34));
    }

    #[test]
    fn display_lists_points() {
        let mut lut = FanSpeedLut::new();
        lut.insert(40, 10.0).unwrap();
        lut.insert(27, 25.0).unwrap();
        assert_eq!(
            lut.to_string(),
            "27 deg C => 25.0% duty cycle\n40 deg C => 10.0% duty cycle"
        );
    }

    #[test]
    fn deserializes_with_validation() {
        let lut: FanSpeedLut = serde_json::from_str(r#"{"20": 0, "40": 10.5}"#).unwrap();
        assert_eq!(lut.iter().collect::<Vec<_>>(), vec![(20, 0.0), (40, 10.5)]);
        assert!(serde_json::from_str::<FanSpeedLut>(r#"{"20": 150}"#).is_err());
    }

    #[tokio::test]
    async fn upload_writes_sorted_pairs() {
        let (mut emc, _sim) = driver().await;
        let mut lut = FanSpeedLut::new();
        lut.insert(42, 75.0).unwrap();
        lut.insert(27, 25.0).unwrap();
        lut.insert(34, 50.0).unwrap();
        emc.set_lut(lut).await.unwrap();

        // PWM_FREQ defaults to 0x17, so 100% is a setting of 46
        let pairs = emc.read_lut_registers().await.unwrap();
        assert_eq!(pairs[0], (27, 12));
        assert_eq!(pairs[1], (34, 23));
        assert_eq!(pairs[2], (42, 34));
        assert!(pairs[3..].iter().all(|p| *p == (0x7F, 0x3F)));

        let temps: Vec<u8> = pairs.iter().map(|p| p.0).collect();
        assert!(temps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn upload_restores_enabled_lut() {
        let (mut emc, sim) = driver().await;
        emc.set_lut_enabled(true).await.unwrap();

        emc.set_lut_entry(30, 50.0).await.unwrap();

        // The simulator drops LUT writes unless programming is enabled
        assert_eq!(sim.register(regs::LUT_BASE), 30);
        assert_eq!(sim.register(regs::LUT_BASE + 1), 23);
        assert!(emc.get_lut_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn single_entry_updates() {
        let (mut emc, sim) = driver().await;
        emc.set_lut_entry(20, 0.0).await.unwrap();
        emc.set_lut_entry(40, 100.0).await.unwrap();
        assert_eq!(emc.lut().len(), 2);
        assert_eq!(sim.register(regs::LUT_BASE + 2), 40);

        assert_eq!(emc.remove_lut_entry(20).await.unwrap(), Some(0.0));
        assert_eq!(sim.register(regs::LUT_BASE), 40);
        assert_eq!(sim.register(regs::LUT_BASE + 2), MAX_LUT_TEMP);

        assert!(emc.set_lut_entry(50, 101.0).await.is_err());
        assert_eq!(emc.lut().len(), 1);

        emc.clear_lut().await.unwrap();
        assert!(emc.lut().is_empty());
        assert_eq!(sim.register(regs::LUT_BASE), MAX_LUT_TEMP);
    }

    #[tokio::test]
    async fn forced_temperature_selects_lut_entry() {
        let (mut emc, _sim) = driver().await;
        let mut lut = FanSpeedLut::new();
        lut.insert(27, 25.0).unwrap();
        lut.insert(34, 50.0).unwrap();
        lut.insert(42, 75.0).unwrap();
        emc.set_lut(lut).await.unwrap();

        emc.set_forced_external_temperature(35).await.unwrap();
        emc.set_forced_temp_enabled(true).await.unwrap();
        emc.set_lut_enabled(true).await.unwrap();
        assert_eq!(emc.get_forced_external_temperature().await.unwrap(), 35);
        assert!(emc.get_forced_temp_enabled().await.unwrap());
        assert_eq!(emc.get_manual_fan_speed().await.unwrap(), 50.0);

        emc.set_forced_external_temperature(43).await.unwrap();
        let speed = emc.get_manual_fan_speed().await.unwrap();
        assert!((speed - 73.91).abs() < 0.01, "speed {}", speed);
    }

    #[tokio::test]
    async fn hysteresis_field() {
        let (mut emc, sim) = driver().await;
        emc.set_lut_temperature_hysteresis(10).await.unwrap();
        assert_eq!(emc.get_lut_temperature_hysteresis().await.unwrap(), 10);
        assert_eq!(sim.register(regs::FAN_TEMP_HYST), 10);
        assert!(emc.set_lut_temperature_hysteresis(32).await.is_err());
    }
}
