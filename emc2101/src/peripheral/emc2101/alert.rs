//! Status register, alert limits and external diode tuning.
//!
//! The chip compares every conversion against the limits below and latches
//! any violation in STATUS (and on the ALERT pin unless masked). Reading
//! STATUS clears it, so the driver keeps the last value it read.

use super::protocol::{FIVE_BIT_MASK, FRACTION_MASK, avg_filter, config, regs};
use super::{AveragingFilter, Emc2101, Status, decode_temperature, encode_temperature};
use crate::{
    hw_trait::{HwError, I2c, Result},
    tracing::prelude::*,
};

/// Range accepted for the external temperature limits, degC
pub(super) const EXT_LIMIT_RANGE: std::ops::RangeInclusive<f32> = -64.0..=127.0;

/// Rated operating range of the part, degC
pub(super) const DEVICE_LIMIT_MAX: u8 = 85;

/// Largest TCRIT hysteresis, degC
const TCRIT_HYST_MAX: u8 = 10;

/// Which external temperature limit register pair to access.
#[derive(Debug, Clone, Copy)]
enum ExtLimit {
    Low,
    High,
}

impl ExtLimit {
    fn registers(self) -> (u8, u8) {
        match self {
            Self::Low => (regs::EXT_LOW_LIMIT_MSB, regs::EXT_LOW_LIMIT_LSB),
            Self::High => (regs::EXT_HIGH_LIMIT_MSB, regs::EXT_HIGH_LIMIT_LSB),
        }
    }
}

impl<I: I2c> Emc2101<I> {
    /// Read STATUS, clearing any latched alerts on the chip.
    pub async fn get_status(&mut self) -> Result<Status> {
        let status = Status::from_bits(self.read_register(regs::STATUS).await?);
        self.last_status = status;
        if status.is_alert() {
            warn!(status = %status, "EMC2101 alert");
        }
        Ok(status)
    }

    /// STATUS as of the last read, or clear if it has not been read.
    pub fn last_status(&self) -> Status {
        self.last_status
    }

    /// Read STATUS and fail if any alert bit is set.
    pub async fn check_status(&mut self) -> Result<()> {
        let status = self.get_status().await?;
        if status.is_alert() {
            return Err(HwError::Alert(status));
        }
        Ok(())
    }

    /// Run [`check_status`](Self::check_status) before temperature, fan
    /// speed and limit accesses.
    pub fn set_auto_check_status(&mut self, enabled: bool) {
        self.auto_check_status = enabled;
    }

    pub fn auto_check_status(&self) -> bool {
        self.auto_check_status
    }

    pub(super) async fn auto_check(&mut self) -> Result<()> {
        if self.auto_check_status {
            self.check_status().await?;
        }
        Ok(())
    }

    /// High limit for the internal sensor, degC.
    pub async fn get_dev_temp_high_limit(&mut self) -> Result<u8> {
        self.auto_check().await?;
        self.read_register(regs::INTERNAL_TEMP_LIMIT).await
    }

    pub async fn set_dev_temp_high_limit(&mut self, celsius: u8) -> Result<()> {
        if celsius > DEVICE_LIMIT_MAX {
            return Err(HwError::InvalidParameter(format!(
                "Device high limit {} out of range 0-{}",
                celsius, DEVICE_LIMIT_MAX
            )));
        }
        self.write_register(regs::INTERNAL_TEMP_LIMIT, celsius)
            .await?;
        self.auto_check().await
    }

    /// Critical temperature limit, degC.
    pub async fn get_dev_temp_critical_limit(&mut self) -> Result<u8> {
        self.auto_check().await?;
        self.read_register(regs::TCRIT_LIMIT).await
    }

    /// Set the critical limit.
    ///
    /// The chip accepts a single TCRIT write per power cycle, and only with
    /// the override bit set. Later writes are ignored by the hardware, so
    /// the limit is read back and a mismatch is reported as an error.
    pub async fn set_dev_temp_critical_limit(&mut self, celsius: u8) -> Result<()> {
        if celsius > DEVICE_LIMIT_MAX {
            return Err(HwError::InvalidParameter(format!(
                "Critical limit {} out of range 0-{}",
                celsius, DEVICE_LIMIT_MAX
            )));
        }
        self.write_flag(regs::CONFIG, config::TCRIT_OVERRIDE, true)
            .await?;
        self.write_register(regs::TCRIT_LIMIT, celsius).await?;
        self.write_flag(regs::CONFIG, config::TCRIT_OVERRIDE, false)
            .await?;

        let readback = self.read_register(regs::TCRIT_LIMIT).await?;
        if readback != celsius {
            return Err(HwError::InvalidParameter(format!(
                "Critical limit is locked at {} until power cycle",
                readback
            )));
        }
        Ok(())
    }

    /// Hysteresis applied to the critical limit, degC.
    pub async fn get_dev_temp_critical_hysteresis(&mut self) -> Result<u8> {
        self.auto_check().await?;
        self.read_register(regs::TCRIT_HYST).await
    }

    pub async fn set_dev_temp_critical_hysteresis(&mut self, celsius: u8) -> Result<()> {
        if !(1..=TCRIT_HYST_MAX).contains(&celsius) {
            return Err(HwError::InvalidParameter(format!(
                "Critical hysteresis {} out of range 1-{}",
                celsius, TCRIT_HYST_MAX
            )));
        }
        self.write_register(regs::TCRIT_HYST, celsius).await?;
        self.auto_check().await
    }

    /// External temperature low limit, degC.
    pub async fn get_external_temp_low_limit(&mut self) -> Result<f32> {
        self.get_ext_limit(ExtLimit::Low).await
    }

    pub async fn set_external_temp_low_limit(&mut self, celsius: f32) -> Result<()> {
        self.set_ext_limit(ExtLimit::Low, celsius).await
    }

    /// External temperature high limit, degC.
    pub async fn get_external_temp_high_limit(&mut self) -> Result<f32> {
        self.get_ext_limit(ExtLimit::High).await
    }

    pub async fn set_external_temp_high_limit(&mut self, celsius: f32) -> Result<()> {
        self.set_ext_limit(ExtLimit::High, celsius).await
    }

    async fn get_ext_limit(&mut self, which: ExtLimit) -> Result<f32> {
        self.auto_check().await?;
        let (msb_reg, lsb_reg) = which.registers();
        let high = self.read_register(msb_reg).await?;
        let low = self.read_register(lsb_reg).await? & FRACTION_MASK;

        let celsius = decode_temperature(high, low);
        if !EXT_LIMIT_RANGE.contains(&celsius) {
            return Err(HwError::Corrupt(format!(
                "{:?} external limit reads {} degC",
                which, celsius
            )));
        }
        Ok(celsius)
    }

    async fn set_ext_limit(&mut self, which: ExtLimit, celsius: f32) -> Result<()> {
        if !EXT_LIMIT_RANGE.contains(&celsius) {
            return Err(HwError::InvalidParameter(format!(
                "External temperature limit {} out of range -64..127",
                celsius
            )));
        }
        let (msb_reg, lsb_reg) = which.registers();
        let (high, low) = encode_temperature(celsius);
        self.update_register(lsb_reg, FRACTION_MASK, low).await?;
        self.write_register(msb_reg, high).await?;
        self.auto_check().await
    }

    /// Bits set in ALERT_MASK keep the matching condition off the ALERT pin.
    pub async fn get_alert_mask(&mut self) -> Result<u8> {
        self.read_register(regs::ALERT_MASK).await
    }

    pub async fn set_alert_mask(&mut self, mask: u8) -> Result<()> {
        self.write_register(regs::ALERT_MASK, mask).await
    }

    /// Whether three consecutive out-of-limit conversions are needed before
    /// an alert is raised, instead of one.
    pub async fn get_queue_consecutive_alerts(&mut self) -> Result<bool> {
        self.read_flag(regs::CONFIG, config::QUEUE).await
    }

    pub async fn set_queue_consecutive_alerts(&mut self, enabled: bool) -> Result<()> {
        self.write_flag(regs::CONFIG, config::QUEUE, enabled).await
    }

    /// Whether the ALERT pin acts as a comparator instead of an interrupt.
    pub async fn get_alert_comparator_mode(&mut self) -> Result<bool> {
        self.read_flag(regs::AVG_FILTER, avg_filter::ALERT_COMPARATOR)
            .await
    }

    pub async fn set_alert_comparator_mode(&mut self, enabled: bool) -> Result<()> {
        self.write_flag(regs::AVG_FILTER, avg_filter::ALERT_COMPARATOR, enabled)
            .await
    }

    /// Digital averaging applied to external temperature readings.
    pub async fn get_averaging_filter(&mut self) -> Result<AveragingFilter> {
        let value = self.read_register(regs::AVG_FILTER).await?;
        Ok(AveragingFilter::from_field(
            (value & avg_filter::FILTER_MASK) >> avg_filter::FILTER_SHIFT,
        ))
    }

    pub async fn set_averaging_filter(&mut self, filter: AveragingFilter) -> Result<()> {
        self.update_register(
            regs::AVG_FILTER,
            avg_filter::FILTER_MASK,
            (filter as u8) << avg_filter::FILTER_SHIFT,
        )
        .await
    }

    /// Ideality factor code for the external diode (datasheet table 6.13,
    /// 0x12 = 1.008).
    pub async fn get_ideality_factor(&mut self) -> Result<u8> {
        Ok(self.read_register(regs::EXT_IDEALITY).await? & FIVE_BIT_MASK)
    }

    pub async fn set_ideality_factor(&mut self, code: u8) -> Result<()> {
        check_five_bits("Ideality factor", code)?;
        self.update_register(regs::EXT_IDEALITY, FIVE_BIT_MASK, code)
            .await
    }

    /// Beta compensation code. 0x07 disables compensation for a
    /// diode-connected transistor; bit 3 enables autodetection.
    pub async fn get_beta_compensation(&mut self) -> Result<u8> {
        Ok(self.read_register(regs::EXT_BETA_COMP).await? & FIVE_BIT_MASK)
    }

    pub async fn set_beta_compensation(&mut self, code: u8) -> Result<()> {
        check_five_bits("Beta compensation", code)?;
        self.update_register(regs::EXT_BETA_COMP, FIVE_BIT_MASK, code)
            .await
    }
}

fn check_five_bits(what: &str, value: u8) -> Result<()> {
    if value > FIVE_BIT_MASK {
        return Err(HwError::InvalidParameter(format!(
            "{} {} out of range 0-31",
            what, value
        )));
    }
    Ok(())
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

    #[tokio::test]
    async fn status_is_cached_after_clearing_read() {
        let (mut emc, sim) = driver().await;
        sim.raise_status(Status::EXT_HIGH);

        assert!(matches!(
            emc.check_status().await,
            Err(HwError::Alert(s)) if s.contains(Status::EXT_HIGH)
        ));
        assert_eq!(emc.last_status(), Status::from_bits(Status::EXT_HIGH));

        // Cleared on the chip, still remembered by the driver
        emc.check_status().await.unwrap();
        assert_eq!(emc.last_status(), Status::default());
    }

    #[tokio::test]
    async fn busy_is_not_an_alert() {
        let (mut emc, sim) = driver().await;
        sim.raise_status(Status::BUSY);
        emc.check_status().await.unwrap();
        assert_eq!(emc.last_status().bits(), Status::BUSY);
    }

    #[tokio::test]
    async fn auto_check_guards_readings() {
        let (mut emc, sim) = driver().await;
        sim.raise_status(Status::TACH);
        // Off by default
        emc.get_internal_temperature().await.unwrap();

        sim.raise_status(Status::TACH);
        emc.set_auto_check_status(true);
        assert!(matches!(
            emc.get_rpm().await,
            Err(HwError::Alert(_))
        ));
        assert_eq!(emc.get_external_temperature().await.unwrap(), 25.0);

        emc.initialize().await.unwrap();
        assert!(!emc.auto_check_status());
    }

    #[tokio::test]
    async fn external_limits_roundtrip() {
        let (mut emc, sim) = driver().await;
        sim.set_register(regs::EXT_HIGH_LIMIT_LSB, 0x1F);

        emc.set_external_temp_high_limit(80.625).await.unwrap();
        assert_eq!(sim.register(regs::EXT_HIGH_LIMIT_MSB), 80);
        assert_eq!(sim.register(regs::EXT_HIGH_LIMIT_LSB), 0xBF);
        assert_eq!(emc.get_external_temp_high_limit().await.unwrap(), 80.625);

        emc.set_external_temp_low_limit(-10.25).await.unwrap();
        assert_eq!(sim.register(regs::EXT_LOW_LIMIT_MSB), 0xF5);
        assert_eq!(sim.register(regs::EXT_LOW_LIMIT_LSB), 0xC0);
        assert_eq!(emc.get_external_temp_low_limit().await.unwrap(), -10.25);

        emc.set_external_temp_low_limit(-64.0).await.unwrap();
        assert_eq!(emc.get_external_temp_low_limit().await.unwrap(), -64.0);
    }

    #[tokio::test]
    async fn external_limits_reject_out_of_range() {
        let (mut emc, sim) = driver().await;
        assert!(matches!(
            emc.set_external_temp_high_limit(127.5).await,
            Err(HwError::InvalidParameter(_))
        ));
        assert!(emc.set_external_temp_low_limit(-64.5).await.is_err());
        assert!(sim.writes().is_empty());

        sim.set_register(regs::EXT_LOW_LIMIT_MSB, 0x80);
        assert!(matches!(
            emc.get_external_temp_low_limit().await,
            Err(HwError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn device_limits() {
        let (mut emc, _sim) = driver().await;
        assert_eq!(emc.get_dev_temp_high_limit().await.unwrap(), 70);
        emc.set_dev_temp_high_limit(60).await.unwrap();
        assert_eq!(emc.get_dev_temp_high_limit().await.unwrap(), 60);
        assert!(emc.set_dev_temp_high_limit(86).await.is_err());

        assert_eq!(emc.get_dev_temp_critical_hysteresis().await.unwrap(), 10);
        emc.set_dev_temp_critical_hysteresis(3).await.unwrap();
        assert_eq!(emc.get_dev_temp_critical_hysteresis().await.unwrap(), 3);
        assert!(emc.set_dev_temp_critical_hysteresis(0).await.is_err());
        assert!(emc.set_dev_temp_critical_hysteresis(11).await.is_err());
    }

    #[tokio::test]
    async fn critical_limit_writes_once() {
        let (mut emc, sim) = driver().await;
        assert_eq!(emc.get_dev_temp_critical_limit().await.unwrap(), 85);

        assert!(matches!(
            emc.set_dev_temp_critical_limit(86).await,
            Err(HwError::InvalidParameter(_))
        ));
        assert!(sim.writes().is_empty());

        emc.set_dev_temp_critical_limit(75).await.unwrap();
        assert_eq!(emc.get_dev_temp_critical_limit().await.unwrap(), 75);
        assert_eq!(sim.register(regs::CONFIG) & config::TCRIT_OVERRIDE, 0);

        assert!(matches!(
            emc.set_dev_temp_critical_limit(65).await,
            Err(HwError::InvalidParameter(_))
        ));
        assert_eq!(emc.get_dev_temp_critical_limit().await.unwrap(), 75);
    }

    #[tokio::test]
    async fn alert_configuration() {
        let (mut emc, sim) = driver().await;
        emc.set_alert_mask(0xBF).await.unwrap();
        assert_eq!(emc.get_alert_mask().await.unwrap(), 0xBF);

        emc.set_queue_consecutive_alerts(true).await.unwrap();
        assert!(emc.get_queue_consecutive_alerts().await.unwrap());

        emc.set_alert_comparator_mode(true).await.unwrap();
        emc.set_averaging_filter(AveragingFilter::Level2).await.unwrap();
        assert_eq!(sim.register(regs::AVG_FILTER), 0x05);
        assert!(emc.get_alert_comparator_mode().await.unwrap());
        assert_eq!(
            emc.get_averaging_filter().await.unwrap(),
            AveragingFilter::Level2
        );

        sim.set_register(regs::AVG_FILTER, 0x06);
        assert_eq!(
            emc.get_averaging_filter().await.unwrap(),
            AveragingFilter::Level2
        );
    }

    #[tokio::test]
    async fn diode_tuning_fields() {
        let (mut emc, sim) = driver().await;
        assert_eq!(emc.get_ideality_factor().await.unwrap(), 0x12);
        emc.set_ideality_factor(0x11).await.unwrap();
        assert_eq!(sim.register(regs::EXT_IDEALITY), 0x11);

        emc.set_beta_compensation(0x07).await.unwrap();
        assert_eq!(emc.get_beta_compensation().await.unwrap(), 0x07);
        assert!(emc.set_beta_compensation(0x20).await.is_err());
    }
}
