//! Declarative controller setup.
//!
//! An [`Emc2101Config`] names the settings to program; fields left out of
//! the JSON are not touched. [`Emc2101::apply_config`] validates the whole
//! configuration before writing anything, so a bad file leaves the chip as
//! it was.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::alert::{DEVICE_LIMIT_MAX, EXT_LIMIT_RANGE};
use super::protocol::{FAN_RPM_DIVISOR, FIVE_BIT_MASK};
use super::{ConversionRate, Emc2101, FanSpeedLut, Percent, SpinupDrive, SpinupTime};
use crate::{
    hw_trait::{HwError, I2c, Result},
    tracing::prelude::*,
};

/// Errors loading a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// PWM clock selection, see [`Emc2101::set_pwm_clock`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PwmClock {
    pub use_preset: bool,
    pub use_slow: bool,
    pub frequency: Option<u8>,
    pub divisor: Option<u8>,
}

/// External temperature alert limits, degC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExternalLimits {
    pub low: Option<f32>,
    pub high: Option<f32>,
}

/// Settings to program into an EMC2101.
///
/// ```json
/// {
///   "conversion_rate": "4",
///   "pwm": { "frequency": 31, "divisor": 1 },
///   "manual_speed": 40,
///   "lut": { "30": 25.0, "45": 60.0, "60": 100.0 },
///   "lut_enabled": true
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Emc2101Config {
    pub conversion_rate: Option<ConversionRate>,
    pub spinup_time: Option<SpinupTime>,
    pub spinup_drive: Option<SpinupDrive>,
    pub spinup_tach_limit: Option<bool>,
    pub dac_output: Option<bool>,
    pub invert_fan_output: Option<bool>,
    pub pwm: Option<PwmClock>,
    pub manual_speed: Option<Percent>,
    pub tach_limit_rpm: Option<u32>,
    pub internal_high_limit: Option<u8>,
    pub external_limits: Option<ExternalLimits>,
    pub lut: Option<FanSpeedLut>,
    pub lut_hysteresis: Option<u8>,
    pub lut_enabled: Option<bool>,
}

impl Emc2101Config {
    pub fn from_json(json: &str) -> std::result::Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check every value against the range its register accepts.
    pub fn validate(&self) -> Result<()> {
        if let Some(pwm) = &self.pwm {
            if let Some(frequency) = pwm.frequency {
                check_range("PWM frequency", frequency, FIVE_BIT_MASK)?;
            }
        }
        if let Some(hysteresis) = self.lut_hysteresis {
            check_range("LUT hysteresis", hysteresis, FIVE_BIT_MASK)?;
        }
        if let Some(limit) = self.internal_high_limit {
            check_range("Device high limit", limit, DEVICE_LIMIT_MAX)?;
        }
        if let Some(rpm) = self.tach_limit_rpm {
            let raw = FAN_RPM_DIVISOR.checked_div(rpm).unwrap_or(0);
            if raw == 0 || raw > u16::MAX as u32 {
                return Err(HwError::InvalidParameter(format!(
                    "TACH limit {} RPM cannot be represented",
                    rpm
                )));
            }
        }
        if let Some(limits) = &self.external_limits {
            for celsius in [limits.low, limits.high].into_iter().flatten() {
                if !EXT_LIMIT_RANGE.contains(&celsius) {
                    return Err(HwError::InvalidParameter(format!(
                        "External temperature limit {} out of range -64..127",
                        celsius
                    )));
                }
            }
            if let (Some(low), Some(high)) = (limits.low, limits.high) {
                if low > high {
                    return Err(HwError::InvalidParameter(format!(
                        "External low limit {} above high limit {}",
                        low, high
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_range(what: &str, value: u8, max: u8) -> Result<()> {
    if value > max {
        return Err(HwError::InvalidParameter(format!(
            "{} {} out of range 0-{}",
            what, value, max
        )));
    }
    Ok(())
}

impl<I: I2c> Emc2101<I> {
    /// Validate and program `config`.
    ///
    /// The output mode and PWM settings go first since they decide what
    /// 100% drive means for the manual speed and the LUT. The LUT is
    /// enabled last, once its entries are in place.
    pub async fn apply_config(&mut self, config: &Emc2101Config) -> Result<()> {
        config.validate()?;

        if let Some(rate) = config.conversion_rate {
            self.set_conversion_rate(rate).await?;
        }
        if let Some(time) = config.spinup_time {
            self.set_spinup_time(time).await?;
        }
        if let Some(drive) = config.spinup_drive {
            self.set_spinup_drive(drive).await?;
        }
        if let Some(enabled) = config.spinup_tach_limit {
            self.set_spinup_tach_limit(enabled).await?;
        }
        if let Some(dac) = config.dac_output {
            self.set_dac_output_enabled(dac).await?;
        }
        if let Some(invert) = config.invert_fan_output {
            self.set_invert_fan_output(invert).await?;
        }
        if let Some(pwm) = &config.pwm {
            self.set_pwm_clock(pwm.use_preset, pwm.use_slow).await?;
            if let Some(divisor) = pwm.divisor {
                self.set_pwm_frequency_divisor(divisor).await?;
            }
            if let Some(frequency) = pwm.frequency {
                self.set_pwm_frequency(frequency).await?;
            }
        }
        if let Some(speed) = config.manual_speed {
            self.set_manual_fan_speed(speed).await?;
        }
        if let Some(rpm) = config.tach_limit_rpm {
            self.set_tach_limit(rpm).await?;
        }
        if let Some(limit) = config.internal_high_limit {
            self.set_dev_temp_high_limit(limit).await?;
        }
        if let Some(limits) = &config.external_limits {
            // A low limit above the current high limit waits for the new high
            let high_first = match (limits.low, limits.high) {
                (Some(low), Some(_)) => low > self.get_external_temp_high_limit().await?,
                _ => false,
            };
            if high_first {
                if let Some(high) = limits.high {
                    self.set_external_temp_high_limit(high).await?;
                }
            }
            if let Some(low) = limits.low {
                self.set_external_temp_low_limit(low).await?;
            }
            if !high_first {
                if let Some(high) = limits.high {
                    self.set_external_temp_high_limit(high).await?;
                }
            }
        }
        if let Some(hysteresis) = config.lut_hysteresis {
            self.set_lut_temperature_hysteresis(hysteresis).await?;
        }
        if let Some(lut) = &config.lut {
            self.set_lut(lut.clone()).await?;
        }
        if let Some(enabled) = config.lut_enabled {
            self.set_lut_enabled(enabled).await?;
        }

        info!(
            full_speed = self.full_speed(),
            lut_entries = self.lut().len(),
            "Applied EMC2101 configuration"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::emc2101::protocol::{fan_config, regs};
    use crate::peripheral::emc2101::sim::SimulatedEmc2101;

    async fn driver() -> (Emc2101<SimulatedEmc2101>, SimulatedEmc2101) {
        let sim = SimulatedEmc2101::new();
        let mut emc = Emc2101::new(sim.clone());
        emc.init().await.unwrap();
        sim.clear_log();
        (emc, sim)
    }

    #[test]
    fn parses_partial_json() {
        let config = Emc2101Config::from_json(
            r#"{
                "conversion_rate": "1/4",
                "spinup_drive": "drive75",
                "pwm": { "frequency": 31 },
                "manual_speed": 40,
                "lut": { "30": 25.0, "60": 100.0 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.conversion_rate, Some(ConversionRate::Rate1_4));
        assert_eq!(config.spinup_drive, Some(SpinupDrive::Drive75));
        assert_eq!(config.pwm.as_ref().unwrap().frequency, Some(31));
        assert!(!config.pwm.as_ref().unwrap().use_preset);
        assert_eq!(config.manual_speed, Percent::new(40));
        assert_eq!(config.lut.as_ref().unwrap().get(60), Some(100.0));
        assert_eq!(config.lut_enabled, None);
    }

    #[test]
    fn rejects_bad_json_values() {
        assert!(matches!(
            Emc2101Config::from_json(r#"{ "manual_speed": 101 }"#),
            Err(ConfigError::Json(_))
        ));
        assert!(Emc2101Config::from_json(r#"{ "fan_speed": 10 }"#).is_err());
        assert!(Emc2101Config::from_json(r#"{ "lut": { "128": 10.0 } }"#).is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            Emc2101Config::load("/nonexistent/emc2101.json"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn validate_ranges() {
        let mut config = Emc2101Config::default();
        config.validate().unwrap();

        config.external_limits = Some(ExternalLimits {
            low: Some(50.0),
            high: Some(40.0),
        });
        assert!(config.validate().is_err());

        config.external_limits = None;
        config.tach_limit_rpm = Some(50);
        assert!(config.validate().is_err());

        config.tach_limit_rpm = None;
        config.lut_hysteresis = Some(32);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn invalid_config_writes_nothing() {
        let (mut emc, sim) = driver().await;
        let config = Emc2101Config {
            conversion_rate: Some(ConversionRate::Rate1),
            internal_high_limit: Some(90),
            ..Default::default()
        };
        assert!(matches!(
            emc.apply_config(&config).await,
            Err(HwError::InvalidParameter(_))
        ));
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn applies_full_config() {
        let (mut emc, sim) = driver().await;
        let mut lut = FanSpeedLut::new();
        lut.insert(30, 25.0).unwrap();
        lut.insert(60, 100.0).unwrap();

        let config = Emc2101Config {
            conversion_rate: Some(ConversionRate::Rate4),
            spinup_time: Some(SpinupTime::Spin0_8Sec),
            pwm: Some(PwmClock {
                frequency: Some(0x1F),
                divisor: Some(2),
                ..Default::default()
            }),
            manual_speed: Percent::new(50),
            tach_limit_rpm: Some(600),
            external_limits: Some(ExternalLimits {
                low: Some(5.0),
                high: Some(75.5),
            }),
            lut: Some(lut),
            lut_hysteresis: Some(2),
            lut_enabled: Some(true),
            ..Default::default()
        };
        emc.apply_config(&config).await.unwrap();

        assert_eq!(emc.full_speed(), 62.0);
        assert_eq!(emc.get_conversion_rate().await.unwrap(), ConversionRate::Rate4);
        assert_eq!(emc.get_spinup_time().await.unwrap(), SpinupTime::Spin0_8Sec);
        assert_eq!(emc.get_pwm_frequency_divisor().await.unwrap(), 2);
        assert_eq!(emc.get_tach_limit().await.unwrap(), 600);
        assert_eq!(emc.get_external_temp_high_limit().await.unwrap(), 75.5);
        assert_eq!(emc.get_lut_temperature_hysteresis().await.unwrap(), 2);
        assert_eq!(emc.lut().len(), 2);

        // Written while programming was still enabled
        let writes = sim.writes();
        assert!(writes.contains(&(regs::FAN_SETTING, 31)));
        assert!(writes.contains(&(regs::LUT_BASE + 1, 16)));

        assert_eq!(sim.register(regs::FAN_CONFIG) & fan_config::PROG, 0);
        assert!(emc.get_lut_enabled().await.unwrap());
    }

    fn write_position(writes: &[(u8, u8)], reg: u8) -> usize {
        writes.iter().position(|&(r, _)| r == reg).unwrap()
    }

    #[tokio::test]
    async fn external_limits_never_cross() {
        let (mut emc, sim) = driver().await;

        // Both above the 85 degC power-on high limit
        let raise = Emc2101Config {
            external_limits: Some(ExternalLimits {
                low: Some(90.0),
                high: Some(100.0),
            }),
            ..Default::default()
        };
        emc.apply_config(&raise).await.unwrap();
        let writes = sim.writes();
        assert!(
            write_position(&writes, regs::EXT_HIGH_LIMIT_MSB)
                < write_position(&writes, regs::EXT_LOW_LIMIT_MSB)
        );
        assert_eq!(emc.get_external_temp_low_limit().await.unwrap(), 90.0);
        assert_eq!(emc.get_external_temp_high_limit().await.unwrap(), 100.0);

        sim.clear_log();
        let lower = Emc2101Config {
            external_limits: Some(ExternalLimits {
                low: Some(10.0),
                high: Some(20.0),
            }),
            ..Default::default()
        };
        emc.apply_config(&lower).await.unwrap();
        let writes = sim.writes();
        assert!(
            write_position(&writes, regs::EXT_LOW_LIMIT_MSB)
                < write_position(&writes, regs::EXT_HIGH_LIMIT_MSB)
        );
        assert_eq!(emc.get_external_temp_high_limit().await.unwrap(), 20.0);
    }
}
