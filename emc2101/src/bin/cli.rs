//! Command-line interface for an EMC2101 on a Linux I2C bus.
//!
//! Commands verify the part but leave its configuration alone unless they
//! change it, so `status` can be run against a fan the LUT is driving.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;

use emc2101::hw_trait::{HwError, I2c};
use emc2101::peripheral::emc2101::{
    Emc2101, Emc2101Config, FanSpeedLut, Percent, protocol::register_name,
    sim::SimulatedEmc2101,
};
use emc2101::tracing::{init_journald_or_stderr, prelude::*};

/// Inspect and configure an EMC2101 fan controller
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// I2C bus device
    #[arg(short, long, env = "EMC2101_BUS", default_value = "/dev/i2c-1")]
    bus: PathBuf,

    /// 7-bit device address, decimal or 0x-prefixed hex
    #[arg(short, long, env = "EMC2101_ADDRESS", default_value = "0x4C", value_parser = parse_address)]
    address: u8,

    /// Talk to an in-memory simulated chip instead of the bus
    #[arg(long)]
    simulate: bool,

    /// Reset the chip to the driver defaults before running the command
    #[arg(long)]
    reset: bool,

    /// Enable debug logging (repeat for register traffic)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show temperatures, fan speed and alert status
    Status,

    /// Disable the LUT and drive the fan at a fixed percentage
    SetSpeed {
        /// Fan drive, 0-100
        #[arg(value_parser = parse_percent)]
        percent: Percent,
    },

    /// Program the LUT from TEMP=SPEED points and enable it
    Lut {
        /// Temperature (degC) to fan speed (percent) points, e.g. 40=30
        #[arg(required = true, value_parser = parse_lut_point)]
        points: Vec<(u8, f32)>,

        /// Hysteresis in degC as the temperature falls
        #[arg(long)]
        hysteresis: Option<u8>,
    },

    /// Apply a JSON configuration file
    Apply {
        /// Path to the configuration file
        config: PathBuf,
    },

    /// Print every named register
    Dump,
}

fn parse_address(s: &str) -> std::result::Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    match parsed {
        Ok(addr) if addr <= 0x7F => Ok(addr),
        Ok(addr) => Err(format!("address 0x{:02X} is not a 7-bit address", addr)),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_percent(s: &str) -> std::result::Result<Percent, String> {
    let value: u8 = s.parse().map_err(|e| format!("bad percentage '{}': {}", s, e))?;
    Percent::try_from(value).map_err(|e| e.to_string())
}

fn parse_lut_point(s: &str) -> std::result::Result<(u8, f32), String> {
    let (temp, speed) = s
        .split_once('=')
        .ok_or_else(|| format!("expected TEMP=SPEED, got '{}'", s))?;
    let temp = temp
        .trim()
        .parse()
        .map_err(|e| format!("bad temperature '{}': {}", temp, e))?;
    let speed = speed
        .trim()
        .trim_end_matches('%')
        .parse()
        .map_err(|e| format!("bad speed '{}': {}", speed, e))?;
    Ok((temp, speed))
}

fn open_bus(args: &Args) -> Result<Box<dyn I2c>> {
    if args.simulate {
        let sim = SimulatedEmc2101::with_address(args.address);
        sim.set_external_temperature(42.5);
        sim.set_internal_temperature(31);
        sim.set_fan_rpm(1800);
        info!(address = format!("{:#04x}", args.address), "Using simulated EMC2101");
        return Ok(Box::new(sim));
    }

    #[cfg(target_os = "linux")]
    {
        let bus = emc2101::transport::LinuxI2c::open(&args.bus)
            .with_context(|| format!("Failed to open I2C bus {}", args.bus.display()))?;
        return Ok(Box::new(bus));
    }

    #[cfg(not(target_os = "linux"))]
    anyhow::bail!("I2C buses are only supported on Linux; use --simulate")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_journald_or_stderr(match args.verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    });

    let bus = open_bus(&args)?;
    let mut fan = Emc2101::new_with_address(bus, args.address);

    let detected = if args.reset {
        fan.init().await
    } else {
        fan.detect().await.map(|_| ())
    };
    detected.with_context(|| format!("No EMC2101 at address 0x{:02X}", args.address))?;

    match args.command {
        Command::Status => cmd_status(&mut fan).await?,
        Command::SetSpeed { percent } => cmd_set_speed(&mut fan, percent).await?,
        Command::Lut { points, hysteresis } => cmd_lut(&mut fan, points, hysteresis).await?,
        Command::Apply { config } => cmd_apply(&mut fan, &config).await?,
        Command::Dump => cmd_dump(&mut fan).await?,
    }

    Ok(())
}

/// Print a summary of the controller state.
async fn cmd_status<I: I2c>(fan: &mut Emc2101<I>) -> Result<()> {
    let (_, product_id, revision) = fan.get_part_info().await?;
    let status = fan.get_status().await?;

    println!(
        "Part:          EMC2101 (product 0x{:02X}, revision 0x{:02X})",
        product_id, revision
    );
    println!("Internal temp: {} degC", fan.get_internal_temperature().await?);
    match fan.get_external_temperature().await {
        Ok(celsius) => println!("External temp: {:.3} degC", celsius),
        Err(HwError::DiodeFault(fault)) => println!("External temp: diode {}", fault),
        Err(e) => return Err(e.into()),
    }
    println!("Fan speed:     {} RPM", fan.get_rpm().await?);
    println!("Fan drive:     {:.1}%", fan.get_manual_fan_speed().await?);

    let mode = if fan.get_dac_output_enabled().await? {
        "DAC".to_string()
    } else {
        format!("PWM {:.1} Hz", fan.get_pwm_output_frequency().await?)
    };
    println!("Output:        {}", mode);
    println!(
        "LUT:           {}",
        if fan.get_lut_enabled().await? {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!("Status:        {}", status);

    Ok(())
}

async fn cmd_set_speed<I: I2c>(fan: &mut Emc2101<I>, percent: Percent) -> Result<()> {
    fan.set_lut_enabled(false).await?;
    fan.set_manual_fan_speed(percent).await?;
    println!("Fan drive set to {}", percent);
    Ok(())
}

async fn cmd_lut<I: I2c>(
    fan: &mut Emc2101<I>,
    points: Vec<(u8, f32)>,
    hysteresis: Option<u8>,
) -> Result<()> {
    let mut lut = FanSpeedLut::new();
    for (temp, speed) in points {
        lut.insert(temp, speed)
            .with_context(|| format!("Invalid LUT point {}={}", temp, speed))?;
    }

    if let Some(hysteresis) = hysteresis {
        fan.set_lut_temperature_hysteresis(hysteresis).await?;
    }
    fan.set_lut(lut).await?;
    fan.set_lut_enabled(true).await?;

    println!("{}", fan.lut());
    Ok(())
}

async fn cmd_apply<I: I2c>(fan: &mut Emc2101<I>, path: &Path) -> Result<()> {
    let config = Emc2101Config::load(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    fan.apply_config(&config).await?;
    println!("Applied {}", path.display());
    Ok(())
}

async fn cmd_dump<I: I2c>(fan: &mut Emc2101<I>) -> Result<()> {
    for (reg, value) in fan.dump_registers().await? {
        println!("0x{:02X} {:<20} 0x{:02X}", reg, register_name(reg), value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses() {
        assert_eq!(parse_address("0x4C"), Ok(0x4C));
        assert_eq!(parse_address("76"), Ok(0x4C));
        assert!(parse_address("0x80").is_err());
        assert!(parse_address("zz").is_err());
    }

    #[test]
    fn lut_points() {
        assert_eq!(parse_lut_point("40=30"), Ok((40, 30.0)));
        assert_eq!(parse_lut_point("55=62.5%"), Ok((55, 62.5)));
        assert!(parse_lut_point("40").is_err());
        assert!(parse_lut_point("300=10").is_err());
    }

    #[test]
    fn percent_argument() {
        assert_eq!(parse_percent("60").ok(), Percent::new(60));
        assert!(parse_percent("101").is_err());
    }

    #[test]
    fn args_parse() {
        let args = Args::try_parse_from(["emc2101-cli", "--simulate", "lut", "30=20", "60=100"])
            .unwrap();
        assert!(args.simulate);
        assert!(matches!(args.command, Command::Lut { ref points, .. } if points.len() == 2));
    }

    #[tokio::test]
    async fn lut_command_on_simulator() {
        let sim = SimulatedEmc2101::new();
        let mut fan = Emc2101::new(sim.clone());
        fan.init().await.unwrap();

        cmd_lut(&mut fan, vec![(30, 20.0), (60, 100.0)], Some(3))
            .await
            .unwrap();
        assert!(fan.get_lut_enabled().await.unwrap());
        assert_eq!(fan.get_lut_temperature_hysteresis().await.unwrap(), 3);

        cmd_set_speed(&mut fan, Percent::FULL).await.unwrap();
        assert!(!fan.get_lut_enabled().await.unwrap());
        assert_eq!(fan.get_manual_fan_speed().await.unwrap(), 100.0);
    }
}
