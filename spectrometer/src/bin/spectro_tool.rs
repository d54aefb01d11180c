//! Command-line tool for multi-channel spectrometers.
//!
//! Subcommands:
//! - `info`: Show the EEPROM contents and channel ranges
//! - `measure`: Take one measurement, optionally in the background
//! - `range`: Configure the pixel range of a channel
//! - `digital`: Set a digital output or read the digital input
//! - `write-eeprom`: Write the EEPROM snapshot back to the instrument
//!
//! Without `--serial` or `--usb` the tool talks to an emulated instrument.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use spectrometer::{Backend, DeviceConfig, EmulationConfig, ReadOutcome, Spectrometer};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// USB vendor/product ids and the number of matching devices to skip
#[derive(Debug, Clone, Copy)]
struct UsbId {
    vendor: u16,
    product: u16,
    skip: usize,
}

fn parse_usb_id(s: &str) -> std::result::Result<UsbId, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let hex = |p: &str| {
        u16::from_str_radix(p.trim_start_matches("0x"), 16)
            .map_err(|e| format!("invalid USB id '{p}': {e}"))
    };
    match parts.as_slice() {
        [vendor, product] => Ok(UsbId {
            vendor: hex(vendor)?,
            product: hex(product)?,
            skip: 0,
        }),
        [vendor, product, skip] => Ok(UsbId {
            vendor: hex(vendor)?,
            product: hex(product)?,
            skip: skip
                .parse()
                .map_err(|e| format!("invalid skip count '{skip}': {e}"))?,
        }),
        _ => Err(format!("expected VID:PID[:SKIP], got '{s}'")),
    }
}

/// Multi-channel spectrometer tool
#[derive(Parser, Debug)]
#[command(name = "spectro_tool")]
#[command(about = "Query and measure with a multi-channel spectrometer")]
#[command(version)]
struct Args {
    /// Serial device of the instrument
    #[arg(long, global = true, conflicts_with = "usb")]
    serial: Option<String>,

    /// USB instrument as VID:PID[:SKIP] (hex ids)
    #[arg(long, global = true, value_parser = parse_usb_id)]
    usb: Option<UsbId>,

    /// Device configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show EEPROM contents and channel ranges
    Info,

    /// Take one measurement
    Measure {
        /// Integration time in milliseconds (overrides the config file)
        #[arg(short, long)]
        integration_ms: Option<u16>,

        /// Number of spectra to average (overrides the config file)
        #[arg(short, long)]
        average: Option<u16>,

        /// Collect on a background thread
        #[arg(long)]
        r#async: bool,

        /// Cancel the background read after this many milliseconds
        #[arg(long, requires = "async")]
        cancel_after_ms: Option<u64>,

        /// Subtract the dark level from the output
        #[arg(long)]
        dark_correct: bool,

        /// Output CSV file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Configure the pixel range [min, max) of a channel
    Range {
        #[arg(short, long)]
        channel: usize,

        #[arg(long)]
        min: usize,

        #[arg(long)]
        max: usize,
    },

    /// Set a digital output, or read the digital input without --line
    Digital {
        /// Output line (0-9)
        #[arg(short, long, requires = "value")]
        line: Option<usize>,

        /// Output value
        #[arg(short, long)]
        value: Option<bool>,
    },

    /// Write the EEPROM snapshot back to the instrument
    WriteEeprom {
        /// 15-character password
        #[arg(short, long)]
        password: String,
    },
}

fn open(args: &Args) -> Result<Spectrometer> {
    let config = match &args.config {
        Some(path) => DeviceConfig::load_or_default(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DeviceConfig::default(),
    };

    let backend = match (&args.serial, args.usb) {
        (Some(path), _) => Backend::Serial(path.clone()),
        (None, Some(id)) => Backend::Usb {
            vendor: id.vendor,
            product: id.product,
            skip: id.skip,
        },
        (None, None) => {
            info!("No device given, using emulation");
            Backend::Emulation(EmulationConfig::default())
        }
    };

    Ok(Spectrometer::open(backend, &config)?)
}

/// Log filter from `RUST_LOG`-style directives, reporting at INFO by default.
fn log_filter(directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy(directives)
}

fn main() -> Result<()> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&directives))
        .init();

    let args = Args::parse();
    let mut spec = open(&args)?;

    match args.command {
        Command::Info => cmd_info(&spec),
        Command::Measure {
            integration_ms,
            average,
            r#async,
            cancel_after_ms,
            dark_correct,
            output,
        } => cmd_measure(
            &mut spec,
            integration_ms,
            average,
            r#async,
            cancel_after_ms,
            dark_correct,
            output,
        ),
        Command::Range { channel, min, max } => {
            spec.set_range(channel, min, max)?;
            info!("Channel {} range set to [{}, {})", channel, min, max);
            Ok(())
        }
        Command::Digital { line, value } => cmd_digital(&mut spec, line, value),
        Command::WriteEeprom { password } => {
            spec.write_eeprom(password.as_bytes())?;
            info!("EEPROM written");
            Ok(())
        }
    }
}

fn cmd_info(spec: &Spectrometer) -> Result<()> {
    let eeprom = spec.eeprom();
    info!("=== Device ===");
    info!("Version: {}", eeprom.version_string());
    info!("Device id: {}", eeprom.device_id);
    info!("Sensor: {}", eeprom.sensor);
    info!(
        "Channels: {}, pixels: {}, extra pixels: {}",
        spec.num_channels(),
        spec.pixel_count(),
        spec.extra_pixels()
    );

    info!("=== Channels ===");
    for (i, channel) in spec.channels()?.iter().enumerate() {
        let record = &eeprom.channels[i];
        info!(
            "Channel {}: range [{}, {}), EEPROM [{}, {}), calibration {:?}",
            i,
            channel.range_min(),
            channel.range_max(),
            record.start,
            record.stop,
            record.coefficients
        );
        if !channel.nonlinear().is_empty() {
            info!("  nonlinearity: {:?}", channel.nonlinear());
        }
        if let Some(ijk) = channel.ijking() {
            info!(
                "  ijking: {} values from pixel {} at {:?}",
                ijk.values.len(),
                ijk.start,
                ijk.reference
            );
        }
    }
    Ok(())
}

fn cmd_measure(
    spec: &mut Spectrometer,
    integration_ms: Option<u16>,
    average: Option<u16>,
    background: bool,
    cancel_after_ms: Option<u64>,
    dark_correct: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    if let Some(ms) = integration_ms {
        spec.set_integration_time(Duration::from_millis(u64::from(ms)));
    }
    if let Some(avg) = average {
        spec.set_average(avg);
    }

    info!(
        "Measuring: {:?} integration, average {}",
        spec.integration_time(),
        spec.average()
    );
    spec.start_read()?;

    if background {
        spec.end_read_async()?;
        let outcome = match cancel_after_ms {
            Some(ms) => {
                thread::sleep(Duration::from_millis(ms));
                spec.cancel_read_async()?
            }
            None => spec.join_read_async()?,
        };
        if outcome == ReadOutcome::Cancelled {
            warn!("Measurement cancelled");
            return Ok(());
        }
    } else {
        spec.end_read()?;
    }

    if let Some(ts) = spec.last_measurement() {
        info!("Measurement taken at {}", ts.to_rfc3339());
    }

    for (i, channel) in spec.channels()?.iter().enumerate() {
        if !channel.is_active() {
            continue;
        }
        let samples = channel.active_samples();
        let max = samples.iter().copied().max().unwrap_or(0);
        let mean = samples.iter().map(|&v| f64::from(v)).sum::<f64>() / samples.len() as f64;
        info!(
            "Channel {}: {} pixels, mean {:.1}, max {}, dark {:?}",
            i,
            samples.len(),
            mean,
            max,
            channel.dark_level()
        );
    }

    if let Some(path) = output {
        write_csv(spec, &path, dark_correct)
            .with_context(|| format!("writing {}", path.display()))?;
        info!("Wrote {}", path.display());
    }
    Ok(())
}

fn write_csv(spec: &Spectrometer, path: &Path, dark_correct: bool) -> Result<()> {
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "channel,pixel,wavelength,value")?;
    for (i, channel) in spec.channels()?.iter().enumerate() {
        if !channel.is_active() {
            continue;
        }
        let wavelengths = spec.wavelengths(i)?;
        let values: Vec<f64> = if dark_correct {
            channel.dark_corrected()
        } else {
            channel
                .active_samples()
                .iter()
                .map(|&v| f64::from(v))
                .collect()
        };
        for (pixel, value) in channel.data_range().zip(values) {
            writeln!(
                file,
                "{},{},{:.3},{:.1}",
                i, pixel, wavelengths[pixel], value
            )?;
        }
    }
    Ok(())
}

fn cmd_digital(spec: &mut Spectrometer, line: Option<usize>, value: Option<bool>) -> Result<()> {
    match (line, value) {
        (Some(line), Some(value)) => {
            spec.set_digital(line, value)?;
            info!("Digital output {} set to {}", line, value);
        }
        (None, None) => {
            let input = spec.digital_input()?;
            info!("Digital input: {}", input);
        }
        _ => bail!("--line and --value must be given together"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::{Layer, Registry};

    fn max_level(filter: &EnvFilter) -> Option<LevelFilter> {
        <EnvFilter as Layer<Registry>>::max_level_hint(filter)
    }

    #[test]
    fn test_log_filter_defaults_to_info() {
        assert_eq!(max_level(&log_filter("")), Some(LevelFilter::INFO));
    }

    #[test]
    fn test_log_filter_honours_directives() {
        assert_eq!(max_level(&log_filter("debug")), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn test_parse_usb_id() {
        let id = parse_usb_id("0x1992:0667:1").unwrap();
        assert_eq!((id.vendor, id.product, id.skip), (0x1992, 0x0667, 1));
        assert_eq!(parse_usb_id("1992:0667").unwrap().skip, 0);
        assert!(parse_usb_id("1992").is_err());
        assert!(parse_usb_id("zz:0667").is_err());
    }
}
