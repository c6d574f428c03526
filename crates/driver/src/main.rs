//! caen-usb
//!
//! Command-line front end for the CAEN USB driver engine. Attaches the
//! supported bridges present on the bus and issues bulk and control
//! transfers against them.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use common::setup_logging;
use driver::config::{DriverConfig, expand_path};
use driver::usb::{
    ControlOutcome, ControlRequest, LifecycleManager, attach_present_devices,
    spawn_hotplug_worker,
};
use protocol::{CAEN_DEVICE_TABLE, DeviceId};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "caen-usb")]
#[command(
    author,
    version,
    about = "CAEN USB driver - bulk and control transfers to CAEN bridges"
)]
#[command(long_about = "
User-space driver for CAEN V1718 and 21E1-family USB bridges.
Attaches every supported device on the bus and addresses them by number
(caenusb1, caenusb2, ... in enumeration order).

EXAMPLES:
    # List attached bridges
    caen-usb list

    # Read 512 bytes from the first bridge
    caen-usb read --device 1 --length 512

    # Send a vendor control request with a 2-byte payload
    caen-usb control --device 1 --request 0x22 --out 0a0b

    # Track arrivals and removals until Ctrl-C
    caen-usb watch

CONFIGURATION:
    The driver looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/caen-usb/driver.toml
    3. /etc/caen-usb/driver.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached devices
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the modalias of every supported device
    Aliases,

    /// Bulk read from a device
    Read {
        #[arg(short, long, default_value_t = 1)]
        device: u32,
        /// Number of bytes to read
        #[arg(short = 'n', long)]
        length: usize,
        /// Write the data to a file instead of printing hex
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Bulk write to a device
    Write {
        #[arg(short, long, default_value_t = 1)]
        device: u32,
        /// Payload as hex digits
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        hex: Option<String>,
        /// Payload read from a file
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
    },

    /// Vendor control transfer on endpoint 0
    Control {
        #[arg(short, long, default_value_t = 1)]
        device: u32,
        /// bRequest (decimal or 0x-prefixed hex)
        #[arg(short, long, value_parser = parse_number::<u8>)]
        request: u8,
        #[arg(long, default_value = "0", value_parser = parse_number::<u16>)]
        value: u16,
        #[arg(long, default_value = "0", value_parser = parse_number::<u16>)]
        index: u16,
        /// Read this many bytes from the device
        #[arg(
            long = "in",
            value_name = "LEN",
            conflicts_with = "data_out",
            required_unless_present = "data_out"
        )]
        data_in: Option<usize>,
        /// Send these hex bytes to the device
        #[arg(long = "out", value_name = "HEX")]
        data_out: Option<String>,
    },

    /// Attach devices as they arrive and release them as they leave
    Watch {
        /// Seconds between status reports
        #[arg(long, default_value_t = 10)]
        interval: u64,
    },

    /// Save the default configuration and exit
    SaveConfig {
        /// Destination (defaults to the user config path)
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle save-config early (before loading config)
    if let Command::SaveConfig { path } = &args.command {
        let config = DriverConfig::default();
        let path = path.clone().unwrap_or_else(DriverConfig::default_path);
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", expand_path(&path).display());
        return Ok(());
    }

    // Load configuration first (to get log level from config if not specified)
    let config = if let Some(ref path) = args.config {
        DriverConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        DriverConfig::load_or_default()
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.driver.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("caen-usb v{}", driver::DRIVER_REVISION);
    debug!("Log level: {}", log_level);

    let manager = LifecycleManager::new(config.manager_settings()?);

    match args.command {
        Command::Watch { interval } => run_watch(manager, config, interval).await,
        Command::Aliases => {
            for entry in CAEN_DEVICE_TABLE {
                println!("{}", entry.modalias());
            }
            Ok(())
        }
        command => {
            // Transfers block; keep them off the async runtime
            tokio::task::spawn_blocking(move || run_command(manager, config, command))
                .await
                .context("Command thread panicked")?
        }
    }
}

fn run_command(manager: LifecycleManager, config: DriverConfig, command: Command) -> Result<()> {
    let context = rusb::Context::new().context("Failed to create USB context")?;
    attach_present_devices(&context, &manager, &config.open_options())?;

    let result = match command {
        Command::List { json } => list_devices(&manager, json),
        Command::Read {
            device,
            length,
            output,
        } => read_device(&manager, DeviceId(device), length, output),
        Command::Write { device, hex, file } => {
            let data = match (hex, file) {
                (Some(hex), _) => parse_hex(&hex)?,
                (None, Some(file)) => {
                    let path = expand_path(&file);
                    std::fs::read(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?
                }
                (None, None) => bail!("Either --hex or --file is required"),
            };
            write_device(&manager, DeviceId(device), &data)
        }
        Command::Control {
            device,
            request,
            value,
            index,
            data_in,
            data_out,
        } => {
            let request = match (data_in, data_out) {
                (Some(length), _) => ControlRequest::vendor_in(request, value, index, length),
                (None, Some(hex)) => {
                    ControlRequest::vendor_out(request, value, index, parse_hex(&hex)?)
                }
                (None, None) => bail!("Either --in or --out is required"),
            };
            control_device(&manager, DeviceId(device), &request)
        }
        Command::Watch { .. } | Command::Aliases | Command::SaveConfig { .. } => Ok(()),
    };

    // Release every device before the USB context goes away
    manager.detach_all();
    result
}

fn list_devices(manager: &LifecycleManager, json: bool) -> Result<()> {
    let devices = manager.list();

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No supported devices found");
        return Ok(());
    }

    println!(
        "{:<10} {:<10} {:>4} {:>5} {:>10}",
        "DEVICE", "VID:PID", "BUS", "ADDR", "BUFFER"
    );
    for info in devices {
        println!(
            "{:<10} {:04x}:{:04x}  {:>4} {:>5} {:>10}",
            info.id.to_string(),
            info.identity.vendor_id,
            info.identity.product_id,
            info.identity.bus_number,
            info.identity.address,
            info.buffer_capacity
        );
    }
    Ok(())
}

fn read_device(
    manager: &LifecycleManager,
    id: DeviceId,
    length: usize,
    output: Option<PathBuf>,
) -> Result<()> {
    let session = manager.open(id)?;
    let data = session.read(length)?;
    info!("Read {} of {} bytes from {}", data.len(), length, id);

    match output {
        Some(path) => {
            let path = expand_path(&path);
            std::fs::write(&path, &data)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        None => println!("{}", format_hex(&data)),
    }
    Ok(())
}

fn write_device(manager: &LifecycleManager, id: DeviceId, data: &[u8]) -> Result<()> {
    let session = manager.open(id)?;
    let written = session.write(data)?;
    if written < data.len() {
        info!("Short write to {}: {} of {} bytes", id, written, data.len());
    }
    println!("{}", written);
    Ok(())
}

fn control_device(
    manager: &LifecycleManager,
    id: DeviceId,
    request: &ControlRequest,
) -> Result<()> {
    let session = manager.open(id)?;
    match session.control(request)? {
        ControlOutcome::In(data) => println!("{}", format_hex(&data)),
        ControlOutcome::Out(count) => println!("{}", count),
    }
    Ok(())
}

async fn run_watch(manager: LifecycleManager, config: DriverConfig, interval: u64) -> Result<()> {
    let worker = spawn_hotplug_worker(manager.clone(), config.open_options())
        .context("Failed to start hot-plug worker")?;

    info!("Watching for devices (Ctrl-C to stop)");
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Received Ctrl-C, shutting down");
                break;
            }
            _ = ticker.tick() => {
                if !worker.is_running() {
                    error!("Hot-plug worker exited");
                    break;
                }
                for device in manager.list() {
                    info!(
                        "{}: {:04x}:{:04x} {:?} sessions={}",
                        device.id,
                        device.identity.vendor_id,
                        device.identity.product_id,
                        device.state,
                        device.open_sessions
                    );
                }
            }
        }
    }

    let result = tokio::task::spawn_blocking(move || worker.shutdown())
        .await
        .context("Hot-plug worker panicked")?;
    manager.detach_all();
    result.map_err(|e| anyhow!("Hot-plug worker failed: {}", e))
}

/// Parse a decimal or 0x-prefixed hex number
fn parse_number<T>(s: &str) -> std::result::Result<T, String>
where
    T: TryFrom<u64>,
{
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid number '{}': {}", s, e))?;
    T::try_from(value).map_err(|_| format!("number '{}' out of range", s))
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(&digits);
    if digits.len() % 2 != 0 {
        bail!("Hex payload has an odd number of digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| anyhow!("Invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

fn format_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0a0B ff").unwrap(), vec![0x0a, 0x0b, 0xff]);
        assert_eq!(parse_hex("0x0102").unwrap(), vec![1, 2]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number::<u8>("0x22").unwrap(), 0x22);
        assert_eq!(parse_number::<u16>("513").unwrap(), 513);
        assert!(parse_number::<u8>("0x100").is_err());
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0xde, 0xad, 0x01]), "dead01");
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["caen-usb", "read", "--device", "2", "--length", "64"])
            .unwrap();
        assert!(matches!(
            args.command,
            Command::Read {
                device: 2,
                length: 64,
                ..
            }
        ));
    }
}
