use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use log::{LevelFilter, info};

use ax_proto::LinkError;
use axd::agent::Agent;
use axd::config::Config;
use axd::platform::VolumeTable;

#[cfg(windows)]
const DEFAULT_DEVICE: &str = "COM1";
#[cfg(not(windows))]
const DEFAULT_DEVICE: &str = "/dev/ttyS0";

/// Device-side agent for the Amiga Explorer serial link.
#[derive(Parser, Debug)]
#[command(name = "axd", version, about)]
struct Cli {
    /// Increase verbosity (repeatable).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Serial baud rate.
    #[arg(short = 'b', long = "baud", default_value_t = 19200)]
    baud: u32,

    /// Serial device.
    #[arg(short = 'D', long = "device", default_value = DEFAULT_DEVICE)]
    device: String,

    /// Volume table config file (TOML). Without it the current
    /// directory is exported as the volume `Work`.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(match cli.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        })
        .init();

    println!(
        "{}",
        format!("axd {}", env!("CARGO_PKG_VERSION")).green().bold()
    );

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default_export()?,
    };
    let volumes = VolumeTable::from_config(&config)?;

    let stop = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler({
        let stop = stop.clone();
        move || stop.store(true, Ordering::Release)
    })
    .context("cannot install CTRL-C handler")?;

    info!("opening {} at {} baud", cli.device, cli.baud);
    let port = serialport::new(&cli.device, cli.baud)
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .flow_control(serialport::FlowControl::Hardware)
        .timeout(Duration::from_secs(1))
        .open()
        .with_context(|| format!("cannot open serial device {}", cli.device))?;

    let mut agent = Agent::new(port, stop, volumes);
    match agent.run() {
        Err(e) if matches!(e.downcast_ref::<LinkError>(), Some(LinkError::Interrupted)) => {
            info!("interrupted, goodbye");
            Ok(())
        }
        other => other,
    }
}
