//! Command line plumbing shared by the tool front-ends: probe selection,
//! logging setup, and the attach sequence that every tool starts with.

use clap::Args;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};
use crate::probe::ftdi::FtdiDevice;
use crate::probe::swd::MpsseSwdDriver;
use crate::probe::{lookup_programmer, Programmer};

/// The nominal SWD clock every tool runs at.
const SWD_CLOCK_HZ: u32 = 1_000_000;

/// Options every tool accepts for picking and opening a probe.
#[derive(Debug, Args)]
pub struct ProbeOptions {
    /// Debug logging verbosity (0 = warnings only, 3 = full trace).
    #[arg(long, default_value_t = 0)]
    pub debug: u8,

    /// Which FTDI-based programmer to use.
    #[arg(long, default_value = "um232h")]
    pub programmer: String,

    /// Override the programmer's USB vendor ID (decimal or 0x-prefixed).
    #[arg(long, value_parser = parse_id)]
    pub vid: Option<u16>,

    /// Override the programmer's USB product ID (decimal or 0x-prefixed).
    #[arg(long, value_parser = parse_id)]
    pub pid: Option<u16>,

    /// Override the programmer's FTDI interface number.
    #[arg(long)]
    pub interface: Option<u8>,
}

fn parse_id(text: &str) -> std::result::Result<u16, String> {
    let parsed = if let Some(hex) = text.strip_prefix("0x") {
        u16::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    parsed.map_err(|e| format!("invalid USB id {text:?}: {e}"))
}

impl ProbeOptions {
    /// Installs a stderr tracing subscriber at the requested verbosity.
    /// `RUST_LOG` still wins when set.
    pub fn init_logging(&self) {
        let level = match self.debug {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        };

        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(level.into())
                    .from_env_lossy(),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    /// The adapter table entry with any command line overrides applied.
    pub fn programmer(&self) -> Result<Programmer> {
        let mut config = *lookup_programmer(&self.programmer)
            .ok_or_else(|| Error::UnknownProgrammer(self.programmer.clone()))?;

        if let Some(vid) = self.vid {
            config.vendor_id = vid;
        }
        if let Some(pid) = self.pid {
            config.product_id = pid;
        }
        if let Some(interface) = self.interface {
            config.interface = interface;
        }

        Ok(config)
    }

    /// Opens the probe, brings the MPSSE engine up at the nominal SWD
    /// clock, and wraps it in an SWD driver. The driver still needs
    /// `initialize()` to connect to the target.
    pub fn attach(&self) -> Result<MpsseSwdDriver<FtdiDevice>> {
        let programmer = self.programmer()?;

        let mut device = FtdiDevice::open(&programmer)?;
        device.attach(&programmer, SWD_CLOCK_HZ)?;

        Ok(MpsseSwdDriver::new(device, programmer))
    }
}
