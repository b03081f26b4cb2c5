//! Flash loader for NXP LPC11xx/13xx parts: programs a raw binary through
//! the on-chip IAP ROM.

use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use swddude::cli::ProbeOptions;
use swddude::dap::DebugAccessPort;
use swddude::flash::{lpc, FirmwareImage};
use swddude::probe::swd::SwdDriver;
use swddude::target::Target;

#[derive(Parser)]
#[command(
    name = "swddude",
    about = "Flash NXP LPC11xx/13xx parts over SWD",
    version
)]
struct Cli {
    #[command(flatten)]
    probe: ProbeOptions,

    /// Raw little-endian binary to program, starting at flash address 0.
    #[arg(long)]
    flash: PathBuf,

    /// Rewrite the vector-table checksum the LPC boot ROM insists on.
    #[arg(long)]
    fix_lpc_checksum: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.probe.init_logging();

    let mut image = FirmwareImage::from_file(&cli.flash)
        .with_context(|| format!("loading {}", cli.flash.display()))?;

    if cli.fix_lpc_checksum {
        image.fix_lpc_checksum()?;
    }

    let mut swd = cli.probe.attach().context("opening the programmer")?;
    swd.initialize().context("connecting to the target")?;

    let mut dap = DebugAccessPort::new(swd);
    dap.reset_state().context("powering up the debug domains")?;

    {
        let mut target = Target::new(&mut dap, 0);
        target.initialize(true)?;
        target
            .reset_and_halt()
            .context("halting the target at its reset vector")?;

        lpc::unmap_boot_rom(&mut target).context("unmapping the boot ROM")?;

        let part_id = lpc::read_part_id(&mut target).context("reading the part id")?;
        tracing::info!("part id = {:08X}", part_id);

        lpc::program_flash(&mut target, &image).context("programming flash")?;

        if !lpc::verify_flash(&mut target, &image).context("verifying flash")? {
            bail!("verification failed: flash contents differ from the image");
        }
    }

    println!(
        "programmed and verified {} bytes from {}",
        image.len_bytes(),
        cli.flash.display()
    );

    // Reset into the freshly programmed image.
    dap.swd_mut().enter_reset()?;
    sleep(Duration::from_millis(100));
    dap.swd_mut().leave_reset()?;

    Ok(())
}
