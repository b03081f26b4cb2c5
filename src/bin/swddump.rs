//! Dumps the first words of a target's flash over SWD.

use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use swddude::cli::ProbeOptions;
use swddude::dap::DebugAccessPort;
use swddude::flash::lpc;
use swddude::probe::swd::SwdDriver;
use swddude::rptr::RptrConst;
use swddude::target::Target;
use swddude::Word;

#[derive(Parser)]
#[command(
    name = "swddump",
    about = "Dump the first words of a target's flash",
    version
)]
struct Cli {
    #[command(flatten)]
    probe: ProbeOptions,

    /// How many words to dump.
    #[arg(long, default_value_t = 32)]
    count: u32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.probe.init_logging();

    let mut swd = cli.probe.attach().context("opening the programmer")?;
    swd.initialize().context("connecting to the target")?;

    // Hold the chip in reset briefly so it comes up in a known state.
    swd.enter_reset()?;
    sleep(Duration::from_millis(100));
    swd.leave_reset()?;

    let mut dap = DebugAccessPort::new(swd);
    dap.reset_state().context("powering up the debug domains")?;

    let mut target = Target::new(&mut dap, 0);
    target.initialize(true)?;
    target.halt()?;

    lpc::unmap_boot_rom(&mut target).context("unmapping the boot ROM")?;

    let mut words: Vec<Word> = vec![0; cli.count as usize];
    target
        .read_words(RptrConst::<Word>::new(0), &mut words)
        .context("reading flash")?;

    println!("First {} words of flash:", cli.count);
    for (index, word) in words.iter().enumerate() {
        println!("  [{:08X}] {word:08X}", index * 4);
    }

    Ok(())
}
