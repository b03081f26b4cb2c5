//! A semihosting host: runs the target and services its console
//! requests until interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use signal_hook::consts::signal;

use swddude::cli::ProbeOptions;
use swddude::dap::DebugAccessPort;
use swddude::probe::swd::SwdDriver;
use swddude::semihosting::{self, RawTerminal, StdioConsole};
use swddude::target::Target;

#[derive(Parser)]
#[command(
    name = "swdhost",
    about = "Run the target and serve its semihosting console",
    version
)]
struct Cli {
    #[command(flatten)]
    probe: ProbeOptions,

    /// Echo keystrokes locally; the raw terminal otherwise swallows them.
    #[arg(long)]
    local_echo: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.probe.init_logging();

    let exit = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal::SIGINT, exit.clone())
        .context("installing the SIGINT handler")?;

    let mut swd = cli.probe.attach().context("opening the programmer")?;
    swd.initialize().context("connecting to the target")?;

    // Restart the target with debug armed so nothing runs before we are
    // watching.
    swd.enter_reset()?;
    sleep(Duration::from_millis(10));

    let mut dap = DebugAccessPort::new(swd);
    dap.reset_state().context("powering up the debug domains")?;

    {
        let mut target = Target::new(&mut dap, 0);
        target.initialize(true)?;
        target.reset_halt_state()?;
    }

    dap.swd_mut().leave_reset()?;
    let mut target = Target::new(&mut dap, 0);

    // Raw terminal from here on; the guard restores the settings on every
    // exit path, panics and SIGINT included.
    let _terminal = RawTerminal::enable().context("entering raw terminal mode")?;
    let mut console = StdioConsole {
        local_echo: cli.local_echo,
    };

    while !exit.load(Ordering::Relaxed) {
        if target.is_halted().context("polling the target")? {
            semihosting::service_halt(&mut target, &mut console)
                .context("servicing a semihosting request")?;
        } else {
            sleep(Duration::from_millis(1));
        }
    }

    Ok(())
}
