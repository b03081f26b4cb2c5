//! Surveys the debug topology of an SWD-connected target: DP identity,
//! access ports, and the CPU behind the MEM-AP.

use anyhow::{Context, Result};
use clap::Parser;

use swddude::cli::ProbeOptions;
use swddude::dap::DebugAccessPort;
use swddude::error::{retry, RetryBudget};
use swddude::probe::swd::SwdDriver;
use swddude::target::{scs, Target, MEM_AP_BASE, MEM_AP_CSW, MEM_AP_IDR};
use swddude::Error;

#[derive(Parser)]
#[command(
    name = "swdprobe",
    about = "Survey the debug topology of an SWD-connected target",
    version
)]
struct Cli {
    #[command(flatten)]
    probe: ProbeOptions,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.probe.init_logging();

    let mut swd = cli.probe.attach().context("opening the programmer")?;
    let idcode = swd.initialize().context("connecting to the target")?;

    println!("Debug Port IDCODE = {idcode:08X}");
    println!("  version:  {:X}", idcode >> 28);
    println!("  part:     {:X}", (idcode >> 12) & 0xFFFF);
    println!("  designer: {:X}", (idcode >> 1) & 0x7FF);

    let mut dap = DebugAccessPort::new(swd);
    dap.reset_state().context("powering up the debug domains")?;

    for ap in 0..=255u8 {
        let idr = read_idr_with_recovery(&mut dap, ap)
            .with_context(|| format!("reading IDR of AP {ap:02X}"))?;

        if idr == 0 {
            continue;
        }

        println!("AP {ap:02X} IDR = {idr:08X}");

        if idr & (1 << 16) != 0 {
            inspect_mem_ap(&mut dap, ap)
                .with_context(|| format!("inspecting MEM-AP {ap:02X}"))?;
        } else {
            println!("  not a MEM-AP");
        }
    }

    Ok(())
}

/// Reads an AP's IDR, allowing one line-reset recovery if the wire
/// protocol itself derails (a WAIT storm is handled by the retry budget;
/// a garbled acknowledge or parity error gets a fresh line).
fn read_idr_with_recovery(
    dap: &mut DebugAccessPort<impl SwdDriver>,
    ap: u8,
) -> swddude::Result<u32> {
    match retry(RetryBudget::DAP, || dap.read_ap(ap, MEM_AP_IDR)) {
        Err(e @ (Error::UnexpectedAck(_) | Error::IncorrectParity)) => {
            tracing::warn!("protocol error on AP {ap:02X} ({e}); resetting the SWD line");
            dap.swd_mut().initialize()?;
            dap.reset_state()?;
            retry(RetryBudget::DAP, || dap.read_ap(ap, MEM_AP_IDR))
        }
        Err(Error::Fault) => {
            tracing::warn!("FAULT on AP {ap:02X}; clearing sticky errors");
            dap.reset_state()?;
            retry(RetryBudget::DAP, || dap.read_ap(ap, MEM_AP_IDR))
        }
        Err(e @ Error::RetriesExhausted(_)) => {
            // Leave the DAP usable for whoever runs next, then report.
            let _ = dap.reset_state();
            Err(e)
        }
        other => other,
    }
}

fn inspect_mem_ap(
    dap: &mut DebugAccessPort<impl SwdDriver>,
    ap: u8,
) -> swddude::Result<()> {
    let base = retry(RetryBudget::DAP, || dap.read_ap(ap, MEM_AP_BASE))?;
    let csw = retry(RetryBudget::DAP, || dap.read_ap(ap, MEM_AP_CSW))?;
    println!("  BASE = {base:08X}, CSW = {csw:08X}");

    if base & 0x3 != 0x3 {
        println!("  legacy device, no debug register file");
        return Ok(());
    }

    let mut target = Target::new(dap, ap);
    target.initialize(false)?;

    let cpuid = target.read_word(scs::CPUID)?;
    println!("  CPUID = {cpuid:08X}");
    println!(
        "  implementer {:02X}, architecture {:X}, part {:03X}, r{}p{}",
        cpuid >> 24,
        (cpuid >> 16) & 0xF,
        (cpuid >> 4) & 0xFFF,
        (cpuid >> 20) & 0xF,
        cpuid & 0xF,
    );

    Ok(())
}
