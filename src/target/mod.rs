//! The target facade: memory, core registers, halt control and
//! breakpoints over a single MEM-AP.
//!
//! Everything here is expressed in terms of word-granular MEM-AP
//! transactions; the MEM-AP's `TAR`/`DRW` pair projects the target's
//! memory bus, and the debug registers in the System Control Space do the
//! rest. WAIT responses are absorbed with bounded retries at this layer.

pub mod scs;

use bitfield::bitfield;

use crate::dap::DebugAccessPort;
use crate::error::{retry, Error, Result, RetryBudget};
use crate::probe::swd::SwdDriver;
use crate::rptr::{Rptr, RptrConst};
use crate::{Halfword, Word};

use scs::{Aircr, BpComp, BpCtrl, Dcrsr, Demcr, Dfsr, Dhcsr};

/// MEM-AP register byte addresses.
pub const MEM_AP_CSW: u8 = 0x00;
pub const MEM_AP_TAR: u8 = 0x04;
pub const MEM_AP_DRW: u8 = 0x0C;
pub const MEM_AP_BASE: u8 = 0xF8;
pub const MEM_AP_IDR: u8 = 0xFC;

/// Reserved CSW bits that must be carried through a modify-write.
const CSW_RESERVED_MASK: u32 = 0xFFFF_F000;

/// The MEM-AP auto-increments `TAR` within an aligned 1 KiB window only;
/// larger transfers must be split at these boundaries.
const AUTOINC_WINDOW: u32 = 0x400;

bitfield! {
    /// MEM-AP Control/Status Word.
    #[derive(Copy, Clone)]
    pub struct Csw(u32);
    impl Debug;
    /// A write transaction is still in flight.
    pub trinprog, _: 7;
    /// Address increment mode; see [`AddrInc`].
    pub u8, addrinc, set_addrinc: 5, 4;
    /// Transfer size as log2 of the byte count.
    pub u8, size, set_size: 2, 0;
}

impl From<u32> for Csw {
    fn from(raw: u32) -> Self {
        Csw(raw)
    }
}

impl From<Csw> for u32 {
    fn from(reg: Csw) -> Self {
        reg.0
    }
}

/// CSW address increment modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddrInc {
    Off = 0,
    Single = 1,
    Packed = 2,
}

/// CSW size encoding for 32-bit transfers.
const SIZE_WORD: u8 = 2;

/// Core and special-purpose registers, numbered the way DCRSR selects
/// them. The numbering has a gap: index 19 is not implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoreRegister {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R7 = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
    /// Union of the processor status registers.
    Xpsr = 16,
    /// Main stack pointer.
    Msp = 17,
    /// Process stack pointer.
    Psp = 18,
    /// CONTROL, PRIMASK and friends, packed.
    Control = 20,
}

impl CoreRegister {
    pub const SP: Self = Self::R13;
    pub const LR: Self = Self::R14;
    pub const PC: Self = Self::R15;

    /// Whether an integer can be safely turned into a register selector.
    pub fn is_implemented(index: u16) -> bool {
        index <= 20 && index != 19
    }

    pub fn from_index(index: u16) -> Result<Self> {
        use CoreRegister::*;
        Ok(match index {
            0 => R0,
            1 => R1,
            2 => R2,
            3 => R3,
            4 => R4,
            5 => R5,
            6 => R6,
            7 => R7,
            8 => R8,
            9 => R9,
            10 => R10,
            11 => R11,
            12 => R12,
            13 => R13,
            14 => R14,
            15 => R15,
            16 => Xpsr,
            17 => Msp,
            18 => Psp,
            20 => Control,
            other => return Err(Error::InvalidRegister(other)),
        })
    }

    fn selector(self) -> u8 {
        self as u8
    }
}

/// The host's view of what the CPU is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    Running,
    Halted,
    Resetting,
}

/// Tunables for a [`Target`].
#[derive(Debug, Clone)]
pub struct TargetOptions {
    /// Poll `CSW.TrInProg` after every single-word write. Off by default:
    /// treating the write as complete on issue works on the supported
    /// parts, and halves the traffic per poke.
    pub verify_writes: bool,
    /// Retry budget for individual MEM-AP accesses.
    pub ap_budget: RetryBudget,
    /// Retry budget for halt polling and reset catches.
    pub halt_budget: RetryBudget,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            verify_writes: false,
            ap_budget: RetryBudget::DAP,
            halt_budget: RetryBudget::HALT,
        }
    }
}

/// A debuggable Cortex-M behind one MEM-AP.
///
/// Holds no target state beyond the host-side CPU state tracker; it can be
/// constructed and dropped freely around a longer-lived
/// [`DebugAccessPort`].
pub struct Target<'dap, D> {
    dap: &'dap mut DebugAccessPort<D>,
    mem_ap: u8,
    options: TargetOptions,
    state: CpuState,
}

impl<'dap, D: SwdDriver> Target<'dap, D> {
    pub fn new(dap: &'dap mut DebugAccessPort<D>, mem_ap: u8) -> Self {
        Self::with_options(dap, mem_ap, TargetOptions::default())
    }

    pub fn with_options(
        dap: &'dap mut DebugAccessPort<D>,
        mem_ap: u8,
        options: TargetOptions,
    ) -> Self {
        Self {
            dap,
            mem_ap,
            options,
            state: CpuState::Running,
        }
    }

    /// The host-side CPU state tracker.
    pub fn state(&self) -> CpuState {
        self.state
    }

    /// Prepares the MEM-AP for word transactions and, unless told
    /// otherwise, enables halting debug. Safe to call repeatedly, though
    /// it will clobber the CSW increment mode.
    pub fn initialize(&mut self, enable_debug: bool) -> Result<()> {
        self.configure_csw(AddrInc::Off)?;

        if enable_debug {
            let dhcsr = Dhcsr::from(self.read_word(scs::DHCSR)?);
            if !dhcsr.c_debugen() {
                let mut value = Dhcsr::from(u32::from(dhcsr) & 0xFFFF);
                value.set_c_debugen(true);
                value.enable_write();
                self.write_word(scs::DHCSR, value.into())?;
            }
        }

        Ok(())
    }

    //
    // Memory access
    //

    /// Reads one word from target memory.
    pub fn read_word(&mut self, address: impl Into<RptrConst<Word>>) -> Result<Word> {
        let address = address.into();
        self.check_word_aligned(address.bits())?;

        self.ap_write(MEM_AP_TAR, address.bits())?;
        self.ap_start_read(MEM_AP_DRW)?;
        let data = self.ap_final_read()?;

        tracing::trace!("read_word({:#010x}) = {:#010x}", address.bits(), data);
        Ok(data)
    }

    /// Writes one word to target memory. With
    /// [`TargetOptions::verify_writes`] set, additionally waits for
    /// `CSW.TrInProg` to clear.
    pub fn write_word(&mut self, address: Rptr<Word>, data: Word) -> Result<()> {
        self.check_word_aligned(address.bits())?;
        tracing::trace!("write_word({:#010x}, {:#010x})", address.bits(), data);

        self.ap_write(MEM_AP_TAR, address.bits())?;
        self.ap_write(MEM_AP_DRW, data)?;

        if self.options.verify_writes {
            self.wait_for_write_complete()?;
        }

        Ok(())
    }

    /// Reads `buffer.len()` consecutive words using pipelined auto-
    /// incrementing reads, splitting transparently at 1 KiB windows.
    pub fn read_words(
        &mut self,
        address: impl Into<RptrConst<Word>>,
        buffer: &mut [Word],
    ) -> Result<()> {
        let address = address.into();
        self.check_word_aligned(address.bits())?;
        if buffer.is_empty() {
            return Ok(());
        }

        self.configure_csw(AddrInc::Single)?;

        let mut addr = address.bits();
        let mut remaining = buffer;
        while !remaining.is_empty() {
            let n = remaining.len().min(Self::words_until_boundary(addr));
            let (chunk, rest) = remaining.split_at_mut(n);

            self.ap_write(MEM_AP_TAR, addr)?;
            self.ap_start_read(MEM_AP_DRW)?;
            for slot in chunk[..n - 1].iter_mut() {
                *slot = self.ap_step_read(MEM_AP_DRW)?;
            }
            chunk[n - 1] = self.ap_final_read()?;

            addr = addr.wrapping_add((n * 4) as u32);
            remaining = rest;
        }

        Ok(())
    }

    /// Writes `buffer.len()` consecutive words using auto-incrementing
    /// writes, splitting transparently at 1 KiB windows.
    pub fn write_words(&mut self, buffer: &[Word], address: Rptr<Word>) -> Result<()> {
        self.check_word_aligned(address.bits())?;
        if buffer.is_empty() {
            return Ok(());
        }

        self.configure_csw(AddrInc::Single)?;

        let mut addr = address.bits();
        let mut remaining = buffer;
        while !remaining.is_empty() {
            let n = remaining.len().min(Self::words_until_boundary(addr));
            let (chunk, rest) = remaining.split_at(n);

            self.ap_write(MEM_AP_TAR, addr)?;
            for &word in chunk {
                self.ap_write(MEM_AP_DRW, word)?;
            }

            addr = addr.wrapping_add((n * 4) as u32);
            remaining = rest;
        }

        Ok(())
    }

    //
    // Core register access
    //

    /// Reads a core register. Only meaningful while the CPU is halted.
    pub fn read_register(&mut self, register: CoreRegister) -> Result<Word> {
        let mut dcrsr = Dcrsr::default();
        dcrsr.set_regsel(register.selector());
        self.write_word(scs::DCRSR, dcrsr.into())?;

        self.wait_for_register_ready()?;
        self.read_word(scs::DCRDR)
    }

    /// Writes a core register. Only meaningful while the CPU is halted.
    pub fn write_register(&mut self, register: CoreRegister, data: Word) -> Result<()> {
        self.write_word(scs::DCRDR, data)?;

        let mut dcrsr = Dcrsr::default();
        dcrsr.set_regsel(register.selector());
        dcrsr.set_regwnr(true);
        self.write_word(scs::DCRSR, dcrsr.into())?;

        self.wait_for_register_ready()
    }

    //
    // Halt and reset control
    //

    /// Requests a halt. The CPU enters Debug state within a few cycles;
    /// poll [`Target::is_halted`] if the distinction matters.
    pub fn halt(&mut self) -> Result<()> {
        let mut value = Dhcsr::from(0);
        value.set_c_debugen(true);
        value.set_c_halt(true);
        value.enable_write();
        self.write_word(scs::DHCSR, value.into())?;

        self.state = CpuState::Halted;
        Ok(())
    }

    /// Resumes execution at the address in the debug return register.
    pub fn resume(&mut self) -> Result<()> {
        let mut value = Dhcsr::from(0);
        value.set_c_debugen(true);
        value.enable_write();
        self.write_word(scs::DHCSR, value.into())?;

        self.state = CpuState::Running;
        Ok(())
    }

    pub fn is_halted(&mut self) -> Result<bool> {
        let dhcsr = Dhcsr::from(self.read_word(scs::DHCSR)?);
        Ok(dhcsr.s_halt())
    }

    /// The sticky halt-reason bits from DFSR.
    pub fn read_halt_state(&mut self) -> Result<Dfsr> {
        let dfsr = self.read_word(scs::DFSR)?;
        Ok(Dfsr::from(dfsr & Dfsr::REASON_MASK))
    }

    /// Clears every sticky halt-reason bit.
    pub fn reset_halt_state(&mut self) -> Result<()> {
        self.write_word(scs::DFSR, Dfsr::clear_all().into())
    }

    /// Resets the CPU and catches it at the reset vector.
    ///
    /// Snapshots DEMCR, arms the core-reset vector catch, requests a
    /// system reset through AIRCR, waits for the catch to fire, and
    /// restores DEMCR. On a timeout the CPU state is unobservable: the
    /// tracker falls back to `Running` and the caller must issue a fresh
    /// `halt` before relying on anything.
    pub fn reset_and_halt(&mut self) -> Result<()> {
        self.state = CpuState::Resetting;

        let saved_demcr = self.read_word(scs::DEMCR)?;

        let mut demcr = Demcr::from(saved_demcr);
        demcr.set_vc_corereset(true);
        demcr.set_vc_harderr(true);
        demcr.set_dwtena(true);
        self.write_word(scs::DEMCR, demcr.into())?;

        let mut aircr = Aircr::default();
        aircr.set_vectkey();
        aircr.set_sysresetreq(true);
        self.write_word(scs::AIRCR, aircr.into())?;

        let budget = self.options.halt_budget;
        let caught = retry(budget, || {
            let halted = self.is_halted()?;
            let dfsr = Dfsr::from(self.read_word(scs::DFSR)?);
            if halted && dfsr.vcatch() {
                Ok(())
            } else {
                Err(Error::Wait)
            }
        });

        let restored = self.write_word(scs::DEMCR, saved_demcr);

        match caught {
            Ok(()) => {
                restored?;
                self.state = CpuState::Halted;
                Ok(())
            }
            Err(Error::RetriesExhausted(_)) => {
                self.state = CpuState::Running;
                Err(Error::HaltTimeout)
            }
            Err(other) => {
                self.state = CpuState::Running;
                Err(other)
            }
        }
    }

    //
    // Breakpoints
    //

    /// Turns the breakpoint unit on.
    pub fn enable_breakpoints(&mut self) -> Result<()> {
        self.write_bp_ctrl(true)
    }

    /// Turns the breakpoint unit off without touching the comparators.
    pub fn disable_breakpoints(&mut self) -> Result<()> {
        self.write_bp_ctrl(false)
    }

    pub fn are_breakpoints_enabled(&mut self) -> Result<bool> {
        let ctrl = BpCtrl::from(self.read_word(scs::BP_CTRL)?);
        Ok(ctrl.enable())
    }

    /// How many comparators the breakpoint unit implements.
    pub fn breakpoint_count(&mut self) -> Result<usize> {
        let ctrl = BpCtrl::from(self.read_word(scs::BP_CTRL)?);
        Ok(ctrl.num_code() as usize)
    }

    /// Points comparator `index` at `address` and enables it.
    ///
    /// The address must lie in the code region (bottom 512 MiB). Bit 0 is
    /// ignored so Thumb-style addresses are acceptable; bit 1 selects
    /// which halfword of the comparison word triggers.
    pub fn enable_breakpoint(&mut self, index: usize, address: RptrConst<Halfword>) -> Result<()> {
        let bits = address.bits();
        if bits & 0xE000_0000 != 0 {
            return Err(Error::Argument(
                "breakpoint address must be in the code region",
            ));
        }

        let mut comp = BpComp::default();
        comp.set_bp_match(if address.bit::<1>() {
            scs::MATCH_HIGH
        } else {
            scs::MATCH_LOW
        });
        comp.set_comp((bits >> 2) & 0x07FF_FFFF);
        comp.set_enable(true);

        self.write_word(scs::BP_COMP0 + index as i32, comp.into())
    }

    /// Disables comparator `index`.
    pub fn disable_breakpoint(&mut self, index: usize) -> Result<()> {
        self.write_word(scs::BP_COMP0 + index as i32, 0)
    }

    //
    // Plumbing
    //

    fn write_bp_ctrl(&mut self, enable: bool) -> Result<()> {
        // The KEY bit must accompany every write or the unit ignores it.
        let mut ctrl = BpCtrl::default();
        ctrl.set_key(true);
        ctrl.set_enable(enable);
        self.write_word(scs::BP_CTRL, ctrl.into())
    }

    fn check_word_aligned(&self, address: u32) -> Result<()> {
        if address & 3 != 0 {
            return Err(Error::Argument("address must be word-aligned"));
        }
        Ok(())
    }

    /// Words left before `address`'s 1 KiB auto-increment window ends.
    fn words_until_boundary(address: u32) -> usize {
        ((AUTOINC_WINDOW - (address & (AUTOINC_WINDOW - 1))) / 4) as usize
    }

    /// Rewrites CSW for word transfers in the given increment mode,
    /// preserving the reserved bits.
    fn configure_csw(&mut self, increment: AddrInc) -> Result<()> {
        self.ap_start_read(MEM_AP_CSW)?;
        let old = self.ap_final_read()?;

        let mut csw = Csw::from(old & CSW_RESERVED_MASK);
        csw.set_addrinc(increment as u8);
        csw.set_size(SIZE_WORD);

        self.ap_write(MEM_AP_CSW, csw.into())
    }

    fn wait_for_write_complete(&mut self) -> Result<()> {
        let budget = self.options.ap_budget;
        retry(budget, || {
            self.ap_start_read(MEM_AP_CSW)?;
            let csw = Csw::from(self.ap_final_read()?);
            if csw.trinprog() {
                Err(Error::Wait)
            } else {
                Ok(())
            }
        })
    }

    fn wait_for_register_ready(&mut self) -> Result<()> {
        let budget = self.options.ap_budget;
        retry(budget, || {
            let dhcsr = Dhcsr::from(self.read_word(scs::DHCSR)?);
            if dhcsr.s_regrdy() {
                Ok(())
            } else {
                Err(Error::Wait)
            }
        })
    }

    fn ap_write(&mut self, address: u8, data: Word) -> Result<()> {
        let budget = self.options.ap_budget;
        retry(budget, || self.dap.write_ap(self.mem_ap, address, data))
    }

    fn ap_start_read(&mut self, address: u8) -> Result<()> {
        let budget = self.options.ap_budget;
        retry(budget, || self.dap.start_read_ap(self.mem_ap, address))
    }

    fn ap_step_read(&mut self, address: u8) -> Result<Word> {
        let budget = self.options.ap_budget;
        retry(budget, || self.dap.step_read_ap(self.mem_ap, address))
    }

    fn ap_final_read(&mut self) -> Result<Word> {
        let budget = self.options.ap_budget;
        retry(budget, || self.dap.read_rdbuff())
    }
}
