//! Debug-related registers in the System Control Space, plus the
//! BreakPoint Unit.
//!
//! Definitions follow the ARMv6-M architecture reference manual; where
//! ARMv7-M is compatible (its FPB accepts the same programming model as
//! the v6-M BPU) the v6-M name is used.

use bitfield::bitfield;

use crate::rptr::Rptr;
use crate::Word;

/// Debug Halting Control and Status Register.
pub const DHCSR: Rptr<Word> = Rptr::new(0xE000_EDF0);
/// Debug Core Register Selector Register.
pub const DCRSR: Rptr<Word> = Rptr::new(0xE000_EDF4);
/// Debug Core Register Data Register.
pub const DCRDR: Rptr<Word> = Rptr::new(0xE000_EDF8);
/// Debug Exception and Monitor Control Register.
pub const DEMCR: Rptr<Word> = Rptr::new(0xE000_EDFC);
/// Application Interrupt and Reset Control Register.
pub const AIRCR: Rptr<Word> = Rptr::new(0xE000_ED0C);
/// Debug Fault Status Register.
pub const DFSR: Rptr<Word> = Rptr::new(0xE000_ED30);
/// CPUID base register.
pub const CPUID: Rptr<Word> = Rptr::new(0xE000_ED00);

/// Breakpoint Unit control register.
pub const BP_CTRL: Rptr<Word> = Rptr::new(0xE000_2000);
/// First breakpoint comparator; the architecture allows up to eight,
/// at consecutive word addresses.
pub const BP_COMP0: Rptr<Word> = Rptr::new(0xE000_2008);

bitfield! {
    /// Debug Halting Control and Status Register (ARMv6-M C1.6.3).
    ///
    /// The S_* bits are status on read; the C_* bits control halting debug
    /// on write. Writes take effect only when the debug key is present in
    /// the top halfword, so call [`Dhcsr::enable_write`] first.
    #[derive(Copy, Clone)]
    pub struct Dhcsr(u32);
    impl Debug;
    /// Sticky: the core has reset since the last DHCSR read.
    pub s_reset_st, _: 25;
    /// Sticky: an instruction has retired since the last DHCSR read.
    pub s_retire_st, _: 24;
    /// The core is locked up on an unrecoverable exception.
    pub s_lockup, _: 19;
    /// The core is sleeping; set C_HALT to take control.
    pub s_sleep, _: 18;
    /// The core is in Debug state.
    pub s_halt, _: 17;
    /// Handshake for DCRSR/DCRDR transfers: cleared by a DCRSR write, set
    /// when the transfer completes.
    pub s_regrdy, _: 16;
    pub c_maskints, set_c_maskints: 3;
    pub c_step, set_c_step: 2;
    pub c_halt, set_c_halt: 1;
    pub c_debugen, set_c_debugen: 0;
}

impl Dhcsr {
    const DBGKEY: u32 = 0xA05F << 16;

    /// Installs the debug key so a write will be accepted.
    pub fn enable_write(&mut self) {
        self.0 = (self.0 & 0xFFFF) | Self::DBGKEY;
    }
}

bitfield! {
    /// Debug Core Register Selector Register (write-only).
    #[derive(Copy, Clone, Default)]
    pub struct Dcrsr(u32);
    impl Debug;
    /// Direction: 1 writes the selected register from DCRDR, 0 reads it
    /// into DCRDR.
    pub regwnr, set_regwnr: 16;
    pub u8, regsel, set_regsel: 4, 0;
}

bitfield! {
    /// Debug Fault Status Register. All reason bits are sticky and clear
    /// on a write of one.
    #[derive(Copy, Clone, Default)]
    pub struct Dfsr(u32);
    impl Debug;
    /// Halt caused by the external debug request signal.
    pub external, _: 4;
    /// Halt caused by a vector catch.
    pub vcatch, _: 3;
    /// Halt caused by a DWT watchpoint.
    pub dwttrap, _: 2;
    /// Halt caused by a breakpoint (BKPT instruction or BPU comparator).
    pub bkpt, _: 1;
    /// Halt caused by C_HALT or single-step.
    pub halted, _: 0;
}

impl Dfsr {
    /// All five halt-reason bits.
    pub const REASON_MASK: u32 = 0x1F;

    /// A value that, written back, clears every reason bit.
    pub fn clear_all() -> Self {
        Dfsr(Self::REASON_MASK)
    }
}

bitfield! {
    /// Application Interrupt and Reset Control Register (ARMv6-M B3.2.6).
    ///
    /// Writes are ignored unless the vector key 0x05FA is in the top
    /// halfword, so call [`Aircr::set_vectkey`] first.
    #[derive(Copy, Clone, Default)]
    pub struct Aircr(u32);
    impl Debug;
    pub u16, vectkeystat, set_vectkey_raw: 31, 16;
    pub endianness, _: 15;
    /// Requests a system reset from the external reset controller.
    pub sysresetreq, set_sysresetreq: 2;
    pub vectclractive, set_vectclractive: 1;
}

impl Aircr {
    pub fn set_vectkey(&mut self) {
        self.set_vectkey_raw(0x05FA);
    }
}

bitfield! {
    /// Debug Exception and Monitor Control Register (ARMv6-M C1.6.6).
    #[derive(Copy, Clone)]
    pub struct Demcr(u32);
    impl Debug;
    /// Global DWT enable.
    pub dwtena, set_dwtena: 24;
    /// Halt on HardFault.
    pub vc_harderr, set_vc_harderr: 10;
    /// Halt on reset: the vector catch that makes reset-and-halt work.
    pub vc_corereset, set_vc_corereset: 0;
}

bitfield! {
    /// Breakpoint Unit control register (ARMv6-M C1.8).
    ///
    /// The KEY bit reads as zero but must be written as one or the entire
    /// write is ignored.
    #[derive(Copy, Clone, Default)]
    pub struct BpCtrl(u32);
    impl Debug;
    /// Number of implemented comparators; zero means no breakpoint
    /// support.
    pub u8, num_code, _: 7, 4;
    pub _, set_key: 1;
    pub enable, set_enable: 0;
}

bitfield! {
    /// A breakpoint comparator.
    #[derive(Copy, Clone, Default)]
    pub struct BpComp(u32);
    impl Debug;
    /// 00 no match, 01 match the lower halfword, 10 the upper, 11 both.
    pub u8, bp_match, set_bp_match: 31, 30;
    /// Bits [28:2] of the comparison address.
    pub comp, set_comp: 28, 2;
    pub enable, set_enable: 0;
}

pub const MATCH_LOW: u8 = 0b01;
pub const MATCH_HIGH: u8 = 0b10;

macro_rules! word_register {
    ($($name:ident),*) => {
        $(
            impl From<u32> for $name {
                fn from(raw: u32) -> Self {
                    $name(raw)
                }
            }

            impl From<$name> for u32 {
                fn from(reg: $name) -> Self {
                    reg.0
                }
            }
        )*
    };
}

word_register!(Dhcsr, Dcrsr, Dfsr, Aircr, Demcr, BpCtrl, BpComp);

impl Default for Dhcsr {
    fn default() -> Self {
        let mut value = Dhcsr(0);
        value.enable_write();
        value
    }
}

impl Default for Demcr {
    fn default() -> Self {
        Demcr(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dhcsr_write_key() {
        let mut dhcsr = Dhcsr(0xFFFF_FFFF);
        dhcsr.enable_write();
        assert_eq!(dhcsr.0, 0xA05F_FFFF);
    }

    #[test]
    fn aircr_sysresetreq_encoding() {
        let mut aircr = Aircr::default();
        aircr.set_vectkey();
        aircr.set_sysresetreq(true);
        assert_eq!(u32::from(aircr), 0x05FA_0004);
    }

    #[test]
    fn dfsr_reason_bits() {
        let dfsr = Dfsr(0x0A);
        assert!(dfsr.vcatch());
        assert!(dfsr.bkpt());
        assert!(!dfsr.halted());
        assert_eq!(u32::from(Dfsr::clear_all()), 0x1F);
    }

    #[test]
    fn demcr_vector_catch_bits() {
        let mut demcr = Demcr::default();
        demcr.set_vc_corereset(true);
        demcr.set_vc_harderr(true);
        demcr.set_dwtena(true);
        assert_eq!(u32::from(demcr), (1 << 24) | (1 << 10) | 1);
    }
}
