//! The ADIv5 Debug Access Port: the DP register model layered over an SWD
//! driver.
//!
//! The DP has four word-addressed registers, several of which are
//! read/write pairs of different registers at the same address, and one of
//! which (`CTRL/STAT` vs `WCR`) is banked by the `CTRLSEL` bit of
//! `SELECT`. Access Port registers are reached through the bank named in
//! `SELECT`, and AP reads are *posted*: each read returns the result of
//! the previous one, with `RDBUFF` draining the last.
//!
//! A host-side copy of `SELECT` avoids rewriting it for every access.

use bitfield::bitfield;

use crate::error::Result;
use crate::probe::swd::{Port, SwdDriver};
use crate::{Error, Word};

/// DP register word addresses.
const REG_IDCODE: u8 = 0; // read
const REG_ABORT: u8 = 0; // write
const REG_CTRLSTAT: u8 = 1; // CTRLSEL = 0
const REG_SELECT: u8 = 2; // write
const REG_RESEND: u8 = 2; // read
const REG_RDBUFF: u8 = 3; // read

bitfield! {
    /// The DP identification register.
    #[derive(Copy, Clone)]
    pub struct Idcode(u32);
    impl Debug;
    pub u8, version, _: 31, 28;
    pub u16, partno, _: 27, 12;
    pub u16, designer, _: 11, 1;
}

impl From<u32> for Idcode {
    fn from(raw: u32) -> Self {
        Idcode(raw)
    }
}

impl From<Idcode> for u32 {
    fn from(reg: Idcode) -> Self {
        reg.0
    }
}

bitfield! {
    /// The write-only abort register. Write-1 bits clear the sticky error
    /// flags in `CTRL/STAT`.
    #[derive(Copy, Clone, Default)]
    pub struct Abort(u32);
    impl Debug;
    pub _, set_orunerrclr: 4;
    pub _, set_wderrclr: 3;
    pub _, set_stkerrclr: 2;
    pub _, set_stkcmpclr: 1;
    pub _, set_dapabort: 0;
}

impl Abort {
    /// An abort that clears all four sticky error flags.
    pub fn clear_sticky_errors() -> Self {
        let mut abort = Abort::default();
        abort.set_stkcmpclr(true);
        abort.set_stkerrclr(true);
        abort.set_wderrclr(true);
        abort.set_orunerrclr(true);
        abort
    }
}

impl From<u32> for Abort {
    fn from(raw: u32) -> Self {
        Abort(raw)
    }
}

impl From<Abort> for u32 {
    fn from(reg: Abort) -> Self {
        reg.0
    }
}

bitfield! {
    /// The DP control/status register.
    #[derive(Copy, Clone, Default)]
    pub struct CtrlStat(u32);
    impl Debug;
    pub csyspwrupack, _: 31;
    pub csyspwrupreq, set_csyspwrupreq: 30;
    pub cdbgpwrupack, _: 29;
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    pub wdataerr, _: 7;
    pub readok, _: 6;
    pub stickyerr, _: 5;
    pub stickycmp, _: 4;
    pub u8, trnmode, set_trnmode: 3, 2;
    pub stickyorun, _: 1;
    pub orundetect, set_orundetect: 0;
}

impl From<u32> for CtrlStat {
    fn from(raw: u32) -> Self {
        CtrlStat(raw)
    }
}

impl From<CtrlStat> for u32 {
    fn from(reg: CtrlStat) -> Self {
        reg.0
    }
}

bitfield! {
    /// The write-only AP/bank select register.
    #[derive(Copy, Clone, Default)]
    pub struct Select(u32);
    impl Debug;
    pub u8, apsel, set_apsel: 31, 24;
    pub u8, apbanksel, set_apbanksel: 7, 4;
    pub ctrlsel, set_ctrlsel: 0;
}

impl From<u32> for Select {
    fn from(raw: u32) -> Self {
        Select(raw)
    }
}

impl From<Select> for u32 {
    fn from(reg: Select) -> Self {
        reg.0
    }
}

/// The Debug Access Port over some SWD driver.
///
/// Holds the only host-side DP state: a cache of the last value written to
/// `SELECT`. The cache starts out unknown and becomes authoritative after
/// the first write; [`DebugAccessPort::reset_state`] forces it to zero.
#[derive(Debug)]
pub struct DebugAccessPort<D> {
    swd: D,
    select: Option<u32>,
}

impl<D: SwdDriver> DebugAccessPort<D> {
    pub fn new(swd: D) -> Self {
        Self { swd, select: None }
    }

    /// Access to the underlying driver, for reset-line control.
    pub fn swd_mut(&mut self) -> &mut D {
        &mut self.swd
    }

    pub fn into_swd(self) -> D {
        self.swd
    }

    /// Puts the DP into a known-good state: `SELECT` zeroed, all sticky
    /// errors cleared, and the system/debug power domains requested up.
    /// This is the idempotent recovery action after a FAULT.
    pub fn reset_state(&mut self) -> Result<()> {
        self.write_select(0)?;
        self.write_abort(Abort::clear_sticky_errors())?;

        let mut ctrl = CtrlStat::default();
        ctrl.set_csyspwrupreq(true);
        ctrl.set_cdbgpwrupreq(true);
        self.write_ctrlstat(ctrl)
    }

    /// Reads IDCODE. Never answered with WAIT, so there is no retry
    /// discipline to apply.
    pub fn read_idcode(&mut self) -> Result<Idcode> {
        self.swd.read(Port::Debug, REG_IDCODE).map(Idcode)
    }

    /// Writes ABORT. Never answered with WAIT.
    pub fn write_abort(&mut self, abort: Abort) -> Result<()> {
        self.swd.write(Port::Debug, REG_ABORT, abort.into())
    }

    pub fn read_ctrlstat(&mut self) -> Result<CtrlStat> {
        self.with_ctrlsel(false)?;
        self.swd.read(Port::Debug, REG_CTRLSTAT).map(CtrlStat)
    }

    pub fn write_ctrlstat(&mut self, value: CtrlStat) -> Result<()> {
        self.with_ctrlsel(false)?;
        self.swd.write(Port::Debug, REG_CTRLSTAT, value.into())
    }

    /// Reads the wire control register, which shares an address with
    /// `CTRL/STAT` and is reached by setting `CTRLSEL`.
    pub fn read_wcr(&mut self) -> Result<Word> {
        self.with_ctrlsel(true)?;
        self.swd.read(Port::Debug, REG_CTRLSTAT)
    }

    pub fn write_wcr(&mut self, value: Word) -> Result<()> {
        self.with_ctrlsel(true)?;
        self.swd.write(Port::Debug, REG_CTRLSTAT, value)
    }

    /// Writes `SELECT` and updates the cache.
    pub fn write_select(&mut self, value: Word) -> Result<()> {
        self.swd.write(Port::Debug, REG_SELECT, value)?;
        self.select = Some(value);
        Ok(())
    }

    /// Re-reads the data from the last transport-level corruption victim.
    pub fn read_resend(&mut self) -> Result<Word> {
        self.swd.read(Port::Debug, REG_RESEND)
    }

    /// Drains the result of the last posted AP read without issuing a new
    /// one.
    pub fn read_rdbuff(&mut self) -> Result<Word> {
        self.swd.read(Port::Debug, REG_RDBUFF)
    }

    /// Points `SELECT` at the AP register bank containing byte address
    /// `address`, preserving `CTRLSEL`. No write is issued when the cached
    /// value already matches.
    pub fn select_ap_bank(&mut self, ap: u8, address: u8) -> Result<()> {
        let ctrlsel = self.select.map(|s| s & 1).unwrap_or(0);
        let proposed = u32::from(ap) << 24 | u32::from(address & 0xF0) | ctrlsel;

        if self.select != Some(proposed) {
            self.write_select(proposed)?;
        }

        Ok(())
    }

    /// Issues an AP read and discards the (stale) returned word. The
    /// result becomes available to the next AP read or to `RDBUFF`.
    pub fn start_read_ap(&mut self, ap: u8, address: u8) -> Result<()> {
        self.ap_register(ap, address)
            .and_then(|reg| self.swd.read(Port::Access, reg))
            .map(drop)
    }

    /// Issues an AP read and returns the result of the *previous* one.
    pub fn step_read_ap(&mut self, ap: u8, address: u8) -> Result<Word> {
        self.ap_register(ap, address)
            .and_then(|reg| self.swd.read(Port::Access, reg))
    }

    /// A non-pipelined AP read: post, then drain through `RDBUFF`.
    pub fn read_ap(&mut self, ap: u8, address: u8) -> Result<Word> {
        self.start_read_ap(ap, address)?;
        self.read_rdbuff()
    }

    pub fn write_ap(&mut self, ap: u8, address: u8, data: Word) -> Result<()> {
        self.ap_register(ap, address)
            .and_then(|reg| self.swd.write(Port::Access, reg, data))
    }

    /// Selects the right bank for an AP byte address and returns the word
    /// address within the bank.
    fn ap_register(&mut self, ap: u8, address: u8) -> Result<u8> {
        if address & 3 != 0 {
            return Err(Error::Argument("AP register address must be word-aligned"));
        }

        self.select_ap_bank(ap, address)?;
        Ok((address >> 2) & 3)
    }

    /// Rewrites `SELECT` if `CTRLSEL` does not match `wanted`. An unknown
    /// cache is resolved by writing zero (with `CTRLSEL` as requested).
    fn with_ctrlsel(&mut self, wanted: bool) -> Result<()> {
        let target_bit = u32::from(wanted);

        match self.select {
            Some(current) if current & 1 == target_bit => Ok(()),
            Some(current) => self.write_select(current & !1 | target_bit),
            None => self.write_select(target_bit),
        }
    }
}
