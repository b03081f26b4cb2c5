//! Scripted stand-ins for the probe hardware, shared by the unit tests.
//!
//! Three fidelity levels match the three layers under test:
//!
//! - [`MockPipe`] scripts raw MPSSE byte traffic for the SWD transport
//!   tests;
//! - [`ScriptedSwd`] scripts individual SWD transactions for the DAP
//!   tests;
//! - [`FakeCortex`] behaves like a small Cortex-M behind a MEM-AP
//!   (posted reads, TAR auto-increment, the debug control registers) for
//!   the Target, semihosting and flashing tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::probe::mpsse::MpssePipe;
use crate::probe::swd::{Port, SwdDriver};
use crate::Word;

/// An [`MpssePipe`] that asserts each write against a script and feeds
/// back canned responses.
#[derive(Debug, Default)]
pub(crate) struct MockPipe {
    expected_writes: VecDeque<Vec<u8>>,
    responses: VecDeque<Vec<u8>>,
}

impl MockPipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_write(&mut self, bytes: &[u8]) {
        self.expected_writes.push_back(bytes.to_vec());
    }

    pub fn push_response(&mut self, bytes: &[u8]) {
        self.responses.push_back(bytes.to_vec());
    }

    pub fn assert_done(&self) {
        assert!(
            self.expected_writes.is_empty(),
            "expected {} more write(s)",
            self.expected_writes.len()
        );
        assert!(
            self.responses.is_empty(),
            "{} response(s) never consumed",
            self.responses.len()
        );
    }
}

impl MpssePipe for MockPipe {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let expected = self
            .expected_writes
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected write: {bytes:02x?}"));
        assert_eq!(bytes, &expected[..], "command stream mismatch");
        Ok(())
    }

    fn read_exact(&mut self, out: &mut [u8], _deadline: Duration) -> Result<()> {
        let response = self
            .responses
            .pop_front()
            .ok_or(Error::ReadTimeout(out.len()))?;
        assert_eq!(out.len(), response.len(), "response length mismatch");
        out.copy_from_slice(&response);
        Ok(())
    }
}

/// One expected SWD transaction and its scripted outcome.
#[derive(Debug, Clone)]
pub(crate) struct SwdOp {
    port: Port,
    address: u8,
    write: bool,
    /// For writes: the exact data expected, if any.
    data: Option<Word>,
    /// Ok(value) for reads, Ok(anything) for writes, or the scripted
    /// failure.
    outcome: std::result::Result<Word, AckFailure>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum AckFailure {
    Wait,
    Fault,
}

impl SwdOp {
    pub fn read(port: Port, address: u8, value: Word) -> Self {
        Self {
            port,
            address,
            write: false,
            data: None,
            outcome: Ok(value),
        }
    }

    pub fn read_wait(port: Port, address: u8) -> Self {
        Self {
            outcome: Err(AckFailure::Wait),
            ..Self::read(port, address, 0)
        }
    }

    pub fn write(port: Port, address: u8, data: Word) -> Self {
        Self {
            port,
            address,
            write: true,
            data: Some(data),
            outcome: Ok(0),
        }
    }

    /// A write that succeeds without checking the data word.
    pub fn write_ok(port: Port, address: u8) -> Self {
        Self {
            data: None,
            ..Self::write(port, address, 0)
        }
    }

    #[allow(dead_code)]
    pub fn write_wait(port: Port, address: u8) -> Self {
        Self {
            data: None,
            outcome: Err(AckFailure::Wait),
            ..Self::write(port, address, 0)
        }
    }

    pub fn write_fault(port: Port, address: u8) -> Self {
        Self {
            data: None,
            outcome: Err(AckFailure::Fault),
            ..Self::write(port, address, 0)
        }
    }
}

/// An [`SwdDriver`] that checks every transaction against a script.
#[derive(Debug, Default)]
pub(crate) struct ScriptedSwd {
    script: VecDeque<SwdOp>,
}

impl ScriptedSwd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(&mut self, op: SwdOp) {
        self.script.push_back(op);
    }

    pub fn assert_done(&self) {
        assert!(
            self.script.is_empty(),
            "expected {} more SWD transaction(s): {:?}",
            self.script.len(),
            self.script
        );
    }

    fn next(&mut self, port: Port, address: u8, write: bool) -> SwdOp {
        let op = self.script.pop_front().unwrap_or_else(|| {
            panic!(
                "unexpected SWD {} {:?} {}",
                if write { "write" } else { "read" },
                port,
                address
            )
        });
        assert_eq!(
            (op.port, op.address, op.write),
            (port, address, write),
            "SWD transaction out of order"
        );
        op
    }
}

impl SwdDriver for ScriptedSwd {
    fn initialize(&mut self) -> Result<Word> {
        self.read(Port::Debug, 0)
    }

    fn enter_reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn leave_reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, port: Port, address: u8) -> Result<Word> {
        let op = self.next(port, address, false);
        match op.outcome {
            Ok(value) => Ok(value),
            Err(AckFailure::Wait) => Err(Error::Wait),
            Err(AckFailure::Fault) => Err(Error::Fault),
        }
    }

    fn write(&mut self, port: Port, address: u8, data: Word) -> Result<()> {
        let op = self.next(port, address, true);
        if let Some(expected) = op.data {
            assert_eq!(
                data, expected,
                "SWD write data mismatch at {port:?} {address}"
            );
        }
        match op.outcome {
            Ok(_) => Ok(()),
            Err(AckFailure::Wait) => Err(Error::Wait),
            Err(AckFailure::Fault) => Err(Error::Fault),
        }
    }
}

// MEM-AP register byte addresses.
const AP_CSW: u8 = 0x00;
const AP_TAR: u8 = 0x04;
const AP_DRW: u8 = 0x0C;
const AP_BASE: u8 = 0xF8;
const AP_IDR: u8 = 0xFC;

// Memory-mapped debug registers the fake models specially.
const DHCSR: u32 = 0xE000_EDF0;
const DCRSR: u32 = 0xE000_EDF4;
const DCRDR: u32 = 0xE000_EDF8;
const DEMCR: u32 = 0xE000_EDFC;
const AIRCR: u32 = 0xE000_ED0C;
const DFSR: u32 = 0xE000_ED30;

const DFSR_VCATCH: u32 = 1 << 3;

/// A scriptable SWD responder that models just enough of a Cortex-M0
/// behind a single MEM-AP: the `SELECT`/`RDBUFF` plumbing, posted AP
/// reads, TAR auto-increment, word memory, the core register file, and the
/// halt/reset behavior of DHCSR/DFSR/AIRCR.
pub(crate) struct FakeCortex {
    pub idcode: Word,
    select: Word,
    posted: Word,
    csw: Word,
    tar: Word,
    pub memory: HashMap<u32, Word>,
    pub regs: [Word; 21],
    dcrdr: Word,

    pub halted: bool,
    debug_enabled: bool,
    dfsr: Word,
    /// DHCSR polls remaining before a requested reset halts the core.
    reset_countdown: Option<usize>,
    /// How many DHCSR polls a reset takes to reach the vector catch.
    pub halt_delay: usize,

    /// Failures injected ahead of the next AP transactions.
    pub pending_waits: usize,

    /// Every value written to AIRCR, for asserting reset requests.
    pub aircr_writes: Vec<Word>,

    /// When set, a resume immediately halts again with these DFSR bits,
    /// as if the target ran straight into a breakpoint.
    pub halt_on_resume: Option<Word>,

    // Counters for asserting traffic shapes.
    pub select_writes: usize,
    pub tar_writes: usize,
    pub drw_reads: usize,
    pub drw_writes: usize,
}

impl FakeCortex {
    pub fn new() -> Self {
        Self {
            idcode: 0x0BB1_1477,
            select: 0,
            posted: 0,
            csw: 0,
            tar: 0,
            memory: HashMap::new(),
            regs: [0; 21],
            dcrdr: 0,
            halted: false,
            debug_enabled: false,
            dfsr: 0,
            reset_countdown: None,
            halt_delay: 0,
            pending_waits: 0,
            aircr_writes: Vec::new(),
            halt_on_resume: None,
            select_writes: 0,
            tar_writes: 0,
            drw_reads: 0,
            drw_writes: 0,
        }
    }

    pub fn halted_with_reason(dfsr: Word) -> Self {
        Self {
            halted: true,
            debug_enabled: true,
            dfsr,
            ..Self::new()
        }
    }

    pub fn csw(&self) -> Word {
        self.csw
    }

    pub fn mem(&self, address: u32) -> Word {
        self.memory.get(&address).copied().unwrap_or(0)
    }

    pub fn set_mem(&mut self, address: u32, value: Word) {
        self.memory.insert(address, value);
    }

    fn mem_read(&mut self, address: u32) -> Word {
        match address {
            DHCSR => {
                if let Some(polls) = self.reset_countdown {
                    if polls == 0 {
                        self.reset_countdown = None;
                        self.halted = true;
                        if self.mem(DEMCR) & 1 != 0 {
                            self.dfsr |= DFSR_VCATCH;
                        }
                    } else {
                        self.reset_countdown = Some(polls - 1);
                    }
                }

                let mut value = 1 << 16; // S_REGRDY
                if self.halted {
                    value |= 1 << 17;
                }
                if self.debug_enabled {
                    value |= 1;
                }
                value
            }
            DFSR => self.dfsr,
            DCRDR => self.dcrdr,
            other => self.mem(other),
        }
    }

    fn mem_write(&mut self, address: u32, value: Word) {
        match address {
            DHCSR => {
                if value >> 16 != 0xA05F {
                    return; // wrong key: write ignored
                }
                self.debug_enabled = value & 1 != 0;
                if self.debug_enabled {
                    self.halted = value & (1 << 1) != 0;

                    if !self.halted {
                        if let Some(reason) = self.halt_on_resume {
                            self.halted = true;
                            self.dfsr |= reason;
                        }
                    }
                }
            }
            DCRSR => {
                let index = (value & 0x1F) as usize;
                if index < self.regs.len() {
                    if value & (1 << 16) != 0 {
                        self.regs[index] = self.dcrdr;
                    } else {
                        self.dcrdr = self.regs[index];
                    }
                }
            }
            DCRDR => self.dcrdr = value,
            DFSR => self.dfsr &= !value, // write one to clear
            AIRCR => {
                self.aircr_writes.push(value);
                if value >> 16 == 0x05FA && value & (1 << 2) != 0 {
                    self.halted = false;
                    self.reset_countdown = Some(self.halt_delay);
                }
            }
            other => {
                self.memory.insert(other, value);
            }
        }
    }

    fn ap_byte_address(&self, word_address: u8) -> u8 {
        (self.select & 0xF0) as u8 | (word_address << 2)
    }

    fn take_wait(&mut self) -> Result<()> {
        if self.pending_waits > 0 {
            self.pending_waits -= 1;
            return Err(Error::Wait);
        }
        Ok(())
    }

    fn autoincrement(&mut self) {
        if (self.csw >> 4) & 0x3 == 1 {
            self.tar = self.tar.wrapping_add(4);
        }
    }
}

impl SwdDriver for FakeCortex {
    fn initialize(&mut self) -> Result<Word> {
        Ok(self.idcode)
    }

    fn enter_reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn leave_reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, port: Port, address: u8) -> Result<Word> {
        match port {
            Port::Debug => match address {
                0 => Ok(self.idcode),
                1 => Ok(0xF000_0000), // power-up acks
                3 => Ok(self.posted),
                _ => Ok(0),
            },
            Port::Access => {
                self.take_wait()?;

                let fresh = if self.select >> 24 != 0 {
                    0 // only AP 0 exists
                } else {
                    match self.ap_byte_address(address) {
                        AP_CSW => self.csw,
                        AP_TAR => self.tar,
                        AP_DRW => {
                            self.drw_reads += 1;
                            let value = self.mem_read(self.tar);
                            self.autoincrement();
                            value
                        }
                        AP_BASE => 0xE00F_F003,
                        AP_IDR => 0x0477_0011,
                        _ => 0,
                    }
                };

                Ok(std::mem::replace(&mut self.posted, fresh))
            }
        }
    }

    fn write(&mut self, port: Port, address: u8, data: Word) -> Result<()> {
        match port {
            Port::Debug => {
                match address {
                    0 => {} // ABORT: sticky flags not modeled
                    2 => {
                        self.select = data;
                        self.select_writes += 1;
                    }
                    _ => {}
                }
                Ok(())
            }
            Port::Access => {
                self.take_wait()?;

                if self.select >> 24 != 0 {
                    return Ok(());
                }

                match self.ap_byte_address(address) {
                    AP_CSW => self.csw = data,
                    AP_TAR => {
                        self.tar = data;
                        self.tar_writes += 1;
                    }
                    AP_DRW => {
                        self.drw_writes += 1;
                        self.mem_write(self.tar, data);
                        self.autoincrement();
                    }
                    _ => {}
                }

                Ok(())
            }
        }
    }
}
