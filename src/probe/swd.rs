//! The SWD transport: ADIv5 request/acknowledge/data framing over MPSSE.
//!
//! Each transaction is an 8-bit request header, a bus turnaround, a 3-bit
//! acknowledge from the target, and (on OK) a 32-bit data phase with a
//! parity bit. SWDIO is bidirectional; the host releases it for the
//! acknowledge and for read data, and reclaims it afterwards, spending one
//! clock on every direction change.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::Word;

use super::mpsse::{CommandBuilder, MpssePipe};
use super::Programmer;

/// Which half of the ADIv5 register space a transaction addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    /// The Debug Port's own registers.
    Debug,
    /// The Access Port bank currently named by the DP `SELECT` register.
    Access,
}

const HEADER_START: u8 = 1 << 0;
const HEADER_AP: u8 = 1 << 1;
const HEADER_READ: u8 = 1 << 2;
const HEADER_PARITY: u8 = 1 << 5;
const HEADER_PARK: u8 = 1 << 7;

/// The three-bit target acknowledge, LSB-first on the wire.
pub const ACK_OK: u8 = 0b001;
pub const ACK_WAIT: u8 = 0b010;
pub const ACK_FAULT: u8 = 0b100;

/// Builds the 8-bit SWD request header for a register at word address
/// `address` (0..=3). Start and Park are always set; parity covers APnDP,
/// RnW and the two address bits.
pub fn swd_request(address: u8, port: Port, read: bool) -> u8 {
    let ap = port == Port::Access;
    let a2 = address & 1 != 0;
    let a3 = address & 2 != 0;

    let mut request = HEADER_START | HEADER_PARK | ((address & 0x3) << 3);
    if ap {
        request |= HEADER_AP;
    }
    if read {
        request |= HEADER_READ;
    }
    if ap ^ read ^ a2 ^ a3 {
        request |= HEADER_PARITY;
    }

    request
}

/// Even/odd parity over a data word, as SWD defines it: the parity bit
/// makes the total number of ones even.
pub fn swd_parity(data: Word) -> bool {
    data.count_ones() % 2 == 1
}

/// One SWD adapter backend.
///
/// The functions map directly onto SWD protocol concepts; clients should
/// normally drive a [`crate::dap::DebugAccessPort`] instead, which adds
/// register names, the `SELECT` cache and retry discipline on top.
pub trait SwdDriver {
    /// Performs the SWD connection sequence (line reset followed by an
    /// IDCODE read) and returns the Debug Port's IDCODE. After this call
    /// the DP's `SELECT` and `CTRL/STAT` contents are undefined.
    fn initialize(&mut self) -> Result<Word>;

    /// Asserts the target's reset line. System-level; debug state is lost
    /// and `initialize` must be called again after release.
    fn enter_reset(&mut self) -> Result<()>;

    /// Releases the target's reset line.
    fn leave_reset(&mut self) -> Result<()>;

    /// Reads a 32-bit register. Access Port reads are posted: each read
    /// returns the result of the *previous* AP read; drain the final value
    /// through the DP's `RDBUFF`.
    fn read(&mut self, port: Port, address: u8) -> Result<Word>;

    /// Writes a 32-bit register. Access Port writes may still be in flight
    /// when this returns; `CSW.TrInProg` reports completion for a MEM-AP.
    fn write(&mut self, port: Port, address: u8, data: Word) -> Result<()>;
}

/// Deadline for the MPSSE response to one SWD transaction.
const RESPONSE_DEADLINE: Duration = Duration::from_millis(1000);

/// [`SwdDriver`] over an FTDI MPSSE pipe.
pub struct MpsseSwdDriver<P> {
    pipe: P,
    programmer: Programmer,
}

impl<P: MpssePipe> MpsseSwdDriver<P> {
    /// Wraps an already-attached MPSSE pipe. The chip is expected to be in
    /// MPSSE mode with the bus parked in the programmer's `idle_write`
    /// state (see [`super::ftdi::FtdiDevice::attach`]).
    pub fn new(pipe: P, programmer: Programmer) -> Self {
        Self { pipe, programmer }
    }

    pub fn pipe_mut(&mut self) -> &mut P {
        &mut self.pipe
    }

    /// 50 clocks with SWDIO held high, then back to idle and one idle
    /// clock. Leaves the wire protocol in its reset state; the IDCODE read
    /// that completes the connection sequence is the caller's job.
    pub fn line_reset(&mut self) -> Result<()> {
        let mut commands = CommandBuilder::new();
        commands
            .set_pins(self.programmer.reset_swd)
            .clock_bytes(6)
            .clock_bits(2)
            .set_pins(self.programmer.idle_write)
            .clock_bits(1);

        commands.send(&mut self.pipe)
    }

    /// Sends a request header and reads back the acknowledge, leaving the
    /// bus released (read direction).
    fn request(&mut self, header: u8) -> Result<u8> {
        let mut commands = CommandBuilder::new();
        commands
            .write_bits(8, header)
            .set_pins(self.programmer.idle_read)
            .clock_bits(1)
            .read_bits(3);
        commands.send(&mut self.pipe)?;

        let mut response = [0u8; 1];
        self.pipe.read_exact(&mut response, RESPONSE_DEADLINE)?;

        // Three bits shifted in LSB-first settle in the top of the byte.
        Ok(response[0] >> 5)
    }

    /// Reclaims the bus: one turnaround clock in the write direction.
    fn reclaim_bus(&mut self) -> Result<()> {
        let mut commands = CommandBuilder::new();
        commands.set_pins(self.programmer.idle_write).clock_bits(1);
        commands.send(&mut self.pipe)
    }

    fn ack_to_error(ack: u8) -> Error {
        match ack {
            ACK_WAIT => Error::Wait,
            ACK_FAULT => Error::Fault,
            other => {
                tracing::warn!("received unexpected SWD acknowledge {:#05b}", other);
                Error::UnexpectedAck(other)
            }
        }
    }
}

impl<P: MpssePipe> SwdDriver for MpsseSwdDriver<P> {
    fn initialize(&mut self) -> Result<Word> {
        self.line_reset()?;

        let idcode = self.read(Port::Debug, 0)?;

        tracing::debug!("Debug Port IDCODE = {:08X}", idcode);
        tracing::debug!("  version:  {:X}", idcode >> 28);
        tracing::debug!("  part:     {:X}", (idcode >> 12) & 0xFFFF);
        tracing::debug!("  designer: {:X}", (idcode >> 1) & 0x7FF);

        Ok(idcode)
    }

    fn enter_reset(&mut self) -> Result<()> {
        let mut commands = CommandBuilder::new();
        commands.set_pins(self.programmer.reset_target);
        commands.send(&mut self.pipe)
    }

    fn leave_reset(&mut self) -> Result<()> {
        let mut commands = CommandBuilder::new();
        commands.set_pins(self.programmer.idle_write);
        commands.send(&mut self.pipe)
    }

    fn read(&mut self, port: Port, address: u8) -> Result<Word> {
        tracing::trace!("SWD read {:?} {}", port, address);

        let ack = self.request(swd_request(address, port, true))?;

        if ack != ACK_OK {
            // No data phase follows; just take the bus back.
            self.reclaim_bus()?;
            return Err(Self::ack_to_error(ack));
        }

        // Data phase: 32 data bits, then the parity bit and a turnaround
        // bit we ignore.
        let mut commands = CommandBuilder::new();
        commands.read_bytes(4).read_bits(2);
        commands.send(&mut self.pipe)?;

        let mut response = [0u8; 5];
        let data_result = self.pipe.read_exact(&mut response, RESPONSE_DEADLINE);

        // The bus goes back to idle_write whether or not the data arrived.
        self.reclaim_bus()?;
        data_result?;

        let data = Word::from_le_bytes([response[0], response[1], response[2], response[3]]);
        let parity = (response[4] >> 6) & 1 == 1;

        if parity != swd_parity(data) {
            return Err(Error::IncorrectParity);
        }

        tracing::trace!("SWD read {:?} {} = {:08X}", port, address, data);
        Ok(data)
    }

    fn write(&mut self, port: Port, address: u8, data: Word) -> Result<()> {
        tracing::trace!("SWD write {:?} {} = {:08X}", port, address, data);

        let ack = self.request(swd_request(address, port, false))?;

        // The acknowledge was read with the bus released; reclaim it
        // before either the data phase or the error return.
        self.reclaim_bus()?;

        if ack != ACK_OK {
            return Err(Self::ack_to_error(ack));
        }

        let mut commands = CommandBuilder::new();
        commands
            .write_bytes(&data.to_le_bytes())
            .write_bits(1, if swd_parity(data) { 0xFF } else { 0x00 });
        commands.send(&mut self.pipe)
    }
}
