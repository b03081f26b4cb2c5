//! FTDI MPSSE command encoding.
//!
//! The MPSSE is a small command processor inside FT232H-class chips that
//! shifts serial data under host control. This module knows just enough of
//! its vocabulary to bit-bang SWD: GPIO writes, clock-only bursts, and
//! LSB-first data shifts in either direction. See FTDI application note
//! AN_108 for the full command set.
//!
//! Counts on the wire are encoded as `N - 1`: byte counts split across two
//! bytes, bit counts in one.

use std::time::Duration;

use crate::error::{Error, Result};

use super::PinState;

// Bit flags composed into shifting opcodes.
pub const MPSSE_WRITE_NEG: u8 = 0x01;
pub const MPSSE_BITMODE: u8 = 0x02;
pub const MPSSE_READ_NEG: u8 = 0x04;
pub const MPSSE_LSB: u8 = 0x08;
pub const MPSSE_DO_WRITE: u8 = 0x10;
pub const MPSSE_DO_READ: u8 = 0x20;

// Standalone commands.
pub const SET_BITS_LOW: u8 = 0x80;
pub const SET_BITS_HIGH: u8 = 0x82;
pub const LOOPBACK_DIS: u8 = 0x85;
pub const TCK_DIVISOR: u8 = 0x86;
pub const SEND_IMMEDIATE: u8 = 0x87;
pub const DIS_DIV_5: u8 = 0x8A;
pub const EN_3_PHASE: u8 = 0x8C;
pub const DIS_3_PHASE: u8 = 0x8D;
pub const CLK_BITS: u8 = 0x8E;
pub const CLK_BYTES: u8 = 0x8F;
pub const DIS_ADAPTIVE: u8 = 0x97;

/// First byte of the chip's response to an invalid opcode.
pub const BAD_COMMAND_ECHO: u8 = 0xFA;

/// Low byte of a count, encoded as `N - 1`.
pub const fn ftl(n: u16) -> u8 {
    ((n - 1) & 0xFF) as u8
}

/// High byte of a count, encoded as `N - 1`.
pub const fn fth(n: u16) -> u8 {
    (((n - 1) >> 8) & 0xFF) as u8
}

/// The byte conduit into the MPSSE engine.
///
/// Implemented by the USB FTDI device, and by scripted pipes in tests.
/// Reads have a deadline because the chip only returns data once its
/// latency timer fires or its buffer fills.
pub trait MpssePipe {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;
    fn read_exact(&mut self, out: &mut [u8], deadline: Duration) -> Result<()>;
}

/// Builds one MPSSE command stream. Stateless beyond the buffer; a builder
/// is meant to be filled, sent, and dropped.
///
/// All data shifts are LSB-first. Reads sample on the falling clock edge,
/// which is what SWD's timing requires of the host.
#[derive(Debug, Default)]
pub struct CommandBuilder {
    buffer: Vec<u8>,
}

impl CommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drives the low GPIO byte (levels and directions).
    pub fn set_low(&mut self, level: u8, direction: u8) -> &mut Self {
        self.buffer.extend_from_slice(&[SET_BITS_LOW, level, direction]);
        self
    }

    /// Drives the high GPIO byte.
    pub fn set_high(&mut self, level: u8, direction: u8) -> &mut Self {
        self.buffer.extend_from_slice(&[SET_BITS_HIGH, level, direction]);
        self
    }

    /// Drives both GPIO bytes from one [`PinState`].
    pub fn set_pins(&mut self, pins: PinState) -> &mut Self {
        self.set_low(pins.low_level, pins.low_direction)
            .set_high(pins.high_level, pins.high_direction)
    }

    /// Clocks `count` cycles (1..=8) with no data transfer.
    pub fn clock_bits(&mut self, count: u8) -> &mut Self {
        debug_assert!((1..=8).contains(&count));
        self.buffer.extend_from_slice(&[CLK_BITS, count - 1]);
        self
    }

    /// Clocks `count * 8` cycles with no data transfer.
    pub fn clock_bytes(&mut self, count: u16) -> &mut Self {
        self.buffer
            .extend_from_slice(&[CLK_BYTES, ftl(count), fth(count)]);
        self
    }

    /// Shifts out the low `count` bits (1..=8) of `byte`, LSB first.
    pub fn write_bits(&mut self, count: u8, byte: u8) -> &mut Self {
        debug_assert!((1..=8).contains(&count));
        self.buffer.extend_from_slice(&[
            MPSSE_DO_WRITE | MPSSE_LSB | MPSSE_BITMODE,
            count - 1,
            byte,
        ]);
        self
    }

    /// Shifts out whole bytes, LSB first.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        debug_assert!(!bytes.is_empty());
        let n = bytes.len() as u16;
        self.buffer
            .extend_from_slice(&[MPSSE_DO_WRITE | MPSSE_LSB, ftl(n), fth(n)]);
        self.buffer.extend_from_slice(bytes);
        self
    }

    /// Shifts in `count` bits (1..=8), sampling on the falling edge. The
    /// bits arrive LSB-first, so after the shift they occupy the *top*
    /// `count` bits of the response byte.
    pub fn read_bits(&mut self, count: u8) -> &mut Self {
        debug_assert!((1..=8).contains(&count));
        self.buffer.extend_from_slice(&[
            MPSSE_DO_READ | MPSSE_READ_NEG | MPSSE_LSB | MPSSE_BITMODE,
            count - 1,
        ]);
        self
    }

    /// Shifts in whole bytes, sampling on the falling edge.
    pub fn read_bytes(&mut self, count: u16) -> &mut Self {
        self.buffer.extend_from_slice(&[
            MPSSE_DO_READ | MPSSE_READ_NEG | MPSSE_LSB,
            ftl(count),
            fth(count),
        ]);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn send<P: MpssePipe>(&self, pipe: &mut P) -> Result<()> {
        pipe.write_all(&self.buffer)
    }
}

/// Probes the MPSSE engine with an invalid opcode and checks the echo.
/// Confirms command/response framing is aligned before real traffic.
pub fn synchronize<P: MpssePipe>(pipe: &mut P) -> Result<()> {
    pipe.write_all(&[0xAA])?;

    let mut response = [0u8; 2];
    pipe.read_exact(&mut response, Duration::from_millis(1000))?;

    if response != [BAD_COMMAND_ECHO, 0xAA] {
        return Err(Error::Desynchronized(response));
    }

    Ok(())
}

/// The TCK divisor for a requested SWD clock, derived from the 60 MHz core
/// clock: `TCK = 60 MHz / ((divisor + 1) * 2)`.
pub const fn divisor_for_clock(hz: u32) -> u16 {
    (30_000_000 / hz - 1) as u16
}

/// Configures the clocking machinery and parks the bus in `idle_write`:
/// divide-by-5 off, adaptive clocking off, 3-phase clocking toggled off
/// then back on, divisor set, GPIO driven.
pub fn configure_clocking<P: MpssePipe>(
    pipe: &mut P,
    idle_write: PinState,
    divisor: u16,
) -> Result<()> {
    let [low, high] = divisor.to_le_bytes();

    let mut commands = vec![
        DIS_DIV_5,
        DIS_ADAPTIVE,
        DIS_3_PHASE,
        EN_3_PHASE,
        TCK_DIVISOR,
        low,
        high,
    ];

    let mut pins = CommandBuilder::new();
    pins.set_pins(idle_write);
    commands.extend_from_slice(pins.as_bytes());

    pipe.write_all(&commands)
}
