//! ARM semihosting, host side.
//!
//! A semihosting target executes `BKPT 0xAB` with an operation number in
//! R0 and a parameter in R1, and expects the debugger to perform the
//! operation, advance the PC past the breakpoint, and resume it. This
//! module recognizes the request, dispatches the small console subset
//! (`SYS_WRITEC`, `SYS_WRITE0`, `SYS_READC`), and provides the raw
//! terminal guard the `swdhost` tool wraps around its session.

use std::io::{self, Read, Write};

use crate::error::{Error, Result};
use crate::probe::swd::SwdDriver;
use crate::rptr::RptrConst;
use crate::target::{CoreRegister, Target};
use crate::{Halfword, Word};

/// Write one character from R1.
pub const SYS_WRITEC: Word = 0x03;
/// Write the zero-terminated string R1 points at.
pub const SYS_WRITE0: Word = 0x04;
/// Read one character into R0.
pub const SYS_READC: Word = 0x07;

/// The Thumb encoding of `BKPT 0xAB`.
pub const BKPT_SEMIHOSTING: Halfword = 0xBEAB;

/// The host side of the semihosted console.
///
/// Split out as a trait so the dispatch logic can be tested against an
/// in-memory console.
pub trait Console {
    fn put_byte(&mut self, byte: u8) -> io::Result<()>;
    fn get_byte(&mut self) -> io::Result<u8>;
}

/// A console over the process's stdin/stdout, for use inside a raw-mode
/// terminal session.
#[derive(Debug, Default)]
pub struct StdioConsole {
    /// Echo keystrokes back to the terminal; raw mode means nobody else
    /// will.
    pub local_echo: bool,
}

impl Console for StdioConsole {
    fn put_byte(&mut self, byte: u8) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        // Raw mode stops the line discipline from supplying the carriage
        // return.
        if byte == b'\n' {
            stdout.write_all(b"\r\n")?;
        } else {
            stdout.write_all(&[byte])?;
        }
        stdout.flush()
    }

    fn get_byte(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        io::stdin().lock().read_exact(&mut byte)?;

        if self.local_echo {
            self.put_byte(byte[0])?;
        }

        Ok(byte[0])
    }
}

/// Puts the controlling terminal into raw mode for the lifetime of the
/// guard. Dropping it restores the previous settings, whether the drop
/// comes from a normal return, a panic, or a SIGINT flag breaking the
/// host loop.
#[derive(Debug)]
pub struct RawTerminal(());

impl RawTerminal {
    pub fn enable() -> io::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self(()))
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// Inspects a halted CPU and services its semihosting request, resuming
/// the CPU afterwards.
///
/// Fails without resuming when the halt is not a recognizable semihosting
/// breakpoint, so the tool can report what actually happened.
pub fn service_halt<D: SwdDriver>(
    target: &mut Target<'_, D>,
    console: &mut dyn Console,
) -> Result<()> {
    let reason = target.read_halt_state()?;
    if !reason.bkpt() {
        return Err(Error::UnexpectedHaltReason(reason.into()));
    }

    let pc = target.read_register(CoreRegister::PC)?;

    // The PC is halfword-aligned but the bus is word-granular: load the
    // containing word and pick the right half.
    let instruction_word = target.read_word(RptrConst::<Word>::new(pc & !0x3))?;
    let instruction = if pc & 2 != 0 {
        (instruction_word >> 16) as Halfword
    } else {
        instruction_word as Halfword
    };

    if instruction != BKPT_SEMIHOSTING {
        return Err(Error::UnexpectedBreakpoint { instruction, pc });
    }

    let operation = target.read_register(CoreRegister::R0)?;
    let parameter = target.read_register(CoreRegister::R1)?;

    tracing::debug!("semihosting request {:#x}({:#010x})", operation, parameter);

    match operation {
        SYS_WRITEC => console.put_byte(parameter as u8)?,
        SYS_WRITE0 => write_string(target, console, parameter)?,
        SYS_READC => {
            let byte = console.get_byte()?;
            target.write_register(CoreRegister::R0, byte as Word)?;
        }
        other => return Err(Error::UnsupportedSemihosting(other)),
    }

    // Step past the breakpoint and let the target carry on.
    target.write_register(CoreRegister::PC, pc + 2)?;
    target.resume()
}

/// `SYS_WRITE0`: stream out a zero-terminated byte string, reading it one
/// word at a time since that is all the transport offers.
fn write_string<D: SwdDriver>(
    target: &mut Target<'_, D>,
    console: &mut dyn Console,
    parameter: Word,
) -> Result<()> {
    let mut address = RptrConst::<Word>::new(parameter & !0x3);
    let mut word = target.read_word(address)?;

    // A misaligned string starts partway into the first word.
    word >>= 8 * (parameter & 0x3);
    let mut bytes_left = 4 - (parameter & 0x3);

    loop {
        while bytes_left > 0 {
            let byte = (word & 0xFF) as u8;
            if byte == 0 {
                return Ok(());
            }
            console.put_byte(byte)?;
            word >>= 8;
            bytes_left -= 1;
        }

        address = address + 1;
        word = target.read_word(address)?;
        bytes_left = 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap::DebugAccessPort;
    use crate::testing::FakeCortex;

    /// A console writing into a buffer and reading from a script.
    #[derive(Default)]
    struct BufferConsole {
        output: Vec<u8>,
        input: Vec<u8>,
    }

    impl Console for BufferConsole {
        fn put_byte(&mut self, byte: u8) -> io::Result<()> {
            self.output.push(byte);
            Ok(())
        }

        fn get_byte(&mut self) -> io::Result<u8> {
            if self.input.is_empty() {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            Ok(self.input.remove(0))
        }
    }

    /// A core halted on `BKPT 0xAB` at `pc`, with the given R0/R1.
    fn semihosting_fake(pc: Word, operation: Word, parameter: Word) -> FakeCortex {
        let mut fake = FakeCortex::halted_with_reason(0x02); // DFSR.BKPT
        let aligned = pc & !0x3;
        let instruction = if pc & 2 != 0 {
            (BKPT_SEMIHOSTING as Word) << 16
        } else {
            BKPT_SEMIHOSTING as Word
        };
        fake.set_mem(aligned, instruction);
        fake.regs[15] = pc;
        fake.regs[0] = operation;
        fake.regs[1] = parameter;
        fake
    }

    fn service(fake: FakeCortex, console: &mut BufferConsole) -> (FakeCortex, crate::Result<()>) {
        let mut dap = DebugAccessPort::new(fake);
        let mut target = Target::new(&mut dap, 0);
        let result = service_halt(&mut target, console);
        (dap.into_swd(), result)
    }

    #[test]
    fn writec_emits_the_character_and_resumes() {
        let fake = semihosting_fake(0x0000_0100, SYS_WRITEC, b'x' as Word);
        let mut console = BufferConsole::default();

        let (fake, result) = service(fake, &mut console);

        result.unwrap();
        assert_eq!(console.output, b"x");
        assert_eq!(fake.regs[15], 0x0000_0102); // PC advanced past BKPT
        assert!(!fake.halted);
    }

    #[test]
    fn write0_walks_the_string_a_word_at_a_time() {
        let mut fake = semihosting_fake(0x0000_0100, SYS_WRITE0, 0x2000_0000);
        fake.set_mem(0x2000_0000, u32::from_le_bytes(*b"hell"));
        fake.set_mem(0x2000_0004, u32::from_le_bytes(*b"o!\0\0"));
        let mut console = BufferConsole::default();

        let (_, result) = service(fake, &mut console);

        result.unwrap();
        assert_eq!(console.output, b"hello!");
    }

    #[test]
    fn write0_handles_unaligned_strings() {
        let mut fake = semihosting_fake(0x0000_0100, SYS_WRITE0, 0x2000_0002);
        fake.set_mem(0x2000_0000, u32::from_le_bytes([0, 0, b'h', b'i']));
        fake.set_mem(0x2000_0004, 0);
        let mut console = BufferConsole::default();

        let (_, result) = service(fake, &mut console);

        result.unwrap();
        assert_eq!(console.output, b"hi");
    }

    #[test]
    fn readc_returns_the_byte_in_r0() {
        let fake = semihosting_fake(0x0000_0200, SYS_READC, 0);
        let mut console = BufferConsole {
            input: b"q".to_vec(),
            ..Default::default()
        };

        let (fake, result) = service(fake, &mut console);

        result.unwrap();
        assert_eq!(fake.regs[0], b'q' as Word);
        assert!(!fake.halted);
    }

    #[test]
    fn upper_halfword_breakpoints_are_recognized() {
        let fake = semihosting_fake(0x0000_0102, SYS_WRITEC, b'y' as Word);
        let mut console = BufferConsole::default();

        let (fake, result) = service(fake, &mut console);

        result.unwrap();
        assert_eq!(console.output, b"y");
        assert_eq!(fake.regs[15], 0x0000_0104);
    }

    #[test]
    fn non_semihosting_breakpoints_are_reported() {
        let mut fake = FakeCortex::halted_with_reason(0x02);
        fake.set_mem(0x0000_0100, 0x0000_BE00); // BKPT 0, not semihosting
        fake.regs[15] = 0x0000_0100;
        let mut console = BufferConsole::default();

        let (fake, result) = service(fake, &mut console);

        assert!(matches!(
            result,
            Err(Error::UnexpectedBreakpoint {
                instruction: 0xBE00,
                pc: 0x0000_0100
            })
        ));
        assert!(fake.halted); // not resumed
    }

    #[test]
    fn non_breakpoint_halts_are_reported() {
        let fake = FakeCortex::halted_with_reason(0x01); // DFSR.HALTED
        let mut console = BufferConsole::default();

        let (_, result) = service(fake, &mut console);
        assert!(matches!(result, Err(Error::UnexpectedHaltReason(0x01))));
    }

    #[test]
    fn unsupported_operations_are_reported() {
        let fake = semihosting_fake(0x0000_0100, 0x18, 0x20026); // SYS_EXIT
        let mut console = BufferConsole::default();

        let (_, result) = service(fake, &mut console);
        assert!(matches!(result, Err(Error::UnsupportedSemihosting(0x18))));
    }
}
