//! NXP LPC11xx / LPC13xx flash programming through the on-chip IAP ROM.
//!
//! These parts carry no debugger-writable flash controller; instead the
//! boot ROM exposes In-Application-Programming routines at a fixed entry
//! point. The host calls them by staging a command table in RAM, pointing
//! the core's registers at it, and catching the return with a hardware
//! breakpoint.

use crate::error::{retry, Error, Result};
use crate::flash::FirmwareImage;
use crate::probe::swd::SwdDriver;
use crate::rptr::Rptr;
use crate::target::{CoreRegister, Target};
use crate::Word;

/// The IAP entry point. An actual code pointer, without the Thumb bit.
pub const IAP_ENTRY: Word = 0x1FFF_1FF0;

/// IAP command numbers.
pub const CMD_PREPARE_SECTORS: Word = 50;
pub const CMD_COPY_RAM_TO_FLASH: Word = 51;
pub const CMD_ERASE_SECTORS: Word = 52;
pub const CMD_BLANK_CHECK_SECTORS: Word = 53;
pub const CMD_READ_PART_ID: Word = 54;
pub const CMD_READ_BOOT_CODE_VERSION: Word = 55;
pub const CMD_COMPARE: Word = 56;
pub const CMD_REINVOKE_ISP: Word = 57;
pub const CMD_READ_UID: Word = 58;

/// `CMD_SUCCESS` in the IAP status word.
const STATUS_SUCCESS: Word = 0;

/// Flash geometry shared by the supported parts.
pub const SECTOR_BYTES: u32 = 4096;
/// The smallest RAM-to-flash copy the ROM accepts.
pub const COPY_CHUNK_BYTES: u32 = 256;

/// System memory remap register; writing [`MAP_USER_FLASH`] evicts the
/// boot ROM from the bottom of the address space.
const SYSMEMREMAP: Rptr<Word> = Rptr::new(0x4004_8000);
const MAP_USER_FLASH: Word = 2;

/// The CPU clock in kHz after reset (the 12 MHz internal RC oscillator),
/// which the flash-write routines need to know.
const CCLK_KHZ: Word = 12_000;

/// Scratch RAM layout used while the ROM routines run. All of this lies
/// in the 4 KiB of SRAM every supported part has at 0x1000_0000, above
/// the 32 bytes at the top that the IAP routines reserve for themselves.
mod ram {
    use super::{Rptr, Word};

    /// Command table: command word plus up to four parameters.
    pub const COMMAND_TABLE: Rptr<Word> = Rptr::new(0x1000_0000);
    /// Result table: status word plus up to four results.
    pub const RESULT_TABLE: Rptr<Word> = Rptr::new(0x1000_0020);
    /// Staging buffer for one flash copy chunk.
    pub const DATA_BUFFER: Rptr<Word> = Rptr::new(0x1000_0100);
    /// Initial stack pointer for the ROM call, below the reserved top.
    pub const STACK_TOP: Word = 0x1000_0FC0;
}

/// Makes user flash visible at address zero so what is read back is what
/// was programmed.
pub fn unmap_boot_rom<D: SwdDriver>(target: &mut Target<'_, D>) -> Result<()> {
    target.write_word(SYSMEMREMAP, MAP_USER_FLASH)
}

/// Calls one IAP routine on a halted core and returns its result table.
///
/// The calling convention: R0 points at the command table, R1 at the
/// result table, PC at the ROM entry, and LR back into RAM (with the
/// Thumb bit) where a hardware breakpoint catches the return.
pub fn invoke_iap<D: SwdDriver>(
    target: &mut Target<'_, D>,
    command: Word,
    params: &[Word],
) -> Result<[Word; 4]> {
    assert!(params.len() <= 4);

    let mut table = [0u32; 5];
    table[0] = command;
    table[1..=params.len()].copy_from_slice(params);
    target.write_words(&table, ram::COMMAND_TABLE)?;

    target.write_register(CoreRegister::R0, ram::COMMAND_TABLE.bits())?;
    target.write_register(CoreRegister::R1, ram::RESULT_TABLE.bits())?;
    target.write_register(CoreRegister::SP, ram::STACK_TOP)?;
    target.write_register(CoreRegister::PC, IAP_ENTRY)?;
    target.write_register(CoreRegister::LR, ram::COMMAND_TABLE.bits() | 1)?;

    target.enable_breakpoints()?;
    target.enable_breakpoint(0, ram::COMMAND_TABLE.cast().as_const())?;
    target.reset_halt_state()?;

    tracing::debug!("invoking IAP command {}", command);
    target.resume()?;

    wait_for_breakpoint(target)?;
    target.disable_breakpoint(0)?;

    let mut results = [0u32; 5];
    target.read_words(ram::RESULT_TABLE, &mut results)?;

    if results[0] != STATUS_SUCCESS {
        return Err(Error::Iap {
            command,
            status: results[0],
        });
    }

    Ok([results[1], results[2], results[3], results[4]])
}

fn wait_for_breakpoint<D: SwdDriver>(target: &mut Target<'_, D>) -> Result<()> {
    let budget = crate::RetryBudget::HALT;
    retry(budget, || {
        if target.is_halted()? {
            Ok(())
        } else {
            Err(Error::Wait)
        }
    })
    .map_err(|e| match e {
        Error::RetriesExhausted(_) => Error::HaltTimeout,
        other => other,
    })?;

    let reason = target.read_halt_state()?;
    if reason.bkpt() {
        Ok(())
    } else {
        Err(Error::UnexpectedHaltReason(reason.into()))
    }
}

/// Reads the part identification word.
pub fn read_part_id<D: SwdDriver>(target: &mut Target<'_, D>) -> Result<Word> {
    Ok(invoke_iap(target, CMD_READ_PART_ID, &[])?[0])
}

/// Programs an image into flash starting at sector zero.
///
/// Sectors touched by the image are prepared and erased, then the image
/// is streamed through RAM in [`COPY_CHUNK_BYTES`] pieces. A failed call
/// leaves flash in an undefined state; the IAP protocol has no undo.
pub fn program_flash<D: SwdDriver>(
    target: &mut Target<'_, D>,
    image: &FirmwareImage,
) -> Result<()> {
    if image.words().is_empty() {
        return Err(Error::Argument("refusing to flash an empty image"));
    }

    let last_sector = (image.len_bytes() as u32 - 1) / SECTOR_BYTES;

    tracing::info!(
        "erasing sectors 0..={} ({} bytes of image)",
        last_sector,
        image.len_bytes()
    );
    invoke_iap(target, CMD_PREPARE_SECTORS, &[0, last_sector])?;
    invoke_iap(target, CMD_ERASE_SECTORS, &[0, last_sector, CCLK_KHZ])?;

    let chunk_words = (COPY_CHUNK_BYTES / 4) as usize;
    for (index, chunk) in image.words().chunks(chunk_words).enumerate() {
        let flash_address = index as u32 * COPY_CHUNK_BYTES;

        // Short final chunks are padded; the ROM only copies whole
        // chunks.
        let mut staged = vec![0xFFFF_FFFF; chunk_words];
        staged[..chunk.len()].copy_from_slice(chunk);
        target.write_words(&staged, ram::DATA_BUFFER)?;

        let sector = flash_address / SECTOR_BYTES;
        invoke_iap(target, CMD_PREPARE_SECTORS, &[sector, sector])?;
        invoke_iap(
            target,
            CMD_COPY_RAM_TO_FLASH,
            &[
                flash_address,
                ram::DATA_BUFFER.bits(),
                COPY_CHUNK_BYTES,
                CCLK_KHZ,
            ],
        )?;

        tracing::debug!(
            "programmed {:#010x}..{:#010x}",
            flash_address,
            flash_address + COPY_CHUNK_BYTES
        );
    }

    Ok(())
}

/// Reads back the first words of flash and compares them with the image.
pub fn verify_flash<D: SwdDriver>(
    target: &mut Target<'_, D>,
    image: &FirmwareImage,
) -> Result<bool> {
    let mut read_back = vec![0u32; image.words().len()];
    target.read_words(Rptr::<Word>::new(0).as_const(), &mut read_back)?;
    Ok(read_back == image.words())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap::DebugAccessPort;
    use crate::testing::FakeCortex;

    /// A halted core whose "ROM" has already deposited a result table,
    /// and which lands straight back in a breakpoint halt on resume.
    fn primed_fake(status: Word, result0: Word) -> FakeCortex {
        let mut fake = FakeCortex::halted_with_reason(0);
        fake.halt_on_resume = Some(0x02); // DFSR.BKPT
        fake.set_mem(0x1000_0020, status);
        fake.set_mem(0x1000_0024, result0);
        fake
    }

    #[test]
    fn invoke_iap_stages_the_call_and_collects_results() {
        let fake = primed_fake(STATUS_SUCCESS, 0x2C40_102B);

        let mut dap = DebugAccessPort::new(fake);
        let mut target = Target::new(&mut dap, 0);
        let results = invoke_iap(&mut target, CMD_READ_PART_ID, &[]);

        let fake = dap.into_swd();
        assert_eq!(results.unwrap()[0], 0x2C40_102B);

        // Command table staged in RAM.
        assert_eq!(fake.mem(0x1000_0000), CMD_READ_PART_ID);
        // Calling convention in the register file.
        assert_eq!(fake.regs[0], 0x1000_0000);
        assert_eq!(fake.regs[1], 0x1000_0020);
        assert_eq!(fake.regs[13], 0x1000_0FC0);
        assert_eq!(fake.regs[15], IAP_ENTRY);
        assert_eq!(fake.regs[14], 0x1000_0001);
        // Return breakpoint on the command table's lower halfword,
        // cleared again after the call.
        assert_eq!(fake.mem(0xE000_2008), 0);
    }

    #[test]
    fn invoke_iap_passes_parameters() {
        let fake = primed_fake(STATUS_SUCCESS, 0);

        let mut dap = DebugAccessPort::new(fake);
        let mut target = Target::new(&mut dap, 0);
        invoke_iap(&mut target, CMD_PREPARE_SECTORS, &[3, 7]).unwrap();

        let fake = dap.into_swd();
        assert_eq!(fake.mem(0x1000_0000), CMD_PREPARE_SECTORS);
        assert_eq!(fake.mem(0x1000_0004), 3);
        assert_eq!(fake.mem(0x1000_0008), 7);
    }

    #[test]
    fn iap_failure_status_is_surfaced() {
        let fake = primed_fake(9, 0); // SECTOR_NOT_PREPARED

        let mut dap = DebugAccessPort::new(fake);
        let mut target = Target::new(&mut dap, 0);
        let result = invoke_iap(&mut target, CMD_ERASE_SECTORS, &[0, 0, CCLK_KHZ]);

        assert!(matches!(
            result,
            Err(Error::Iap {
                command: CMD_ERASE_SECTORS,
                status: 9
            })
        ));
    }

    #[test]
    fn program_flash_erases_then_streams_chunks() {
        let mut bytes = Vec::new();
        for word in 0..96u32 {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let image = FirmwareImage::from_bytes(&bytes).unwrap(); // 384 bytes

        let fake = primed_fake(STATUS_SUCCESS, 0);
        let mut dap = DebugAccessPort::new(fake);
        let mut target = Target::new(&mut dap, 0);
        program_flash(&mut target, &image).unwrap();

        let fake = dap.into_swd();
        // The last staged chunk: words 64..96 followed by erased-flash
        // padding.
        assert_eq!(fake.mem(0x1000_0100), 64);
        assert_eq!(fake.mem(0x1000_0100 + 4 * 31), 95);
        assert_eq!(fake.mem(0x1000_0100 + 4 * 32), 0xFFFF_FFFF);
        // The final copy command wrote the second chunk's address.
        assert_eq!(fake.mem(0x1000_0004), 256);
        assert_eq!(fake.mem(0x1000_0008), 0x1000_0100);
        assert_eq!(fake.mem(0x1000_000C), COPY_CHUNK_BYTES);
    }
}
