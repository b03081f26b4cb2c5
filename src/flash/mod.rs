//! Firmware images and the LPC flash programming flow.

pub mod lpc;

use std::path::Path;

use crate::error::{Error, Result};
use crate::Word;

/// A raw little-endian ARM firmware image, held as words.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    words: Vec<Word>,
}

impl FirmwareImage {
    /// Parses a raw binary. The length must be a whole number of words.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(Error::ImageSize(bytes.len()));
        }

        let words = bytes
            .chunks_exact(4)
            .map(|chunk| Word::from_le_bytes(chunk.try_into().unwrap()))
            .collect();

        Ok(Self { words })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn words(&self) -> &[Word] {
        &self.words
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * 4
    }

    /// Recomputes the LPC vector-table checksum: the bootloader requires
    /// word 7 to be the two's complement of the sum of words 0..=6, and
    /// refuses to run the image otherwise.
    pub fn fix_lpc_checksum(&mut self) -> Result<()> {
        if self.words.len() < 8 {
            return Err(Error::Argument(
                "image too small to carry a vector checksum",
            ));
        }

        let sum = self.words[..7]
            .iter()
            .fold(0u32, |acc, &word| acc.wrapping_add(word));
        self.words[7] = sum.wrapping_neg();

        tracing::debug!("vector checksum = {:#010x}", self.words[7]);
        Ok(())
    }
}
