//! Host-side tools for driving ARM Cortex-M targets over Serial Wire Debug
//! (SWD), using FTDI MPSSE adapters as the physical probe.
//!
//! The crate is layered the way the wire protocol is layered:
//!
//! - [`probe::mpsse`] encodes FTDI MPSSE command streams;
//! - [`probe::ftdi`] moves those streams over USB bulk endpoints;
//! - [`probe::swd`] frames ADIv5 SWD transactions on top of the MPSSE
//!   vocabulary;
//! - [`dap`] implements the ADIv5 Debug Port register model, including the
//!   `SELECT` cache and posted Access Port reads;
//! - [`target`] provides the memory / core-register / halt / breakpoint
//!   facade that the command line tools are written against.
//!
//! The `swddude`, `swdprobe`, `swddump` and `swdhost` binaries are thin
//! front-ends over this library.

pub mod cli;
pub mod dap;
pub mod error;
pub mod flash;
pub mod probe;
pub mod rptr;
pub mod semihosting;
pub mod target;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result, RetryBudget};
pub use rptr::{Rptr, RptrConst};

/// The natural transfer unit of the SWD layer: an unsigned 32-bit
/// little-endian word. Everything narrower is emulated above the core.
pub type Word = u32;

/// A 16-bit quantity, used for Thumb instructions and code addresses.
pub type Halfword = u16;
