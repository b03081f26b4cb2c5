//! Error and retry plumbing shared by every layer of the stack.
//!
//! Four outcomes propagate through the crate: success, a retriable WAIT
//! from the target, an argument error (caller bug, never retried), and a
//! hard failure (FAULT, protocol violation, USB trouble). WAIT is the only
//! retriable variant; [`retry`] applies a bounded retry budget and converts
//! an exhausted budget into a hard failure.

use std::time::Duration;

/// Errors reported by the probe, transport, DAP and target layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A USB operation failed outright.
    #[error("USB transport error")]
    Usb(#[from] rusb::Error),

    /// An I/O error from the host side (files, terminal).
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The probe produced fewer bytes than the MPSSE response requires
    /// within the deadline.
    #[error("timed out waiting for {0} response bytes from the probe")]
    ReadTimeout(usize),

    /// A bulk write was cut short.
    #[error("short write to the probe: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// The MPSSE engine did not echo the bad-opcode probe.
    #[error("MPSSE synchronization failed (response {0:02x?})")]
    Desynchronized([u8; 2]),

    /// The target answered an SWD request with WAIT. Retriable.
    #[error("target replied WAIT")]
    Wait,

    /// The target answered an SWD request with FAULT; a sticky error flag
    /// is now set and must be cleared through ABORT.
    #[error("target replied FAULT")]
    Fault,

    /// The three ACK bits matched none of OK/WAIT/FAULT.
    #[error("unexpected SWD acknowledge {0:#05b}")]
    UnexpectedAck(u8),

    /// Read data failed its parity check.
    #[error("SWD read data failed parity check")]
    IncorrectParity,

    /// The caller violated a precondition. Never retried.
    #[error("{0}")]
    Argument(&'static str),

    /// A core register index outside the implemented set.
    #[error("core register index {0} is not implemented")]
    InvalidRegister(u16),

    /// A retriable operation stayed retriable for the whole budget.
    #[error("retry budget exhausted after {0} attempts")]
    RetriesExhausted(usize),

    /// The CPU did not reach the halted state within the retry budget.
    /// After this error the CPU state is unobservable; issue a fresh halt.
    #[error("core failed to halt within the retry budget")]
    HaltTimeout,

    /// The CPU halted for a reason the caller was not prepared to handle.
    #[error("core halted for unexpected reason (DFSR = {0:#010x})")]
    UnexpectedHaltReason(u32),

    /// A breakpoint fired on an instruction that is not a semihosting
    /// request.
    #[error("unexpected breakpoint {instruction:#06x} at {pc:#010x}")]
    UnexpectedBreakpoint { instruction: u16, pc: u32 },

    /// The target requested a semihosting operation this host does not
    /// implement.
    #[error("unsupported semihosting operation {0:#x}")]
    UnsupportedSemihosting(u32),

    /// An LPC IAP ROM call completed with a non-zero status.
    #[error("IAP command {command} failed with status {status}")]
    Iap { command: u32, status: u32 },

    /// A firmware image whose length is not a whole number of words.
    #[error("firmware image size {0} is not a multiple of 4 bytes")]
    ImageSize(usize),

    /// No adapter table entry with the requested name.
    #[error("unknown programmer {0:?}")]
    UnknownProgrammer(String),

    /// No USB device matched the adapter's VID/PID.
    #[error("no USB device found with VID:PID {vid:04x}:{pid:04x}")]
    ProbeNotFound { vid: u16, pid: u16 },
}

impl Error {
    /// Whether the immediate caller may usefully retry the operation.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Wait)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A bounded retry policy: at most `attempts` tries with `delay` between
/// retriable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub attempts: usize,
    pub delay: Duration,
}

impl RetryBudget {
    pub const fn new(attempts: usize, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Default budget for DAP register accesses.
    pub const DAP: Self = Self::new(100, Duration::from_millis(1));

    /// Default budget for halt polling and other CPU state changes.
    pub const HALT: Self = Self::new(1000, Duration::from_millis(1));
}

/// Runs `op` until it succeeds, fails hard, or stays retriable for the
/// whole budget. Exactly `budget.attempts` attempts are made against an
/// operation that never stops returning WAIT.
pub fn retry<T>(budget: RetryBudget, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    for attempt in 0..budget.attempts {
        match op() {
            Err(e) if e.is_retriable() => {
                tracing::trace!(
                    "retriable failure ({e}), attempt {}/{}",
                    attempt + 1,
                    budget.attempts
                );
                if attempt + 1 < budget.attempts && !budget.delay.is_zero() {
                    std::thread::sleep(budget.delay);
                }
            }
            other => return other,
        }
    }

    Err(Error::RetriesExhausted(budget.attempts))
}
