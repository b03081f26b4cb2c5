//! The USB byte pipe into an FTDI chip's MPSSE engine.
//!
//! This is a deliberately small slice of the FTDI protocol: the vendor
//! control requests needed to reset the chip, pick a bit mode and tune the
//! latency timer, plus bulk reads and writes on the MPSSE endpoints. Every
//! bulk-in packet starts with two modem-status bytes that must be stripped
//! before the payload reaches the MPSSE layer.

use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};

use crate::error::{Error, Result};

use super::mpsse::{self, MpssePipe};
use super::Programmer;

const SIO_RESET_REQUEST: u8 = 0x00;
const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;
const SIO_SET_LATENCY_TIMER_REQUEST: u8 = 0x09;
const SIO_SET_BITMODE_REQUEST: u8 = 0x0B;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);
const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// FTDI bit modes; only the two we use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BitMode {
    Reset = 0x00,
    Mpsse = 0x02,
}

/// An open FTDI MPSSE channel.
///
/// Owns the USB handle; the interface is claimed on open and released on
/// drop, so two host processes cannot share one probe.
pub struct FtdiDevice {
    handle: DeviceHandle<Context>,
    /// FTDI channel index for control requests: interface A is 1.
    channel: u16,
    ep_in: u8,
    ep_out: u8,
    read_buffer: Vec<u8>,
}

impl std::fmt::Debug for FtdiDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtdiDevice")
            .field("channel", &self.channel)
            .field("ep_in", &self.ep_in)
            .field("ep_out", &self.ep_out)
            .finish()
    }
}

impl FtdiDevice {
    /// Opens the first USB device matching the programmer's VID/PID and
    /// claims its MPSSE interface. Fails fast if another process holds the
    /// interface.
    pub fn open(programmer: &Programmer) -> Result<Self> {
        let context = Context::new()?;

        let device = context
            .devices()?
            .iter()
            .find(|device| {
                device
                    .device_descriptor()
                    .map(|desc| {
                        desc.vendor_id() == programmer.vendor_id
                            && desc.product_id() == programmer.product_id
                    })
                    .unwrap_or(false)
            })
            .ok_or(Error::ProbeNotFound {
                vid: programmer.vendor_id,
                pid: programmer.product_id,
            })?;

        let mut handle = device.open()?;

        // A kernel serial driver usually has the chip; take it over.
        let _ = handle.set_auto_detach_kernel_driver(true);

        handle.claim_interface(programmer.interface)?;

        tracing::debug!(
            "opened {} ({:04x}:{:04x}) interface {}",
            programmer.name,
            programmer.vendor_id,
            programmer.product_id,
            programmer.interface
        );

        Ok(Self {
            handle,
            channel: programmer.interface as u16 + 1,
            ep_in: 0x81 + 2 * programmer.interface,
            ep_out: 0x02 + 2 * programmer.interface,
            read_buffer: vec![0; 512],
        })
    }

    fn sio_write(&mut self, request: u8, value: u16) -> Result<()> {
        let request_type = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );

        self.handle
            .write_control(request_type, request, value, self.channel, &[], CONTROL_TIMEOUT)?;

        Ok(())
    }

    pub fn usb_reset(&mut self) -> Result<()> {
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_SIO)
    }

    pub fn purge_buffers(&mut self) -> Result<()> {
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_TX)?;
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_RX)
    }

    /// Sets the latency timer, the interval after which the chip flushes a
    /// partially filled bulk-in packet back to the host.
    pub fn set_latency_timer(&mut self, milliseconds: u8) -> Result<()> {
        self.sio_write(SIO_SET_LATENCY_TIMER_REQUEST, milliseconds as u16)
    }

    pub fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<()> {
        self.sio_write(
            SIO_SET_BITMODE_REQUEST,
            u16::from_le_bytes([mask, mode as u8]),
        )
    }

    /// Brings the chip into a working MPSSE state for the given programmer:
    /// reset, purge, 1 ms latency, MPSSE bit mode, opcode synchronization,
    /// then clocking configured for `clock_hz` with the bus parked in
    /// `idle_write`.
    pub fn attach(&mut self, programmer: &Programmer, clock_hz: u32) -> Result<()> {
        self.usb_reset()?;
        self.purge_buffers()?;
        self.set_latency_timer(1)?;

        self.set_bitmode(0x00, BitMode::Reset)?;
        self.set_bitmode(0x00, BitMode::Mpsse)?;

        mpsse::synchronize(self)?;

        let divisor = mpsse::divisor_for_clock(clock_hz);
        tracing::debug!("SWD clock {} Hz, TCK divisor {}", clock_hz, divisor);

        mpsse::configure_clocking(self, programmer.idle_write, divisor)
    }
}

impl MpssePipe for FtdiDevice {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < bytes.len() {
            let n = self
                .handle
                .write_bulk(self.ep_out, &bytes[written..], WRITE_TIMEOUT)?;

            if n == 0 {
                return Err(Error::ShortWrite {
                    written,
                    expected: bytes.len(),
                });
            }
            written += n;
        }

        Ok(())
    }

    /// Collects exactly `out.len()` payload bytes. The chip returns data in
    /// its own time (latency timer, buffer pressure), so this polls in 1 ms
    /// ticks until the deadline elapses with nothing further received.
    fn read_exact(&mut self, out: &mut [u8], deadline: Duration) -> Result<()> {
        let mut received = 0;
        let attempts = deadline.as_millis().max(1) as usize;

        for attempt in 0..attempts {
            let n = match self.handle.read_bulk(
                self.ep_in,
                &mut self.read_buffer,
                Duration::from_millis(1),
            ) {
                Ok(n) => n,
                Err(rusb::Error::Timeout) => 0,
                Err(e) => return Err(e.into()),
            };

            // Every packet leads with two modem-status bytes.
            if n > 2 {
                let payload = &self.read_buffer[2..n];
                let take = payload.len().min(out.len() - received);
                out[received..received + take].copy_from_slice(&payload[..take]);
                received += take;

                if payload.len() > take {
                    tracing::warn!(
                        "discarding {} unexpected bytes from the probe",
                        payload.len() - take
                    );
                }
            }

            if received >= out.len() {
                tracing::trace!("response took {} poll(s)", attempt + 1);
                return Ok(());
            }

            std::thread::sleep(Duration::from_millis(1));
        }

        Err(Error::ReadTimeout(out.len()))
    }
}

impl Drop for FtdiDevice {
    fn drop(&mut self) {
        // Hand the pins back before the handle goes away.
        let _ = self.set_bitmode(0xFF, BitMode::Reset);
    }
}
