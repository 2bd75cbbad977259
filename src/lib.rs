//! AVR In-System Programmer.
//!
//! Drives the serial (SPI) programming interface of AVR microcontrollers to
//! read signatures, erase, program and verify flash from Intel HEX images and
//! read / write fuses. Based on the "Serial Programming" chapter of the AVR
//! datasheets.

use core::fmt::Debug;
use std::io::BufRead;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

use thiserror::Error;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod chip;
pub mod hex;
pub mod protocol;
mod session;

pub use chip::{Chip, FuseSet, Fuses, CHIPS};
pub use hex::{HexError, HexReader};
pub use session::Session;

use crate::protocol::{control, frame, opcodes, Fuse, ERASED};

/// SPI bus capability required by the programmer.
///
/// `transfer` must perform a full-duplex exchange in place.
pub trait IspTransport: Transfer<u8> {
    /// Configure the bus clock rate
    fn set_clock(&mut self, hz: u32) -> Result<(), Self::Error>;

    /// Attempt to take exclusive ownership of the bus
    fn try_lock(&mut self) -> nb::Result<(), Self::Error>;

    /// Release ownership of the bus
    fn unlock(&mut self) -> Result<(), Self::Error>;
}

#[derive(Debug, Error)]
pub enum Error<SpiError: Debug, PinError: Debug> {
    #[error("transport error: {0:?}")]
    Transport(SpiError),

    #[error("reset pin error: {0:?}")]
    Pin(PinError),

    /// Target did not echo the command, it is out of sync or not responding
    #[error("no echo from target (sent {command:02x?}, received {reply:02x?})")]
    Protocol { command: [u8; 4], reply: [u8; 4] },

    /// Page write echoed a different address
    #[error("page commit echoed address 0x{found:04x}, expected 0x{expected:04x}")]
    Commit { expected: u16, found: u16 },

    /// Target stayed busy for longer than the configured poll limit
    #[error("target still busy after {polls} status polls")]
    Timeout { polls: u32 },

    #[error("invalid hex image: {0}")]
    Format(#[from] HexError),

    #[error("signature mismatch (expected {expected:02x?}, found {found:02x?})")]
    SignatureMismatch { expected: [u8; 3], found: [u8; 3] },

    #[error("invalid chip descriptor: {0}")]
    InvalidChip(&'static str),
}

/// Error type for a programmer using transport `T` and reset pin `R`
pub type ProgrammerError<T, R> = Error<<T as Transfer<u8>>::Error, <R as OutputPin>::Error>;

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// SPI clock for signature, fuse and erase operations
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100000"))]
    pub slow_clock_hz: u32,

    /// SPI clock for flash programming, unless the chip specifies one
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000000"))]
    pub fast_clock_hz: u32,

    /// Status polls before giving up on a busy target (0 waits forever)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10000"))]
    pub busy_poll_limit: u32,

    /// Delay between status polls
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub poll_delay_us: u32,

    /// Accept extended address records in hex images
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub extended_records: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            slow_clock_hz: protocol::SLOW_CLOCK_HZ,
            fast_clock_hz: protocol::FAST_CLOCK_HZ,
            busy_poll_limit: 10_000,
            poll_delay_us: 10,
            extended_records: false,
        }
    }
}

/// Outcome for each flash page visited while programming or verifying
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum PageStatus {
    /// No image data for this page
    Skipped,
    /// Page written without read-back
    Written,
    /// Page contents match the image
    Verified,
}

pub struct Programmer<T, R, D> {
    options: Options,
    transport: T,
    reset: R,
    delay: D,
}

impl<T, R, D> Programmer<T, R, D>
where
    T: IspTransport,
    R: OutputPin,
    D: DelayUs<u32>,
    T::Error: Debug,
    R::Error: Debug,
{
    /// Create a new programmer instance, the reset line is released (high)
    pub fn new(
        transport: T,
        mut reset: R,
        delay: D,
        options: Options,
    ) -> Result<Self, ProgrammerError<T, R>> {
        reset.set_high().map_err(Error::Pin)?;
        Ok(Self {
            options,
            transport,
            reset,
            delay,
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn reset_pin(&self) -> &R {
        &self.reset
    }

    /// Destroy the programmer, returning the underlying peripherals
    pub fn free(self) -> (T, R, D) {
        (self.transport, self.reset, self.delay)
    }

    /// Enter programming mode at the given clock rate.
    ///
    /// The session holds the bus and keeps the target in reset until it is
    /// ended or dropped.
    pub fn begin(&mut self, clock_hz: u32) -> Result<Session<'_, T, R, D>, ProgrammerError<T, R>> {
        Session::begin(self, clock_hz)
    }

    fn with_session<V, F>(&mut self, clock_hz: u32, f: F) -> Result<V, ProgrammerError<T, R>>
    where
        F: FnOnce(&mut Session<'_, T, R, D>) -> Result<V, ProgrammerError<T, R>>,
    {
        let mut session = self.begin(clock_hz)?;
        let v = f(&mut session)?;
        session.end()?;
        Ok(v)
    }

    /// Read the three signature bytes
    pub fn read_signature(&mut self) -> Result<[u8; 3], ProgrammerError<T, R>> {
        let sig = self.with_session(self.options.slow_clock_hz, |s| s.read_signature())?;
        debug!("Found signature: {:02x?}", sig);
        Ok(sig)
    }

    /// Check the connected target responds with the signature of `chip`
    pub fn verify_sig(&mut self, chip: &Chip) -> Result<bool, ProgrammerError<T, R>> {
        let sig = self.read_signature()?;
        if sig != chip.signature {
            warn!(
                "Signature {:02x?} does not match {} ({:02x?})",
                sig, chip.name, chip.signature
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Erase flash (and clear lock bits)
    pub fn erase_chip(&mut self) -> Result<(), ProgrammerError<T, R>> {
        debug!("Erasing chip");
        self.with_session(self.options.slow_clock_hz, |s| {
            s.transact(frame(opcodes::CONTROL, control::CHIP_ERASE as u32, 0, 0))?;
            s.busy_wait()
        })
    }

    /// Read all fuses, each masked with the implemented bits for `chip`
    pub fn read_fuses(&mut self, chip: &Chip) -> Result<Fuses, ProgrammerError<T, R>> {
        let fuses = self.with_session(self.options.slow_clock_hz, |s| {
            let mut fuses = Fuses::default();
            for &fuse in Fuse::ALL.iter() {
                let v = s.transact(fuse.read_frame())?[2];
                fuses.set(fuse, v & chip.fuse_mask.get(fuse));
            }
            Ok(fuses)
        })?;
        debug!("Read fuses: {:02x?}", fuses);
        Ok(fuses)
    }

    /// Write the fuses present in `fuses`, absent fuses are left unchanged
    pub fn write_fuses(&mut self, chip: &Chip, fuses: FuseSet) -> Result<(), ProgrammerError<T, R>> {
        const ORDER: [Fuse; 4] = [Fuse::Lock, Fuse::Low, Fuse::High, Fuse::Extended];

        self.with_session(self.options.slow_clock_hz, |s| {
            for &fuse in ORDER.iter() {
                if let Some(v) = fuses.get(fuse) {
                    debug!("Writing {} {:?} fuse: 0x{:02x}", chip.name, fuse, v);
                    s.transact(fuse.write_frame(v))?;
                    s.busy_wait()?;
                }
            }
            Ok(())
        })
    }

    /// Compare the fuses present in `expected` against the target.
    ///
    /// Only bits implemented by `chip` are compared.
    pub fn verify_fuses(
        &mut self,
        chip: &Chip,
        expected: FuseSet,
    ) -> Result<bool, ProgrammerError<T, R>> {
        let actual = self.read_fuses(chip)?;

        for &fuse in Fuse::ALL.iter() {
            if let Some(v) = expected.get(fuse) {
                let v = v & chip.fuse_mask.get(fuse);
                if v != actual.get(fuse) {
                    warn!(
                        "{:?} fuse mismatch: expected 0x{:02x}, found 0x{:02x}",
                        fuse,
                        v,
                        actual.get(fuse)
                    );
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    /// Erase the target and program it from an Intel HEX image, returns
    /// `false` if a written page fails verification
    pub fn program_file<B: BufRead>(
        &mut self,
        chip: &Chip,
        image: B,
        verify: bool,
    ) -> Result<bool, ProgrammerError<T, R>> {
        self.program_file_with(chip, image, verify, |_, _| ())
    }

    /// As [`Programmer::program_file`], reporting the status of each page
    pub fn program_file_with<B, F>(
        &mut self,
        chip: &Chip,
        image: B,
        verify: bool,
        mut progress: F,
    ) -> Result<bool, ProgrammerError<T, R>>
    where
        B: BufRead,
        F: FnMut(u32, PageStatus),
    {
        chip.validate().map_err(Error::InvalidChip)?;
        self.check_signature(chip)?;
        self.erase_chip()?;

        let mut hex = HexReader::new(image).extended_records(self.options.extended_records);
        let clock = chip.clock_hz.unwrap_or(self.options.fast_clock_hz);

        self.with_session(clock, |s| {
            for page_addr in (0..chip.flash_size).step_by(chip.page_size as usize) {
                let mut page = vec![ERASED; chip.page_size as usize];
                hex.fill_page(page_addr, &mut page)?;

                // Erased pages are already blank
                if page.iter().all(|b| *b == ERASED) {
                    trace!("Skipping blank page 0x{:05x}", page_addr);
                    progress(page_addr, PageStatus::Skipped);
                    continue;
                }

                debug!("Programming page 0x{:05x}", page_addr);
                s.flash_page(&page, page_addr)?;

                if !verify {
                    progress(page_addr, PageStatus::Written);
                    continue;
                }

                let read = s.read(page_addr, page.len())?;
                if read != page {
                    report_mismatch(page_addr, &page, &read);
                    return Ok(false);
                }
                progress(page_addr, PageStatus::Verified);
            }

            Ok(true)
        })
    }

    /// Compare flash against an Intel HEX image without writing
    pub fn verify_file<B: BufRead>(
        &mut self,
        chip: &Chip,
        image: B,
    ) -> Result<bool, ProgrammerError<T, R>> {
        self.verify_file_with(chip, image, |_, _| ())
    }

    /// As [`Programmer::verify_file`], reporting each verified page
    pub fn verify_file_with<B, F>(
        &mut self,
        chip: &Chip,
        image: B,
        mut progress: F,
    ) -> Result<bool, ProgrammerError<T, R>>
    where
        B: BufRead,
        F: FnMut(u32, PageStatus),
    {
        chip.validate().map_err(Error::InvalidChip)?;
        self.check_signature(chip)?;

        let mut hex = HexReader::new(image).extended_records(self.options.extended_records);
        let clock = chip.clock_hz.unwrap_or(self.options.fast_clock_hz);

        self.with_session(clock, |s| {
            for page_addr in (0..chip.flash_size).step_by(chip.page_size as usize) {
                let mut page = vec![ERASED; chip.page_size as usize];
                hex.fill_page(page_addr, &mut page)?;

                debug!("Verifying page 0x{:05x}", page_addr);
                let read = s.read(page_addr, page.len())?;
                if read != page {
                    report_mismatch(page_addr, &page, &read);
                    return Ok(false);
                }
                progress(page_addr, PageStatus::Verified);

                if hex.is_finished() {
                    break;
                }
            }

            Ok(true)
        })
    }

    fn check_signature(&mut self, chip: &Chip) -> Result<(), ProgrammerError<T, R>> {
        let found = self.read_signature()?;
        if found != chip.signature {
            error!("Target is not a {}", chip.name);
            return Err(Error::SignatureMismatch {
                expected: chip.signature,
                found,
            });
        }
        Ok(())
    }
}

fn report_mismatch(page_addr: u32, expected: &[u8], found: &[u8]) {
    let offset = expected
        .iter()
        .zip(found.iter())
        .position(|(a, b)| a != b)
        .unwrap_or(0);
    warn!(
        "Verify failed at 0x{:05x}\nPage should be: {:02x?}\nBut contains: {:02x?}",
        page_addr as usize + offset,
        expected,
        found
    );
}
