use std::io::Error as IoError;
use std::path::Path;

use anyhow::{anyhow, Context};

use embedded_hal::blocking::spi::Transfer;
use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};
use linux_embedded_hal::sysfs_gpio::Direction;
use linux_embedded_hal::{Delay, Pin, Spidev};

use crate::{IspTransport, Options, Programmer};

/// Linux spidev bus with an in-process ownership flag
pub struct LinuxSpi {
    spi: Spidev,
    locked: bool,
}

impl LinuxSpi {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IoError> {
        let spi = Spidev::open(path)?;
        Ok(Self { spi, locked: false })
    }
}

impl Transfer<u8> for LinuxSpi {
    type Error = IoError;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        self.spi.transfer(words)
    }
}

impl IspTransport for LinuxSpi {
    fn set_clock(&mut self, hz: u32) -> Result<(), IoError> {
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(hz)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        self.spi.0.configure(&options)
    }

    fn try_lock(&mut self) -> nb::Result<(), IoError> {
        if self.locked {
            return Err(nb::Error::WouldBlock);
        }
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> Result<(), IoError> {
        self.locked = false;
        Ok(())
    }
}

impl Programmer<LinuxSpi, Pin, Delay> {
    /// Create a new linux spidev programmer instance, using a sysfs GPIO
    /// for the target reset line
    pub fn linux<P: AsRef<Path>>(spi: P, reset_gpio: u64, options: Options) -> anyhow::Result<Self> {
        let path = spi.as_ref();

        // Open bus
        let spi = LinuxSpi::open(path)
            .with_context(|| format!("failed to open SPI device {}", path.display()))?;

        // Export reset line, idle high so the target keeps running
        let reset = Pin::new(reset_gpio);
        reset
            .0
            .export()
            .with_context(|| format!("failed to export GPIO {}", reset_gpio))?;
        reset
            .0
            .set_direction(Direction::High)
            .with_context(|| format!("failed to configure GPIO {}", reset_gpio))?;

        // Return instance
        Self::new(spi, reset, Delay {}, options).map_err(|e| anyhow!("{}", e))
    }
}
