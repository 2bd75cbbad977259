//! In-memory AVR target speaking the serial programming instruction set

#![allow(dead_code)]

use std::convert::Infallible;

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

use avr_isp_programmer::{Chip, IspTransport, Options, Programmer};

#[derive(Debug, Clone, PartialEq)]
pub struct SimError;

pub struct SimTarget {
    pub signature: [u8; 3],
    pub flash: Vec<u8>,
    page_size: usize,
    page: Vec<u8>,
    /// Raw fuse bytes (low, high, ext, lock)
    pub fuses: [u8; 4],
    ext_addr: u8,

    /// Status polls reporting busy after each erase / write
    pub write_busy: u32,
    busy: u32,
    /// Report busy forever
    pub stuck: bool,
    /// Reply with all ones, as a disconnected target would
    pub mute: bool,
    /// Echo a corrupted address on page commit
    pub bad_commit: bool,
    /// Flip bits of every flash byte read
    pub read_xor: u8,

    pub locked: bool,
    pub clock_hz: Option<u32>,
    /// Word addresses of committed pages
    pub commits: Vec<u32>,
    pub frames: Vec<[u8; 4]>,
}

impl SimTarget {
    pub fn new(chip: &Chip) -> Self {
        Self {
            signature: chip.signature,
            flash: vec![0xFF; chip.flash_size as usize],
            page_size: chip.page_size as usize,
            page: vec![0xFF; chip.page_size as usize],
            fuses: [0x62, 0xDF, 0xFF, 0xFF],
            ext_addr: 0,
            write_busy: 2,
            busy: 0,
            stuck: false,
            mute: false,
            bad_commit: false,
            read_xor: 0,
            locked: false,
            clock_hz: None,
            commits: Vec::new(),
            frames: Vec::new(),
        }
    }

    /// Count of frames sent with the given opcode
    pub fn count(&self, opcode: u8) -> usize {
        self.frames.iter().filter(|f| f[0] == opcode).count()
    }

    fn execute(&mut self, cmd: [u8; 4]) -> u8 {
        let local = (cmd[1] as usize) << 8 | cmd[2] as usize;
        let word = (self.ext_addr as usize) << 16 | local;

        match (cmd[0], cmd[1]) {
            (0xAC, 0x53) => cmd[2],
            (0xAC, 0x80) => {
                self.flash.iter_mut().for_each(|b| *b = 0xFF);
                self.fuses[3] = 0xFF;
                self.busy = self.write_busy;
                cmd[2]
            }
            (0xAC, sub) => {
                let idx = match sub {
                    0xA0 => 0,
                    0xA8 => 1,
                    0xA4 => 2,
                    0xE0 => 3,
                    _ => return 0,
                };
                self.fuses[idx] = cmd[3];
                self.busy = self.write_busy;
                cmd[2]
            }
            (0x30, _) => self.signature[cmd[2] as usize % 3],
            (0x50, 0x00) => self.fuses[0],
            (0x58, 0x08) => self.fuses[1],
            (0x50, 0x08) => self.fuses[2],
            (0x58, 0x00) => self.fuses[3],
            (0x20, _) => self.flash.get(word * 2).copied().unwrap_or(0xFF) ^ self.read_xor,
            (0x28, _) => self.flash.get(word * 2 + 1).copied().unwrap_or(0xFF) ^ self.read_xor,
            (0x40, _) => {
                let i = (local * 2) % self.page_size;
                self.page[i] = cmd[3];
                cmd[2]
            }
            (0x48, _) => {
                let i = (local * 2) % self.page_size;
                self.page[i + 1] = cmd[3];
                cmd[2]
            }
            (0x4D, _) => {
                self.ext_addr = cmd[2];
                cmd[2]
            }
            (0x4C, _) => {
                let base = (word * 2) / self.page_size * self.page_size;
                for (i, b) in self.page.iter_mut().enumerate() {
                    self.flash[base + i] &= *b;
                    *b = 0xFF;
                }
                self.commits.push(word as u32);
                self.busy = self.write_busy;
                if self.bad_commit {
                    cmd[2] ^ 0x01
                } else {
                    cmd[2]
                }
            }
            (0xF0, _) => {
                if self.stuck {
                    1
                } else if self.busy > 0 {
                    self.busy -= 1;
                    1
                } else {
                    0
                }
            }
            _ => 0,
        }
    }
}

impl Transfer<u8> for SimTarget {
    type Error = SimError;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], SimError> {
        assert!(self.locked, "transaction outside of a programming session");
        assert_eq!(words.len(), 4);

        let cmd = [words[0], words[1], words[2], words[3]];
        self.frames.push(cmd);

        if self.mute {
            words.copy_from_slice(&[0xFF; 4]);
            return Ok(words);
        }

        let out = self.execute(cmd);
        words.copy_from_slice(&[0x00, cmd[0], cmd[1], out]);
        Ok(words)
    }
}

impl IspTransport for SimTarget {
    fn set_clock(&mut self, hz: u32) -> Result<(), SimError> {
        self.clock_hz = Some(hz);
        Ok(())
    }

    fn try_lock(&mut self) -> nb::Result<(), SimError> {
        if self.locked {
            return Err(nb::Error::WouldBlock);
        }
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> Result<(), SimError> {
        self.locked = false;
        Ok(())
    }
}

/// Reset line recording every level it is driven to
#[derive(Default)]
pub struct ResetPin {
    pub history: Vec<bool>,
}

impl ResetPin {
    pub fn is_high(&self) -> bool {
        self.history.last().copied().unwrap_or(false)
    }
}

impl OutputPin for ResetPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        self.history.push(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.history.push(true);
        Ok(())
    }
}

#[derive(Default)]
pub struct NoDelay {
    pub calls: usize,
}

impl DelayUs<u32> for NoDelay {
    fn delay_us(&mut self, _us: u32) {
        self.calls += 1;
    }
}

pub type SimProgrammer = Programmer<SimTarget, ResetPin, NoDelay>;

pub fn programmer(target: SimTarget) -> SimProgrammer {
    let options = Options {
        busy_poll_limit: 50,
        ..Options::default()
    };
    Programmer::new(target, ResetPin::default(), NoDelay::default(), options).unwrap()
}

/// Format an Intel HEX record with a valid checksum
pub fn record(address: u16, kind: u8, data: &[u8]) -> String {
    let [hi, lo] = address.to_be_bytes();
    let sum = data
        .iter()
        .fold(data.len() as u8, |a, b| a.wrapping_add(*b))
        .wrapping_add(hi)
        .wrapping_add(lo)
        .wrapping_add(kind);

    let mut s = format!(":{:02X}{:04X}{:02X}", data.len(), address, kind);
    for b in data {
        s.push_str(&format!("{:02X}", b));
    }
    s.push_str(&format!("{:02X}\n", sum.wrapping_neg()));
    s
}

/// Hex image of `data` at `base` in 16 byte records
pub fn image(base: u16, data: &[u8]) -> String {
    let mut s = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        s.push_str(&record(base + (i * 16) as u16, 0x00, chunk));
    }
    s.push_str(":00000001FF\n");
    s
}
