//! Target part descriptors

use crate::protocol::Fuse;

/// Values for all four fuse bytes
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct Fuses {
    pub low: u8,
    pub high: u8,
    pub ext: u8,
    pub lock: u8,
}

impl Fuses {
    pub const fn new(low: u8, high: u8, ext: u8, lock: u8) -> Self {
        Self { low, high, ext, lock }
    }

    pub fn get(&self, fuse: Fuse) -> u8 {
        match fuse {
            Fuse::Low => self.low,
            Fuse::High => self.high,
            Fuse::Extended => self.ext,
            Fuse::Lock => self.lock,
        }
    }

    pub fn set(&mut self, fuse: Fuse, value: u8) {
        match fuse {
            Fuse::Low => self.low = value,
            Fuse::High => self.high = value,
            Fuse::Extended => self.ext = value,
            Fuse::Lock => self.lock = value,
        }
    }
}

/// A partial set of fuse values, `None` fields are left untouched on write
/// and ignored on verify.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct FuseSet {
    pub low: Option<u8>,
    pub high: Option<u8>,
    pub ext: Option<u8>,
    pub lock: Option<u8>,
}

impl FuseSet {
    pub fn with_low(mut self, v: u8) -> Self {
        self.low = Some(v);
        self
    }

    pub fn with_high(mut self, v: u8) -> Self {
        self.high = Some(v);
        self
    }

    pub fn with_ext(mut self, v: u8) -> Self {
        self.ext = Some(v);
        self
    }

    pub fn with_lock(mut self, v: u8) -> Self {
        self.lock = Some(v);
        self
    }

    pub fn get(&self, fuse: Fuse) -> Option<u8> {
        match fuse {
            Fuse::Low => self.low,
            Fuse::High => self.high,
            Fuse::Extended => self.ext,
            Fuse::Lock => self.lock,
        }
    }

    pub fn is_empty(&self) -> bool {
        Fuse::ALL.iter().all(|f| self.get(*f).is_none())
    }
}

impl From<Fuses> for FuseSet {
    fn from(f: Fuses) -> Self {
        Self {
            low: Some(f.low),
            high: Some(f.high),
            ext: Some(f.ext),
            lock: Some(f.lock),
        }
    }
}

/// Static description of a target part
#[derive(Clone, PartialEq, Debug)]
pub struct Chip {
    pub name: &'static str,
    pub signature: [u8; 3],
    /// Flash size in bytes
    pub flash_size: u32,
    /// Flash page size in bytes
    pub page_size: u32,
    /// Implemented bits of each fuse byte
    pub fuse_mask: Fuses,
    /// Programming clock override, parts with a slow default clock need this
    pub clock_hz: Option<u32>,
}

pub const ATTINY13A: Chip = Chip {
    name: "ATtiny13a",
    signature: [0x1E, 0x90, 0x07],
    flash_size: 1024,
    page_size: 32,
    fuse_mask: Fuses::new(0xFF, 0xFF, 0x00, 0x03),
    clock_hz: Some(100_000),
};

pub const ATTINY85: Chip = Chip {
    name: "ATtiny85",
    signature: [0x1E, 0x93, 0x0B],
    flash_size: 8192,
    page_size: 64,
    fuse_mask: Fuses::new(0xFF, 0xFF, 0x07, 0x3F),
    clock_hz: None,
};

pub const ATMEGA328P: Chip = Chip {
    name: "ATmega328p",
    signature: [0x1E, 0x95, 0x0F],
    flash_size: 32768,
    page_size: 128,
    fuse_mask: Fuses::new(0xFF, 0xFF, 0x07, 0x3F),
    clock_hz: None,
};

pub const ATMEGA328PB: Chip = Chip {
    name: "ATmega328pb",
    signature: [0x1E, 0x95, 0x16],
    flash_size: 32768,
    page_size: 128,
    fuse_mask: Fuses::new(0xFF, 0xFF, 0x07, 0x3F),
    clock_hz: None,
};

pub const ATMEGA644PA: Chip = Chip {
    name: "ATmega644pa",
    signature: [0x1E, 0x96, 0x0A],
    flash_size: 65536,
    page_size: 256,
    fuse_mask: Fuses::new(0xF7, 0x8F, 0xFD, 0xFF),
    clock_hz: None,
};

pub const ATMEGA2560: Chip = Chip {
    name: "ATmega2560",
    signature: [0x1E, 0x98, 0x01],
    flash_size: 262144,
    page_size: 256,
    fuse_mask: Fuses::new(0xFF, 0xFF, 0x07, 0x3F),
    clock_hz: None,
};

/// Known parts
pub const CHIPS: &[Chip] = &[
    ATTINY13A,
    ATTINY85,
    ATMEGA328P,
    ATMEGA328PB,
    ATMEGA644PA,
    ATMEGA2560,
];

impl Chip {
    /// Look up a known part by name (case insensitive)
    pub fn by_name(name: &str) -> Option<&'static Chip> {
        CHIPS.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Look up a known part by its signature bytes
    pub fn by_signature(signature: &[u8; 3]) -> Option<&'static Chip> {
        CHIPS.iter().find(|c| &c.signature == signature)
    }

    /// Number of flash pages
    pub fn pages(&self) -> u32 {
        self.flash_size / self.page_size
    }

    /// Check the descriptor geometry can be programmed page by page
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.page_size == 0 || self.page_size % 2 != 0 {
            return Err("page size must be a non-zero number of words");
        }
        if self.flash_size % self.page_size != 0 {
            return Err("page size must divide flash size");
        }
        Ok(())
    }
}
