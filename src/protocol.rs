//! AVR serial programming instruction set.
//!
//! Every instruction is a four byte frame, the target shifts out the second
//! command byte while the third is being clocked in, which is how loss of
//! synchronisation is detected.

/// Clock used for signature, fuse and erase operations
pub const SLOW_CLOCK_HZ: u32 = 100_000;

/// Default clock used for flash programming
pub const FAST_CLOCK_HZ: u32 = 1_000_000;

/// Value of an erased flash byte
pub const ERASED: u8 = 0xFF;

/// Length of a command or reply frame
pub const FRAME_LEN: usize = 4;

/// Instruction opcodes
pub mod opcodes {
    /// Programming enable, chip erase and fuse writes (selected by the second byte)
    pub const CONTROL: u8 = 0xAC;
    /// Read signature byte
    pub const READ_SIGNATURE: u8 = 0x30;
    /// Read low fuse / extended fuse
    pub const READ_FUSE_LOW: u8 = 0x50;
    /// Read high fuse / lock bits
    pub const READ_FUSE_HIGH: u8 = 0x58;
    /// Read program memory, low byte
    pub const READ_FLASH_LOW: u8 = 0x20;
    /// Read program memory, high byte
    pub const READ_FLASH_HIGH: u8 = 0x28;
    /// Load program memory page, low byte
    pub const LOAD_PAGE_LOW: u8 = 0x40;
    /// Load program memory page, high byte
    pub const LOAD_PAGE_HIGH: u8 = 0x48;
    /// Write program memory page
    pub const WRITE_PAGE: u8 = 0x4C;
    /// Load extended address byte
    pub const LOAD_EXTENDED_ADDR: u8 = 0x4D;
    /// Poll RDY/BSY
    pub const POLL_STATUS: u8 = 0xF0;
}

/// Second byte of [`opcodes::CONTROL`] instructions
pub mod control {
    pub const PROGRAMMING_ENABLE: u8 = 0x53;
    pub const CHIP_ERASE: u8 = 0x80;
    pub const WRITE_LOCK: u8 = 0xE0;
    pub const WRITE_FUSE_LOW: u8 = 0xA0;
    pub const WRITE_FUSE_HIGH: u8 = 0xA8;
    pub const WRITE_FUSE_EXT: u8 = 0xA4;
}

/// Status bit set while the target is busy with an erase or write cycle
pub const STATUS_BUSY: u8 = 0x01;

/// Fuse bytes in the order they are reported by the programmer
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Fuse {
    Low,
    High,
    Extended,
    Lock,
}

impl Fuse {
    pub const ALL: [Fuse; 4] = [Fuse::Low, Fuse::High, Fuse::Extended, Fuse::Lock];

    /// Instruction used to read this fuse
    pub fn read_frame(self) -> [u8; FRAME_LEN] {
        match self {
            Fuse::Low => frame(opcodes::READ_FUSE_LOW, 0x00, 0, 0),
            Fuse::High => frame(opcodes::READ_FUSE_HIGH, 0x08, 0, 0),
            Fuse::Extended => frame(opcodes::READ_FUSE_LOW, 0x08, 0, 0),
            Fuse::Lock => frame(opcodes::READ_FUSE_HIGH, 0x00, 0, 0),
        }
    }

    /// Instruction used to write `value` to this fuse
    pub fn write_frame(self, value: u8) -> [u8; FRAME_LEN] {
        let sub = match self {
            Fuse::Low => control::WRITE_FUSE_LOW,
            Fuse::High => control::WRITE_FUSE_HIGH,
            Fuse::Extended => control::WRITE_FUSE_EXT,
            Fuse::Lock => control::WRITE_LOCK,
        };
        frame(opcodes::CONTROL, sub as u32, 0, value as u32)
    }
}

/// Build a command frame, each parameter is truncated to its low 8 bits
pub fn frame(opcode: u8, a: u32, b: u32, c: u32) -> [u8; FRAME_LEN] {
    [opcode, (a & 0xFF) as u8, (b & 0xFF) as u8, (c & 0xFF) as u8]
}

/// Build a command frame addressing a flash word, `(addr >> 8, addr & 0xFF)`
pub fn word_frame(opcode: u8, word_addr: u32, data: u8) -> [u8; FRAME_LEN] {
    frame(opcode, word_addr >> 8, word_addr, data as u32)
}
