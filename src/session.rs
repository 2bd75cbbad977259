use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::digital::v2::OutputPin;

use crate::protocol::{
    control, frame, opcodes, word_frame, ERASED, FRAME_LEN, STATUS_BUSY,
};
use crate::{Error, IspTransport, Programmer, ProgrammerError};

/// An active programming session.
///
/// Holds the bus lock with the target in reset. The session is closed by
/// [`Session::end`], or on drop if it is abandoned on an error path.
pub struct Session<'a, T, R, D>
where
    T: IspTransport,
    R: OutputPin,
    D: DelayUs<u32>,
    T::Error: Debug,
    R::Error: Debug,
{
    prog: &'a mut Programmer<T, R, D>,
    locked: bool,
    active: bool,
    ext_addr: Option<u8>,
}

impl<'a, T, R, D> Session<'a, T, R, D>
where
    T: IspTransport,
    R: OutputPin,
    D: DelayUs<u32>,
    T::Error: Debug,
    R::Error: Debug,
{
    pub(crate) fn begin(
        prog: &'a mut Programmer<T, R, D>,
        clock_hz: u32,
    ) -> Result<Self, ProgrammerError<T, R>> {
        debug!("Entering programming mode at {} Hz", clock_hz);

        // Constructed first so a failure part way through still releases
        let mut s = Self {
            prog,
            locked: false,
            active: true,
            ext_addr: None,
        };

        s.prog.reset.set_low().map_err(Error::Pin)?;

        block!(s.prog.transport.try_lock()).map_err(Error::Transport)?;
        s.locked = true;

        s.prog.transport.set_clock(clock_hz).map_err(Error::Transport)?;

        s.transact(frame(
            opcodes::CONTROL,
            control::PROGRAMMING_ENABLE as u32,
            0,
            0,
        ))?;

        Ok(s)
    }

    /// Leave programming mode, releasing the bus and the reset line
    pub fn end(mut self) -> Result<(), ProgrammerError<T, R>> {
        self.release()
    }

    fn release(&mut self) -> Result<(), ProgrammerError<T, R>> {
        self.active = false;

        let unlocked = if self.locked {
            self.locked = false;
            self.prog.transport.unlock().map_err(Error::Transport)
        } else {
            Ok(())
        };
        let reset = self.prog.reset.set_high().map_err(Error::Pin);

        debug!("Left programming mode");
        unlocked.and(reset)
    }

    /// Exchange one instruction with the target, returning the last three
    /// reply bytes
    pub fn transact(&mut self, command: [u8; FRAME_LEN]) -> Result<[u8; 3], ProgrammerError<T, R>> {
        let mut reply = command;
        self.prog
            .transport
            .transfer(&mut reply)
            .map_err(Error::Transport)?;

        trace!("Sent {:02x?} received {:02x?}", command, reply);

        if reply[2] != command[1] {
            return Err(Error::Protocol { command, reply });
        }

        Ok([reply[1], reply[2], reply[3]])
    }

    /// Poll the target until it finishes an erase or write cycle
    pub fn busy_wait(&mut self) -> Result<(), ProgrammerError<T, R>> {
        let limit = self.prog.options.busy_poll_limit;
        let mut polls = 0;

        loop {
            let status = self.transact(frame(opcodes::POLL_STATUS, 0, 0, 0))?[2];
            if status & STATUS_BUSY == 0 {
                return Ok(());
            }

            polls += 1;
            if limit != 0 && polls >= limit {
                error!("Target still busy after {} polls", polls);
                return Err(Error::Timeout { polls });
            }

            self.prog.delay.delay_us(self.prog.options.poll_delay_us);
        }
    }

    pub fn read_signature(&mut self) -> Result<[u8; 3], ProgrammerError<T, R>> {
        let mut sig = [0u8; 3];
        for (i, b) in sig.iter_mut().enumerate() {
            *b = self.transact(frame(opcodes::READ_SIGNATURE, 0, i as u32, 0))?[2];
        }
        Ok(sig)
    }

    /// Read `len` bytes of flash starting at byte address `addr`
    pub fn read(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, ProgrammerError<T, R>> {
        let mut data = Vec::with_capacity(len + 1);

        for i in 0..(len as u32 + 1) / 2 {
            let word = addr / 2 + i;
            self.load_extended(word)?;

            let high = self.transact(word_frame(opcodes::READ_FLASH_HIGH, word, 0))?[2];
            let low = self.transact(word_frame(opcodes::READ_FLASH_LOW, word, 0))?[2];

            // Program memory words are little endian
            data.push(low);
            data.push(high);
        }

        data.truncate(len);
        Ok(data)
    }

    /// Load one word into the page buffer at word offset `addr`
    pub fn flash_word(&mut self, addr: u32, low: u8, high: u8) -> Result<(), ProgrammerError<T, R>> {
        self.transact(word_frame(opcodes::LOAD_PAGE_LOW, addr, low))?;
        self.transact(word_frame(opcodes::LOAD_PAGE_HIGH, addr, high))?;
        Ok(())
    }

    /// Load and commit one flash page at byte address `page_addr`
    pub fn flash_page(&mut self, page: &[u8], page_addr: u32) -> Result<(), ProgrammerError<T, R>> {
        for (i, word) in page.chunks(2).enumerate() {
            let high = word.get(1).copied().unwrap_or(ERASED);
            self.flash_word(i as u32, word[0], high)?;
        }

        let word_addr = page_addr / 2;
        self.load_extended(word_addr)?;

        let reply = self.transact(word_frame(opcodes::WRITE_PAGE, word_addr, 0))?;
        let found = u16::from_be_bytes([reply[1], reply[2]]);
        let expected = (word_addr & 0xFFFF) as u16;
        if found != expected {
            return Err(Error::Commit { expected, found });
        }

        self.busy_wait()
    }

    fn load_extended(&mut self, word_addr: u32) -> Result<(), ProgrammerError<T, R>> {
        let ext = (word_addr >> 16) as u8;
        // Target state is unknown until the first load of a session
        if self.ext_addr != Some(ext) {
            trace!("Loading extended address 0x{:02x}", ext);
            self.transact(frame(opcodes::LOAD_EXTENDED_ADDR, 0, ext as u32, 0))?;
            self.ext_addr = Some(ext);
        }
        Ok(())
    }
}

impl<'a, T, R, D> Drop for Session<'a, T, R, D>
where
    T: IspTransport,
    R: OutputPin,
    D: DelayUs<u32>,
    T::Error: Debug,
    R::Error: Debug,
{
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.release() {
                warn!("Failed to release programming session: {:?}", e);
            }
        }
    }
}
