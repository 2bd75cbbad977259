//! Intel HEX page reader
//!
//! Streams data records from a line oriented Intel HEX source into fixed size
//! flash page buffers. Records are consumed in file order; a record that lies
//! beyond the current page (or runs off its end) is held back and offered
//! again to the next page.

use std::io::BufRead;

use thiserror::Error;

/// Errors raised while reading a hex image
#[derive(Debug, Error)]
pub enum HexError {
    #[error("line {line}: record does not start with ':'")]
    MissingStartCode { line: usize },

    #[error("line {line}: invalid hex digits in {field} field")]
    InvalidDigits { line: usize, field: &'static str },

    #[error("line {line}: record is shorter than its byte count")]
    Truncated { line: usize },

    #[error("line {line}: unsupported record type 0x{kind:02x}")]
    UnsupportedRecord { line: usize, kind: u8 },

    #[error("line {line}: address record must carry two data bytes")]
    MalformedAddress { line: usize },

    #[error("line {line}: checksum mismatch (sum 0x{sum:02x})")]
    Checksum { line: usize, sum: u8 },

    #[error("failed to read hex input: {0}")]
    Io(#[from] std::io::Error),
}

const DATA: u8 = 0x00;
const END_OF_FILE: u8 = 0x01;
const EXTENDED_SEGMENT_ADDR: u8 = 0x02;
const START_SEGMENT_ADDR: u8 = 0x03;
const EXTENDED_LINEAR_ADDR: u8 = 0x04;

#[derive(Clone, PartialEq, Debug)]
enum Record {
    Data { address: u16, bytes: Vec<u8> },
    EndOfFile,
    ExtendedSegment(u16),
    StartSegment,
    ExtendedLinear(u16),
}

/// Data record with its absolute address resolved
#[derive(Clone, PartialEq, Debug)]
struct Chunk {
    address: u32,
    bytes: Vec<u8>,
}

impl Chunk {
    fn end(&self) -> u32 {
        self.address.saturating_add(self.bytes.len() as u32)
    }
}

fn hex_field(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}

fn address_base(bytes: &[u8], line: usize) -> Result<u16, HexError> {
    match *bytes {
        [hi, lo] => Ok(u16::from_be_bytes([hi, lo])),
        _ => Err(HexError::MalformedAddress { line }),
    }
}

fn parse_record(text: &str, line: usize, extended: bool) -> Result<Record, HexError> {
    let body = text
        .strip_prefix(':')
        .ok_or(HexError::MissingStartCode { line })?;

    let field = |start: usize, len: usize, name: &'static str| -> Result<u32, HexError> {
        let s = body
            .get(start..start + len)
            .ok_or(HexError::Truncated { line })?;
        hex_field(s).ok_or(HexError::InvalidDigits { line, field: name })
    };

    let count = field(0, 2, "length")? as usize;
    let address = field(2, 4, "address")?;
    let kind = field(6, 2, "record type")? as u8;

    let supported = match kind {
        DATA | END_OF_FILE => true,
        EXTENDED_SEGMENT_ADDR | START_SEGMENT_ADDR | EXTENDED_LINEAR_ADDR => extended,
        _ => false,
    };
    if !supported {
        return Err(HexError::UnsupportedRecord { line, kind });
    }

    let mut bytes = Vec::with_capacity(count);
    for i in 0..count {
        bytes.push(field(8 + i * 2, 2, "data")? as u8);
    }
    let checksum = field(8 + count * 2, 2, "checksum")?;

    let sum = bytes.iter().fold(
        count as u32 + (address >> 8) + (address & 0xFF) + kind as u32 + checksum,
        |acc, b| acc + *b as u32,
    );
    if sum & 0xFF != 0 {
        return Err(HexError::Checksum {
            line,
            sum: (sum & 0xFF) as u8,
        });
    }

    Ok(match kind {
        DATA => Record::Data {
            address: address as u16,
            bytes,
        },
        END_OF_FILE => Record::EndOfFile,
        EXTENDED_SEGMENT_ADDR => Record::ExtendedSegment(address_base(&bytes, line)?),
        EXTENDED_LINEAR_ADDR => Record::ExtendedLinear(address_base(&bytes, line)?),
        _ => Record::StartSegment,
    })
}

/// Cursor over an Intel HEX stream that fills flash pages in address order
pub struct HexReader<R> {
    reader: R,
    text: String,
    line: usize,
    base: u32,
    extended: bool,
    deferred: Option<Chunk>,
    finished: bool,
}

impl<R: BufRead> HexReader<R> {
    /// Create a reader over a hex stream, only data and end-of-file records
    /// are accepted
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            text: String::new(),
            line: 0,
            base: 0,
            extended: false,
            deferred: None,
            finished: false,
        }
    }

    /// Also accept extended segment / linear address and start segment records
    pub fn extended_records(mut self, enabled: bool) -> Self {
        self.extended = enabled;
        self
    }

    /// Number of lines consumed so far
    pub fn line(&self) -> usize {
        self.line
    }

    /// True once the stream is exhausted or an end-of-file record was read
    /// and nothing is held back for a later page
    pub fn is_finished(&self) -> bool {
        self.finished && self.deferred.is_none()
    }

    /// Fill `page` (covering `page_addr..page_addr + page.len()`) from the
    /// stream. Bytes with no data are left untouched, so pre-fill the buffer.
    ///
    /// Returns `false` once the stream has no more data, `true` when the page
    /// is full or the next record belongs to a later page.
    pub fn fill_page(&mut self, page_addr: u32, page: &mut [u8]) -> Result<bool, HexError> {
        let page_end = page_addr + page.len() as u32;

        loop {
            let chunk = match self.deferred.take() {
                Some(c) => c,
                None => match self.next_chunk()? {
                    Some(c) => c,
                    None => return Ok(false),
                },
            };

            if chunk.address >= page_end {
                self.deferred = Some(chunk);
                return Ok(true);
            }

            let end = chunk.end();
            if end <= page_addr {
                trace!(
                    "Skipping record at 0x{:05x} before page 0x{:05x}",
                    chunk.address,
                    page_addr
                );
                continue;
            }

            let start = chunk.address.max(page_addr);
            let stop = end.min(page_end);
            let src = (start - chunk.address) as usize..(stop - chunk.address) as usize;
            page[(start - page_addr) as usize..(stop - page_addr) as usize]
                .copy_from_slice(&chunk.bytes[src]);

            if end > page_end {
                // Remainder belongs to the next page
                self.deferred = Some(chunk);
                return Ok(true);
            }
            if stop == page_end {
                return Ok(true);
            }
        }
    }

    fn next_chunk(&mut self) -> Result<Option<Chunk>, HexError> {
        while !self.finished {
            self.text.clear();
            if self.reader.read_line(&mut self.text)? == 0 {
                self.finished = true;
                break;
            }
            self.line += 1;

            match parse_record(self.text.trim_end(), self.line, self.extended)? {
                Record::Data { address, bytes } => {
                    return Ok(Some(Chunk {
                        address: self.base + address as u32,
                        bytes,
                    }))
                }
                Record::EndOfFile => {
                    debug!("End of file record at line {}", self.line);
                    self.finished = true;
                }
                Record::ExtendedSegment(v) => self.base = (v as u32) << 4,
                Record::ExtendedLinear(v) => self.base = (v as u32) << 16,
                Record::StartSegment => (),
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = ":10000000000102030405060708090A0B0C0D0E0F78";
    const EOF: &str = ":00000001FF";

    fn record(address: u16, kind: u8, data: &[u8]) -> String {
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

    fn reader(text: &str) -> HexReader<&[u8]> {
        HexReader::new(text.as_bytes())
    }

    #[test]
    fn fills_single_page() {
        let text = format!("{}\n{}\n", LINE, EOF);
        let mut r = reader(&text);
        let mut page = [0xFF; 16];

        assert_eq!(r.fill_page(0, &mut page).unwrap(), true);
        let expected: Vec<u8> = (0..16).collect();
        assert_eq!(&page[..], &expected[..]);

        let mut next = [0xFF; 16];
        assert_eq!(r.fill_page(16, &mut next).unwrap(), false);
        assert_eq!(next, [0xFF; 16]);
        assert!(r.is_finished());
    }

    #[test]
    fn rejects_bad_checksum() {
        let text = ":10000000000102030405060708090A0B0C0D0E0F79\n";
        let mut page = [0xFF; 16];
        match reader(text).fill_page(0, &mut page) {
            Err(HexError::Checksum { line: 1, .. }) => (),
            r => panic!("unexpected result: {:?}", r),
        }
    }

    #[test]
    fn rejects_malformed_lines() {
        let mut page = [0xFF; 16];

        let r = reader("10000000\n").fill_page(0, &mut page);
        assert!(matches!(r, Err(HexError::MissingStartCode { line: 1 })));

        let r = reader(":1G000000\n").fill_page(0, &mut page);
        assert!(matches!(r, Err(HexError::InvalidDigits { field: "length", .. })));

        let r = reader(":04000000AABB\n").fill_page(0, &mut page);
        assert!(matches!(r, Err(HexError::Truncated { .. })));

        let text = record(0, 0x05, &[0, 0, 0, 0]);
        let r = reader(&text).fill_page(0, &mut page);
        assert!(matches!(r, Err(HexError::UnsupportedRecord { kind: 5, .. })));
    }

    #[test]
    fn address_records_need_opt_in() {
        let text = format!("{}{}", record(0, 0x04, &[0x00, 0x01]), record(0, 0, &[0xAA]));
        let mut page = [0xFF; 4];

        let r = reader(&text).fill_page(0, &mut page);
        assert!(matches!(r, Err(HexError::UnsupportedRecord { kind: 4, .. })));

        let mut r = reader(&text).extended_records(true);
        assert_eq!(r.fill_page(0, &mut page).unwrap(), true);
        assert_eq!(page, [0xFF; 4]);
        assert_eq!(r.fill_page(0x1_0000, &mut page).unwrap(), false);
        assert_eq!(page, [0xAA, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn defers_records_for_later_pages() {
        let text = format!("{}{}", record(0x20, 0, &[1, 2, 3, 4]), EOF);
        let mut r = reader(&text);

        let mut page = [0xFF; 16];
        assert_eq!(r.fill_page(0x00, &mut page).unwrap(), true);
        assert_eq!(page, [0xFF; 16]);
        assert_eq!(r.fill_page(0x10, &mut page).unwrap(), true);
        assert_eq!(page, [0xFF; 16]);

        assert_eq!(r.fill_page(0x20, &mut page).unwrap(), false);
        assert_eq!(&page[..5], &[1, 2, 3, 4, 0xFF]);
    }

    #[test]
    fn splits_records_across_pages() {
        let data: Vec<u8> = (0x10..0x20).collect();
        let text = record(0x08, 0, &data);
        let mut r = reader(&text);

        let mut first = [0xFF; 16];
        assert_eq!(r.fill_page(0x00, &mut first).unwrap(), true);
        assert_eq!(&first[..8], &[0xFF; 8]);
        assert_eq!(&first[8..], &data[..8]);

        let mut second = [0xFF; 16];
        assert_eq!(r.fill_page(0x10, &mut second).unwrap(), false);
        assert_eq!(&second[..8], &data[8..]);
        assert_eq!(&second[8..], &[0xFF; 8]);
    }

    #[test]
    fn skips_stale_records() {
        let text = format!("{}{}", record(0x00, 0, &[1, 2]), record(0x40, 0, &[3]));
        let mut r = reader(&text);

        let mut page = [0xFF; 16];
        assert_eq!(r.fill_page(0x40, &mut page).unwrap(), false);
        assert_eq!(page[0], 3);
        assert_eq!(&page[1..], &[0xFF; 15]);
        assert_eq!(r.line(), 2);
    }

    #[test]
    fn multiple_records_fill_one_page() {
        let text = format!(
            "{}{}{}",
            record(0x00, 0, &[0; 8]),
            record(0x08, 0, &[1; 8]),
            record(0x10, 0, &[2; 8])
        );
        let mut r = reader(&text);

        let mut page = [0xFF; 16];
        assert_eq!(r.fill_page(0, &mut page).unwrap(), true);
        assert_eq!(&page[..8], &[0; 8]);
        assert_eq!(&page[8..], &[1; 8]);
        // Third record has not been consumed yet
        assert_eq!(r.line(), 2);
    }

    #[test]
    fn rejects_blank_lines() {
        let mut r = reader(":0400000001020304F2\n\n:00000001FF\n");

        let mut page = [0xFF; 16];
        match r.fill_page(0, &mut page) {
            Err(HexError::MissingStartCode { line: 2 }) => (),
            res => panic!("unexpected result: {:?}", res),
        }
    }
}
