//! Motorola S-Record codec.
//!
//! Lines have the form `S<type><count><address><data...><checksum>`, every
//! field hex encoded. The count covers address, data and checksum bytes, the
//! checksum is the ones complement of the 8 bit sum of count, address and
//! data bytes. The address is 2 bytes wide for types 0, 1, 5 and 9, 3 bytes
//! for types 2 and 8, and 4 bytes for types 3 and 7.
//!
//! Flash images are handled as a flat [`FlashImage`] covering the whole 24
//! bit address space, erased bytes are never emitted.

use std::io::{BufRead, Write};
use std::ops::{Deref, DerefMut, Range};

use crate::checksum::sum8;
use crate::protocol::ERASED;

/// Size of the flat image, the full 24 bit address space
pub const IMAGE_SIZE: usize = 1 << 24;

/// Data bytes per emitted record
pub const LINE_BLOCK: usize = 16;

/// Text carried by the header record written before any data
pub const HEADER: &[u8] = b"Kuji";

/// Shortest line treated as a record by [`linearize`]
const MIN_LINE: usize = 10;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed header")]
    MalformedHeader,

    #[error("invalid count")]
    MalformedCount,

    #[error("invalid address")]
    MalformedAddress,

    #[error("invalid data")]
    MalformedData,

    #[error("invalid checksum")]
    MalformedChecksum,

    #[error("checksum mismatch (computed 0x{computed:02X}, declared 0x{declared:02X})")]
    ChecksumMismatch { computed: u8, declared: u8 },
}

#[derive(Debug, thiserror::Error)]
pub enum SrecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {source}")]
    Parse { line: usize, source: ParseError },

    #[error("line {line}: address 0x{address:06X} outside 0x{low:06X}-0x{high:06X}")]
    AddressOutOfRange {
        line: usize,
        address: u32,
        low: u32,
        high: u32,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Address width in bytes for a record type
pub fn address_width(record_type: u8) -> Option<usize> {
    match record_type {
        0 | 1 | 5 | 9 => Some(2),
        2 | 8 => Some(3),
        3 | 7 => Some(4),
        _ => None,
    }
}

/// Check whether every byte is erased
pub fn is_blank(data: &[u8]) -> bool {
    data.iter().all(|&b| b == ERASED)
}

/// One parsed S-Record line
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub record_type: u8,
    /// Payload bytes, excluding address and checksum
    pub count: u8,
    pub address: u32,
    pub data: Vec<u8>,
    pub checksum: u8,
}

impl Record {
    /// Build a record, computing its checksum
    pub fn new(record_type: u8, address: u32, data: &[u8]) -> Result<Self, SrecError> {
        let width = address_width(record_type).ok_or_else(|| {
            SrecError::InvalidArgument(format!("record type {}", record_type))
        })?;

        if data.len() + width + 1 > 0xFF {
            return Err(SrecError::InvalidArgument(format!(
                "{} data bytes do not fit one record",
                data.len()
            )));
        }
        if width < 4 && address >> (width * 8) != 0 {
            return Err(SrecError::InvalidArgument(format!(
                "address 0x{:X} does not fit an S{} record",
                address, record_type
            )));
        }

        let mut r = Self {
            record_type,
            count: data.len() as u8,
            address,
            data: data.to_vec(),
            checksum: 0,
        };
        r.checksum = !sum8(&r.body());
        Ok(r)
    }

    fn width(&self) -> usize {
        address_width(self.record_type).unwrap_or(4)
    }

    /// Count, address and data bytes as they appear on the line
    fn body(&self) -> Vec<u8> {
        let width = self.width();
        let mut b = Vec::with_capacity(1 + width + self.data.len());
        b.push((width + self.data.len() + 1) as u8);
        b.extend_from_slice(&self.address.to_be_bytes()[4 - width..]);
        b.extend_from_slice(&self.data);
        b
    }

    /// Encode as a line, without terminator
    pub fn to_line(&self) -> String {
        format!(
            "S{}{}{:02X}",
            self.record_type,
            hex::encode_upper(self.body()),
            self.checksum
        )
    }
}

fn hex_field(s: Option<&str>, err: ParseError) -> Result<Vec<u8>, ParseError> {
    s.and_then(|s| hex::decode(s).ok()).ok_or(err)
}

/// Parse and validate one S-Record line
///
/// Framing follows the line length: the last two characters are always
/// the checksum. The checksum is verified before the declared count, so
/// any corrupted count, address or data digit reports
/// [`ParseError::ChecksumMismatch`].
pub fn parse_line(text: &str) -> Result<Record, ParseError> {
    let s = text.trim();
    let b = s.as_bytes();

    if b.len() < 2 || b[0] != b'S' || !b[1].is_ascii_digit() {
        return Err(ParseError::MalformedHeader);
    }
    let record_type = b[1] - b'0';
    let body = &s[2..];

    let count = hex_field(body.get(0..2), ParseError::MalformedCount)?[0];

    let width = address_width(record_type).ok_or(ParseError::MalformedAddress)?;
    let address_end = 2 + width * 2;
    let address = hex_field(body.get(2..address_end), ParseError::MalformedAddress)?;

    let rest = &body[address_end..];
    if rest.len() < 2 || !rest.is_char_boundary(rest.len() - 2) {
        return Err(ParseError::MalformedChecksum);
    }
    let (data, checksum) = rest.split_at(rest.len() - 2);
    let checksum = hex_field(Some(checksum), ParseError::MalformedChecksum)?[0];
    let data = hex_field(Some(data), ParseError::MalformedData)?;

    let computed = !(count
        .wrapping_add(sum8(&address))
        .wrapping_add(sum8(&data)));
    if computed != checksum {
        return Err(ParseError::ChecksumMismatch {
            computed,
            declared: checksum,
        });
    }

    if count as usize != width + data.len() + 1 {
        return Err(ParseError::MalformedData);
    }

    Ok(Record {
        record_type,
        count: data.len() as u8,
        address: address.iter().fold(0, |a, &v| (a << 8) | v as u32),
        data,
        checksum,
    })
}

/// Read every record from `source` in file order
///
/// Malformed lines are logged and skipped, a checksum mismatch aborts the
/// whole read.
pub fn read_records<R: BufRead>(source: R) -> Result<Vec<Record>, SrecError> {
    let mut records = Vec::new();

    for (i, line) in source.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match parse_line(&line) {
            Ok(r) => records.push(r),
            Err(e @ ParseError::ChecksumMismatch { .. }) => {
                error!("Line {} has {}", i + 1, e);
                return Err(SrecError::Parse {
                    line: i + 1,
                    source: e,
                });
            }
            Err(e) => warn!("Line {} is not a valid S-Record, {}", i + 1, e),
        }
    }

    Ok(records)
}

/// Flat image of the 24 bit flash address space, initially erased
#[derive(Clone, PartialEq)]
pub struct FlashImage {
    data: Box<[u8]>,
}

impl FlashImage {
    pub fn new() -> Self {
        Self {
            data: vec![ERASED; IMAGE_SIZE].into_boxed_slice(),
        }
    }

    /// Bytes for an address range
    pub fn slice(&self, range: Range<u32>) -> &[u8] {
        &self.data[range.start as usize..range.end as usize]
    }

    pub fn slice_mut(&mut self, range: Range<u32>) -> &mut [u8] {
        &mut self.data[range.start as usize..range.end as usize]
    }

    /// Check whether an address range is entirely erased
    pub fn is_blank(&self, range: Range<u32>) -> bool {
        is_blank(self.slice(range))
    }
}

impl Default for FlashImage {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for FlashImage {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let used = self.data.iter().filter(|&&b| b != ERASED).count();
        write!(f, "FlashImage {{ programmed: {} }}", used)
    }
}

impl Deref for FlashImage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for FlashImage {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Fold the data records of `source` into a fresh [`FlashImage`]
///
/// See [`linearize_into`].
pub fn linearize<R: BufRead>(source: R, low: u32, high: u32) -> Result<FlashImage, SrecError> {
    let mut image = FlashImage::new();
    linearize_into(&mut image, source, low, high)?;
    Ok(image)
}

/// Copy the data records (types 1, 2 and 3) of `source` into `image`
///
/// Every record must lie within `[low, high]`, the first one that does not
/// fails with [`SrecError::AddressOutOfRange`]. Lines shorter than a record
/// are skipped, other record types are skipped without being validated.
/// Data records are validated in full before anything is copied, the image
/// is untouched on error.
pub fn linearize_into<R: BufRead>(
    image: &mut FlashImage,
    source: R,
    low: u32,
    high: u32,
) -> Result<(), SrecError> {
    let mut pending = Vec::new();

    for (i, line) in source.lines().enumerate() {
        let line = line?;
        let n = i + 1;
        let s = line.trim();
        if s.len() < MIN_LINE {
            if !s.is_empty() {
                warn!("Skipping line {}, too short for an S-Record", n);
            }
            continue;
        }

        let b = s.as_bytes();
        if b[0] != b'S' || !b[1].is_ascii_digit() {
            error!("Line {} is not a valid S-Record, {}", n, ParseError::MalformedHeader);
            return Err(SrecError::Parse {
                line: n,
                source: ParseError::MalformedHeader,
            });
        }
        if !matches!(b[1], b'1' | b'2' | b'3') {
            continue;
        }

        let record = parse_line(s).map_err(|e| {
            error!("Line {} is not a valid S-Record, {}", n, e);
            SrecError::Parse { line: n, source: e }
        })?;

        let last = record.address as u64 + record.data.len().saturating_sub(1) as u64;
        if record.address < low || last > high as u64 || last >= IMAGE_SIZE as u64 {
            error!(
                "Line {} has out of bounds data at 0x{:06X} (0x{:06X} - 0x{:06X})",
                n, record.address, low, high
            );
            return Err(SrecError::AddressOutOfRange {
                line: n,
                address: record.address,
                low,
                high,
            });
        }

        pending.push(record);
    }

    for r in pending {
        let start = r.address as usize;
        image[start..start + r.data.len()].copy_from_slice(&r.data);
    }

    Ok(())
}

/// Encode `image` as S-Record lines at `base`
///
/// A header record comes first, then one record per 16 byte block,
/// skipping blocks that are entirely erased. `record_type` selects the
/// address width and must be 1, 2 or 3.
pub fn serialize(image: &[u8], record_type: u8, base: u32) -> Result<Vec<String>, SrecError> {
    serialize_blocks(image, record_type, base, LINE_BLOCK)
}

/// [`serialize`] with a custom number of data bytes per record
pub fn serialize_blocks(
    image: &[u8],
    record_type: u8,
    base: u32,
    block_size: usize,
) -> Result<Vec<String>, SrecError> {
    if !matches!(record_type, 1 | 2 | 3) {
        return Err(SrecError::InvalidArgument(format!(
            "record type {} is not a data record",
            record_type
        )));
    }
    if block_size == 0 {
        return Err(SrecError::InvalidArgument("zero block size".to_string()));
    }

    let mut lines = vec![Record::new(0, 0, HEADER)?.to_line()];

    for (i, block) in image.chunks(block_size).enumerate() {
        if is_blank(block) {
            continue;
        }
        let address = base
            .checked_add((i * block_size) as u32)
            .ok_or_else(|| SrecError::InvalidArgument("address overflow".to_string()))?;
        lines.push(Record::new(record_type, address, block)?.to_line());
    }

    Ok(lines)
}

/// Write [`serialize`] output to `w`, one record per line
pub fn write_records<W: Write>(
    mut w: W,
    image: &[u8],
    record_type: u8,
    base: u32,
) -> Result<(), SrecError> {
    for line in serialize(image, record_type, base)? {
        writeln!(w, "{}", line)?;
    }
    w.flush()?;
    Ok(())
}
