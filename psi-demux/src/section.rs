//! PSI section framing: header decode, reassembly and CRC-32.
//!
//! All bit-level field extraction in the table decoders goes through
//! [`SectionReader`], a bounds-checked cursor, so a truncated or
//! oversized section can never read out of range.

use crate::error::DemuxError;

/// Upper bound on the 12-bit section_length field (ISO/IEC 13818-1
/// caps private/PSI sections at 4093).
pub const MAX_SECTION_LENGTH: u16 = 4093;

/// Bounds-checked cursor over a section payload.
#[derive(Debug)]
pub struct SectionReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SectionReader<'a> {
    /// Create a cursor over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8, DemuxError> {
        if self.remaining() < 1 {
            return Err(DemuxError::MalformedSection("truncated section"));
        }
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    /// Read a big-endian 16-bit field.
    pub fn read_u16(&mut self) -> Result<u16, DemuxError> {
        if self.remaining() < 2 {
            return Err(DemuxError::MalformedSection("truncated section"));
        }
        let v = ((self.data[self.pos] as u16) << 8) | self.data[self.pos + 1] as u16;
        self.pos += 2;
        Ok(v)
    }

    /// Read a 16-bit field masked to its low 13 bits (a PID).
    pub fn read_pid(&mut self) -> Result<u16, DemuxError> {
        Ok(self.read_u16()? & crate::pid::MASK)
    }

    /// Read a 16-bit field masked to its low 12 bits (a length).
    pub fn read_len12(&mut self) -> Result<u16, DemuxError> {
        Ok(self.read_u16()? & 0x0FFF)
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<(), DemuxError> {
        if self.remaining() < n {
            return Err(DemuxError::MalformedSection("truncated section"));
        }
        self.pos += n;
        Ok(())
    }

    /// Take the next `n` bytes as a slice.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DemuxError> {
        if self.remaining() < n {
            return Err(DemuxError::MalformedSection("truncated section"));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
}

/// Decoded long-form PSI section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    /// Table ID.
    pub table_id: u8,
    /// Section length (12 bits, bytes following the length field).
    pub section_length: u16,
    /// Table ID extension (program_number for PMT, TSID for PAT).
    pub table_id_extension: u16,
    /// Version number (5 bits).
    pub version_number: u8,
    /// Current/next indicator.
    pub current_next_indicator: bool,
    /// Section number.
    pub section_number: u8,
    /// Last section number.
    pub last_section_number: u8,
}

impl SectionHeader {
    /// Decode a long-form section header and return it with the section
    /// body (bytes between the fixed header and the CRC-32).
    ///
    /// PAT/PMT/CAT are long-form tables: `section_syntax_indicator`
    /// must be 1 and the section carries a 4-byte CRC trailer. Any
    /// violation of the framing is [`DemuxError::MalformedSection`].
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), DemuxError> {
        let mut r = SectionReader::new(data);
        let table_id = r.read_u8()?;
        let len_field = r.read_u16()?;
        if len_field & 0x8000 == 0 {
            return Err(DemuxError::MalformedSection(
                "section_syntax_indicator not set",
            ));
        }
        let section_length = len_field & 0x0FFF;
        if section_length > MAX_SECTION_LENGTH {
            return Err(DemuxError::MalformedSection("section_length exceeds 4093"));
        }
        // long header (5 bytes) + CRC (4 bytes)
        if section_length < 9 {
            return Err(DemuxError::MalformedSection("section_length too small"));
        }
        let total = 3 + section_length as usize;
        if data.len() < total {
            return Err(DemuxError::MalformedSection("truncated section"));
        }

        let table_id_extension = r.read_u16()?;
        let flags = r.read_u8()?;
        let version_number = (flags & 0x3E) >> 1;
        let current_next_indicator = flags & 0x01 != 0;
        let section_number = r.read_u8()?;
        let last_section_number = r.read_u8()?;

        let body = &data[8..total - 4];
        Ok((
            Self {
                table_id,
                section_length,
                table_id_extension,
                version_number,
                current_next_indicator,
                section_number,
                last_section_number,
            },
            body,
        ))
    }

    /// Total section size including the 3-byte prefix.
    pub fn total_length(&self) -> usize {
        3 + self.section_length as usize
    }
}

/// Reassembles sections that span multiple TS packets on one PID.
#[derive(Debug, Default)]
pub struct SectionAssembler {
    buffer: Vec<u8>,
    expected_length: Option<usize>,
    last_cc: Option<u8>,
}

impl SectionAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partially collected section.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.expected_length = None;
        self.last_cc = None;
    }

    /// Add one TS packet payload.
    ///
    /// Returns `true` once a complete section is buffered.
    pub fn push(&mut self, payload: &[u8], cc: u8, payload_unit_start: bool) -> bool {
        if let Some(last) = self.last_cc {
            let expected = (last + 1) & 0x0F;
            if cc != expected && !payload_unit_start {
                // Discontinuity mid-section: the partial data is garbage.
                self.clear();
            }
        }
        self.last_cc = Some(cc);

        if payload_unit_start {
            if payload.is_empty() {
                return false;
            }
            let pointer = payload[0] as usize;
            let start = pointer + 1;
            if start >= payload.len() {
                return false;
            }
            self.buffer.clear();
            self.buffer.extend_from_slice(&payload[start..]);
            self.expected_length = None;
            if self.buffer.len() >= 3 {
                let section_length =
                    ((self.buffer[1] as usize & 0x0F) << 8) | self.buffer[2] as usize;
                self.expected_length = Some(3 + section_length);
            }
        } else if !self.buffer.is_empty() {
            self.buffer.extend_from_slice(payload);
        }

        matches!(self.expected_length, Some(len) if self.buffer.len() >= len)
    }

    /// Take the completed section out of the assembler, if any.
    pub fn take_section(&mut self) -> Option<Vec<u8>> {
        let len = self.expected_length.filter(|&l| self.buffer.len() >= l)?;
        let section = self.buffer[..len].to_vec();
        self.buffer.clear();
        self.expected_length = None;
        Some(section)
    }
}

/// Calculate CRC-32 for MPEG-2 (polynomial 0x04C11DB7).
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    static CRC_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = (i as u32) << 24;
            let mut j = 0;
            while j < 8 {
                if crc & 0x8000_0000 != 0 {
                    crc = (crc << 1) ^ 0x04C1_1DB7;
                } else {
                    crc <<= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let index = ((crc >> 24) ^ byte as u32) as usize;
        crc = (crc << 8) ^ CRC_TABLE[index];
    }
    crc
}

/// Validate the CRC-32 trailer of a complete section.
pub fn validate_section_crc(section: &[u8]) -> bool {
    if section.len() < 4 {
        return false;
    }
    crc32_mpeg2(section) == 0
}
