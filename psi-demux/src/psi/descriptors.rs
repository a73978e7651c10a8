//! Descriptor parsing for PMT/CAT descriptor loops.

use crate::error::DemuxError;
use crate::program::ScrambleInfo;

/// Iterator over `(tag, payload)` pairs of a descriptor loop.
///
/// A descriptor whose declared length overruns the loop terminates
/// iteration; the remainder is treated as garbage rather than failing
/// the whole section.
pub struct DescriptorIterator<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> DescriptorIterator<'a> {
    /// Iterate the descriptor loop in `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> Iterator for DescriptorIterator<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + 2 > self.data.len() {
            return None;
        }
        let tag = self.data[self.offset];
        let len = self.data[self.offset + 1] as usize;
        let start = self.offset + 2;
        if start + len > self.data.len() {
            return None;
        }
        self.offset = start + len;
        Some((tag, &self.data[start..start + len]))
    }
}

/// Conditional access descriptor (tag 0x09).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaDescriptor {
    /// CA system identifier.
    pub ca_system_id: u16,
    /// ECM PID (program/ES level) or EMM PID (CAT level), 13 bits.
    pub ca_pid: u16,
    /// Private bytes following the fixed fields.
    pub private: Vec<u8>,
}

impl CaDescriptor {
    /// Parse the descriptor payload (after tag and length).
    pub fn parse(data: &[u8]) -> Result<Self, DemuxError> {
        if data.len() < 4 {
            return Err(DemuxError::MalformedSection("CA descriptor too short"));
        }
        let ca_system_id = ((data[0] as u16) << 8) | data[1] as u16;
        let ca_pid = (((data[2] & 0x1F) as u16) << 8) | data[3] as u16;
        Ok(Self {
            ca_system_id,
            ca_pid,
            private: data[4..].to_vec(),
        })
    }

    /// Decode scrambling parameters from the private bytes, when the CA
    /// system carries them inline (descriptor length > 4).
    pub fn scramble_info(&self) -> Option<ScrambleInfo> {
        if self.private.len() < 3 {
            return None;
        }
        let iv = &self.private[3..];
        Some(ScrambleInfo {
            algorithm: Some(self.private[0]),
            mode: Some(self.private[1]),
            alignment: Some(self.private[2]),
            iv: if iv.is_empty() { None } else { Some(iv.to_vec()) },
        })
    }
}

/// DVB subtitling descriptor (tag 0x59) page ids, first entry only.
pub fn parse_subtitling_pages(data: &[u8]) -> Option<(u16, u16)> {
    // entries are 8 bytes: language(3) type(1) composition(2) ancillary(2)
    if data.len() < 8 {
        return None;
    }
    let composition = ((data[4] as u16) << 8) | data[5] as u16;
    let ancillary = ((data[6] as u16) << 8) | data[7] as u16;
    Some((composition, ancillary))
}

/// Registration descriptor (tag 0x05) format identifier.
pub fn parse_format_identifier(data: &[u8]) -> Option<[u8; 4]> {
    data.get(..4).map(|b| [b[0], b[1], b[2], b[3]])
}

/// Scrambling-mode descriptor (tag 0x65).
pub fn parse_scrambling_mode(data: &[u8]) -> Option<u8> {
    data.first().copied()
}
