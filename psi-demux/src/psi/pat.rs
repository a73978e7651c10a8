//! PAT (Program Association Table) decoding.
//!
//! The PAT is carried on PID 0x0000 and maps program numbers to PMT
//! PIDs. Entry 0 points at the network PID and is skipped.

use crate::error::DemuxError;
use crate::section::{SectionHeader, SectionReader};
use crate::table_id;

/// One program entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatProgram {
    /// Program number (service id), never 0.
    pub program_number: u16,
    /// PID of this program's PMT (13 bits).
    pub pmt_pid: u16,
}

/// Decoded PAT section.
#[derive(Debug, Clone)]
pub struct PatSection {
    /// Transport stream id.
    pub transport_stream_id: u16,
    /// Table version (5 bits).
    pub version_number: u8,
    /// Current/next indicator.
    pub current_next: bool,
    /// Programs, in wire order. May be empty.
    pub programs: Vec<PatProgram>,
}

impl PatSection {
    /// Decode a complete PAT section.
    pub fn parse(section: &[u8]) -> Result<Self, DemuxError> {
        let (header, body) = SectionHeader::parse(section)?;
        if header.table_id != table_id::PAT {
            return Err(DemuxError::MalformedSection("not a PAT section"));
        }

        let mut programs = Vec::new();
        let mut r = SectionReader::new(body);
        while r.remaining() >= 4 {
            let program_number = r.read_u16()?;
            let pid = r.read_pid()?;
            if program_number != 0 {
                programs.push(PatProgram {
                    program_number,
                    pmt_pid: pid,
                });
            }
        }

        Ok(Self {
            transport_stream_id: header.table_id_extension,
            version_number: header.version_number,
            current_next: header.current_next_indicator,
            programs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::crc32_mpeg2;

    fn pat_section(version: u8, entries: &[(u16, u16)]) -> Vec<u8> {
        let mut body = Vec::new();
        for &(num, pid) in entries {
            body.extend_from_slice(&num.to_be_bytes());
            body.extend_from_slice(&(0xE000 | pid).to_be_bytes());
        }
        let section_length = 5 + body.len() + 4;
        let mut s = vec![
            0x00,
            0xB0 | ((section_length >> 8) as u8 & 0x0F),
            (section_length & 0xFF) as u8,
            0x12,
            0x34,
            0xC0 | (version << 1) | 0x01,
            0,
            0,
        ];
        s.extend_from_slice(&body);
        let crc = crc32_mpeg2(&s);
        s.extend_from_slice(&crc.to_be_bytes());
        s
    }

    #[test]
    fn test_parse_pat() {
        let section = pat_section(1, &[(0x0101, 0x0100), (0x0102, 0x0200)]);
        let pat = PatSection::parse(&section).unwrap();
        assert_eq!(pat.transport_stream_id, 0x1234);
        assert_eq!(pat.version_number, 1);
        assert!(pat.current_next);
        assert_eq!(pat.programs.len(), 2);
        assert_eq!(pat.programs[0].program_number, 0x0101);
        assert_eq!(pat.programs[0].pmt_pid, 0x0100);
        assert_eq!(pat.programs[1].pmt_pid, 0x0200);
    }

    #[test]
    fn test_network_entry_skipped() {
        let section = pat_section(0, &[(0x0000, 0x0010), (0x0001, 0x0020)]);
        let pat = PatSection::parse(&section).unwrap();
        assert_eq!(pat.programs.len(), 1);
        assert_eq!(pat.programs[0].pmt_pid, 0x0020);
    }

    #[test]
    fn test_empty_pat() {
        let section = pat_section(0, &[]);
        let pat = PatSection::parse(&section).unwrap();
        assert!(pat.programs.is_empty());
    }

    #[test]
    fn test_wrong_table_id() {
        let mut section = pat_section(0, &[(1, 0x20)]);
        section[0] = 0x02;
        assert!(matches!(
            PatSection::parse(&section),
            Err(DemuxError::MalformedSection(_))
        ));
    }
}
