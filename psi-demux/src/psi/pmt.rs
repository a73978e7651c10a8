//! PMT (Program Map Table) decoding.
//!
//! The PMT describes one program: its PCR PID, program-level
//! descriptors (conditional access, scrambling mode) and the
//! elementary-stream loop with per-stream descriptors.

use crate::descriptor_tag;
use crate::error::DemuxError;
use crate::program::{ScrambleInfo, StreamCodec};
use crate::psi::descriptors::{
    parse_format_identifier, parse_scrambling_mode, parse_subtitling_pages, CaDescriptor,
    DescriptorIterator,
};
use crate::section::{SectionHeader, SectionReader};
use crate::table_id;

/// One entry of the elementary-stream loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    /// Raw stream_type.
    pub stream_type: u8,
    /// Elementary PID (13 bits).
    pub elementary_pid: u16,
    /// Resolved codec: stream_type lookup first, then descriptor tags
    /// and the registration format identifier for private PES types.
    pub codec: Option<StreamCodec>,
    /// Per-stream ECM PID from a stream-level CA descriptor.
    pub ecm_pid: Option<u16>,
    /// Scrambling parameters from the stream-level CA descriptor
    /// private bytes.
    pub scramble_info: Option<ScrambleInfo>,
    /// DVB subtitle composition page id.
    pub composition_page_id: Option<u16>,
    /// DVB subtitle ancillary page id.
    pub ancillary_page_id: Option<u16>,
}

/// Decoded PMT section.
#[derive(Debug, Clone)]
pub struct PmtSection {
    /// Program number (service id).
    pub program_number: u16,
    /// Table version (5 bits).
    pub version_number: u8,
    /// Current/next indicator.
    pub current_next: bool,
    /// PCR PID.
    pub pcr_pid: u16,
    /// CA system id from the program-level CA descriptor.
    pub ca_system_id: Option<u16>,
    /// ECM PID from the program-level CA descriptor.
    pub ecm_pid: Option<u16>,
    /// Scrambling parameters from program-level descriptors.
    pub scramble_info: Option<ScrambleInfo>,
    /// Private bytes of the program-level CA descriptor.
    pub ca_private: Vec<u8>,
    /// Elementary streams, in wire order.
    pub streams: Vec<PmtStream>,
}

impl PmtSection {
    /// Decode a complete PMT section.
    pub fn parse(section: &[u8]) -> Result<Self, DemuxError> {
        let (header, body) = SectionHeader::parse(section)?;
        if header.table_id != table_id::PMT {
            return Err(DemuxError::MalformedSection("not a PMT section"));
        }

        let mut r = SectionReader::new(body);
        let pcr_pid = r.read_pid()?;
        let program_info_length = r.read_len12()? as usize;
        let program_info = r.take(program_info_length)?;

        let mut pmt = Self {
            program_number: header.table_id_extension,
            version_number: header.version_number,
            current_next: header.current_next_indicator,
            pcr_pid,
            ca_system_id: None,
            ecm_pid: None,
            scramble_info: None,
            ca_private: Vec::new(),
            streams: Vec::new(),
        };

        for (tag, payload) in DescriptorIterator::new(program_info) {
            match tag {
                descriptor_tag::CA => {
                    let ca = CaDescriptor::parse(payload)?;
                    pmt.ca_system_id = Some(ca.ca_system_id);
                    pmt.ecm_pid = Some(ca.ca_pid);
                    if let Some(info) = ca.scramble_info() {
                        pmt.scramble_info = Some(info);
                    }
                    pmt.ca_private = ca.private;
                }
                descriptor_tag::SCRAMBLING_MODE => {
                    if let Some(mode) = parse_scrambling_mode(payload) {
                        let info = pmt.scramble_info.get_or_insert_with(ScrambleInfo::default);
                        info.mode = Some(mode);
                    }
                }
                _ => {}
            }
        }

        while r.remaining() >= 5 {
            let stream_type = r.read_u8()?;
            let elementary_pid = r.read_pid()?;
            let es_info_length = r.read_len12()? as usize;
            let es_info = r.take(es_info_length)?;
            pmt.streams
                .push(parse_stream(stream_type, elementary_pid, es_info)?);
        }

        Ok(pmt)
    }
}

fn parse_stream(
    stream_type: u8,
    elementary_pid: u16,
    es_info: &[u8],
) -> Result<PmtStream, DemuxError> {
    let mut stream = PmtStream {
        stream_type,
        elementary_pid,
        codec: StreamCodec::from_stream_type(stream_type),
        ecm_pid: None,
        scramble_info: None,
        composition_page_id: None,
        ancillary_page_id: None,
    };

    for (tag, payload) in DescriptorIterator::new(es_info) {
        match tag {
            descriptor_tag::CA => {
                let ca = CaDescriptor::parse(payload)?;
                stream.ecm_pid = Some(ca.ca_pid);
                if let Some(info) = ca.scramble_info() {
                    stream.scramble_info = Some(info);
                }
            }
            descriptor_tag::DVB_SUBTITLING => {
                if let Some((composition, ancillary)) = parse_subtitling_pages(payload) {
                    stream.composition_page_id = Some(composition);
                    stream.ancillary_page_id = Some(ancillary);
                }
                if stream.codec.is_none() {
                    stream.codec = Some(StreamCodec::DvbSubtitle);
                }
            }
            descriptor_tag::AC3 => {
                if stream.codec.is_none() {
                    stream.codec = Some(StreamCodec::Ac3);
                }
            }
            descriptor_tag::ENHANCED_AC3 => {
                if stream.codec.is_none() {
                    stream.codec = Some(StreamCodec::Eac3);
                }
            }
            descriptor_tag::REGISTRATION => {
                if stream.codec.is_none() {
                    stream.codec =
                        parse_format_identifier(payload).and_then(StreamCodec::from_format_identifier);
                }
            }
            _ => {}
        }
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::crc32_mpeg2;

    fn pmt_section(
        program_number: u16,
        version: u8,
        current_next: bool,
        pcr_pid: u16,
        program_descriptors: &[u8],
        streams: &[(u8, u16, &[u8])],
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(0xE000 | pcr_pid).to_be_bytes());
        body.extend_from_slice(&(0xF000 | program_descriptors.len() as u16).to_be_bytes());
        body.extend_from_slice(program_descriptors);
        for &(stream_type, pid, es_info) in streams {
            body.push(stream_type);
            body.extend_from_slice(&(0xE000 | pid).to_be_bytes());
            body.extend_from_slice(&(0xF000 | es_info.len() as u16).to_be_bytes());
            body.extend_from_slice(es_info);
        }

        let section_length = 5 + body.len() + 4;
        let mut s = vec![
            0x02,
            0xB0 | ((section_length >> 8) as u8 & 0x0F),
            (section_length & 0xFF) as u8,
            (program_number >> 8) as u8,
            (program_number & 0xFF) as u8,
            0xC0 | (version << 1) | (current_next as u8),
            0,
            0,
        ];
        s.extend_from_slice(&body);
        let crc = crc32_mpeg2(&s);
        s.extend_from_slice(&crc.to_be_bytes());
        s
    }

    #[test]
    fn test_parse_basic_pmt() {
        let section = pmt_section(
            1,
            0,
            true,
            0x101,
            &[],
            &[(0x1B, 0x101, &[]), (0x0F, 0x102, &[])],
        );
        let pmt = PmtSection::parse(&section).unwrap();
        assert_eq!(pmt.program_number, 1);
        assert_eq!(pmt.pcr_pid, 0x101);
        assert!(pmt.current_next);
        assert_eq!(pmt.streams.len(), 2);
        assert_eq!(pmt.streams[0].codec, Some(StreamCodec::H264));
        assert_eq!(pmt.streams[1].codec, Some(StreamCodec::Aac));
        assert!(pmt.ca_system_id.is_none());
    }

    #[test]
    fn test_program_level_ca_descriptor() {
        let ca_desc = [0x09, 0x04, 0x06, 0x02, 0xE0, 0x50];
        let section = pmt_section(1, 0, true, 0x101, &ca_desc, &[(0x1B, 0x101, &[])]);
        let pmt = PmtSection::parse(&section).unwrap();
        assert_eq!(pmt.ca_system_id, Some(0x0602));
        assert_eq!(pmt.ecm_pid, Some(0x0050));
    }

    #[test]
    fn test_stream_level_ca_descriptor() {
        let es_ca = [0x09, 0x04, 0x06, 0x02, 0xE0, 0x51];
        let section = pmt_section(1, 0, true, 0x101, &[], &[(0x0F, 0x102, &es_ca)]);
        let pmt = PmtSection::parse(&section).unwrap();
        assert_eq!(pmt.streams[0].ecm_pid, Some(0x0051));
    }

    #[test]
    fn test_dvb_subtitle_stream() {
        let sub_desc = [
            0x59, 0x08, b'e', b'n', b'g', 0x10, 0x00, 0x01, 0x00, 0x02,
        ];
        let section = pmt_section(1, 0, true, 0x101, &[], &[(0x06, 0x103, &sub_desc)]);
        let pmt = PmtSection::parse(&section).unwrap();
        let s = &pmt.streams[0];
        assert_eq!(s.codec, Some(StreamCodec::DvbSubtitle));
        assert_eq!(s.composition_page_id, Some(1));
        assert_eq!(s.ancillary_page_id, Some(2));
    }

    #[test]
    fn test_registration_descriptor_resolves_private_stream() {
        let reg = [0x05, 0x04, b'A', b'C', b'-', b'3'];
        let section = pmt_section(1, 0, true, 0x101, &[], &[(0x06, 0x104, &reg)]);
        let pmt = PmtSection::parse(&section).unwrap();
        assert_eq!(pmt.streams[0].codec, Some(StreamCodec::Ac3));
    }

    #[test]
    fn test_scrambling_mode_descriptor() {
        let desc = [0x65, 0x01, 0x02];
        let section = pmt_section(1, 0, true, 0x101, &desc, &[(0x1B, 0x101, &[])]);
        let pmt = PmtSection::parse(&section).unwrap();
        assert_eq!(pmt.scramble_info.unwrap().mode, Some(0x02));
    }

    #[test]
    fn test_current_next_zero_is_decoded() {
        let section = pmt_section(1, 2, false, 0x101, &[], &[(0x1B, 0x101, &[])]);
        let pmt = PmtSection::parse(&section).unwrap();
        assert!(!pmt.current_next);
        assert_eq!(pmt.version_number, 2);
    }
}
