//! CAT (Conditional Access Table) decoding.
//!
//! The CAT is carried on PID 0x0001; its CA descriptors identify the
//! stream-wide CA system and the EMM PID.

use crate::descriptor_tag;
use crate::error::DemuxError;
use crate::psi::descriptors::{CaDescriptor, DescriptorIterator};
use crate::section::SectionHeader;
use crate::table_id;

/// Decoded CAT section.
#[derive(Debug, Clone)]
pub struct CatSection {
    /// Table version (5 bits).
    pub version_number: u8,
    /// CA system identifier, when a CA descriptor is present.
    pub ca_system_id: Option<u16>,
    /// EMM PID, when a CA descriptor is present.
    pub emm_pid: Option<u16>,
}

impl CatSection {
    /// Decode a complete CAT section.
    pub fn parse(section: &[u8]) -> Result<Self, DemuxError> {
        let (header, body) = SectionHeader::parse(section)?;
        if header.table_id != table_id::CAT {
            return Err(DemuxError::MalformedSection("not a CAT section"));
        }

        let mut cat = Self {
            version_number: header.version_number,
            ca_system_id: None,
            emm_pid: None,
        };

        // The CAT body is one descriptor loop.
        for (tag, payload) in DescriptorIterator::new(body) {
            if tag == descriptor_tag::CA {
                let ca = CaDescriptor::parse(payload)?;
                cat.ca_system_id = Some(ca.ca_system_id);
                cat.emm_pid = Some(ca.ca_pid);
            }
        }

        Ok(cat)
    }
}
