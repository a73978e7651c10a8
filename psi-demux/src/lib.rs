//! PID-keyed section demultiplexer and MPEG-TS PSI parser.
//!
//! This library is the program-discovery core of a set-top-box media
//! pipeline. Raw PSI/SI sections arrive per PID from an external
//! demultiplexer (hardware or software), fan out through channels and
//! filters, and drive a table state machine that maintains a
//! de-duplicated, versioned [`ProgramInfo`] model of the selected
//! program: its elementary PIDs, codecs and conditional-access
//! parameters.
//!
//! # Supported tables
//! - PAT (Program Association Table) - PID 0x0000
//! - PMT (Program Map Table) - variable PIDs from PAT
//! - CAT (Conditional Access Table) - PID 0x0001
//! - ECM sections - variable PIDs from CA descriptors (forwarded raw)
//!
//! # Usage
//! ```ignore
//! use std::sync::Arc;
//! use psi_demux::{ChannelRegistry, MemorySource, PsiParser};
//!
//! let source = MemorySource::new();
//! let registry = ChannelRegistry::new(source.clone());
//! source.connect(&registry);
//!
//! let parser = PsiParser::new(registry);
//! parser.open()?;
//! source.feed(&ts_bytes);
//! parser.wait(std::time::Duration::from_secs(3))?;
//! if let Some(info) = parser.program_info() {
//!     println!("video PID {:?}", info.video.map(|s| s.pid));
//! }
//! parser.close();
//! ```

mod backend;
mod channel;
mod error;
mod packet;
mod parser;
mod program;
mod psi;
mod section;
mod source;

pub use backend::{BackendChannelId, DemuxBackend};
pub use channel::{ChannelRegistry, SectionCallback, SectionChannel, SectionFilter, SectionSink};
pub use error::{DemuxError, WaitError};
pub use packet::{TsHeader, TsPacket, TsPacketIterator, SYNC_BYTE, TS_PACKET_SIZE};
pub use parser::{EventCallback, ProgramEvent, PsiParser};
pub use program::{EsStream, ProgramInfo, ScrambleInfo, StreamCodec, StreamKind};
pub use psi::{CaDescriptor, CatSection, PatSection, PmtSection, PmtStream};
pub use section::{crc32_mpeg2, SectionAssembler, SectionHeader, SectionReader};
pub use source::MemorySource;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DemuxError>;

/// Well-known PIDs in MPEG-TS.
pub mod pid {
    /// Program Association Table PID.
    pub const PAT: u16 = 0x0000;
    /// Conditional Access Table PID.
    pub const CAT: u16 = 0x0001;
    /// Null packet PID (stuffing).
    pub const NULL: u16 = 0x1FFF;
    /// Mask for the 13-bit PID field.
    pub const MASK: u16 = 0x1FFF;
}

/// Table IDs for PSI sections.
pub mod table_id {
    /// Program Association Section.
    pub const PAT: u8 = 0x00;
    /// Conditional Access Section.
    pub const CAT: u8 = 0x01;
    /// Program Map Section.
    pub const PMT: u8 = 0x02;
}

/// Descriptor tags used in PMT/CAT descriptor loops.
pub mod descriptor_tag {
    /// Conditional access descriptor (ca_system_id + ECM/EMM PID).
    pub const CA: u8 = 0x09;
    /// Registration descriptor (4-byte format identifier).
    pub const REGISTRATION: u8 = 0x05;
    /// DVB subtitling descriptor (composition/ancillary page ids).
    pub const DVB_SUBTITLING: u8 = 0x59;
    /// AC-3 descriptor (DVB).
    pub const AC3: u8 = 0x6A;
    /// Enhanced AC-3 descriptor (DVB).
    pub const ENHANCED_AC3: u8 = 0x7A;
    /// Scrambling-mode descriptor.
    pub const SCRAMBLING_MODE: u8 = 0x65;
}
