//! Program data model.
//!
//! [`ProgramInfo`] is the externally visible picture of one selected
//! program: which PIDs carry which codecs, and the conditional-access
//! parameters needed to descramble them. It starts empty when parsing
//! begins and is mutated in place as PAT/PMT/CAT sections arrive.

/// Cap on stored private CA data from the program-level CA descriptor.
pub const MAX_CA_PRIVATE_LEN: usize = 256;

/// Broad classification of an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Other,
}

/// Codec of an elementary stream, mapped from PMT stream_type or, for
/// private PES streams, from descriptor tags / registration format
/// identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCodec {
    Mpeg1Video,
    Mpeg2Video,
    Mpeg4Video,
    H264,
    H265,
    Mpeg1Audio,
    Mpeg2Audio,
    Aac,
    AacLatm,
    Ac3,
    Eac3,
    DvbSubtitle,
}

impl StreamCodec {
    /// Map a PMT stream_type to a codec. Returns `None` for types that
    /// need descriptor-based resolution (e.g. 0x06 private PES).
    pub fn from_stream_type(stream_type: u8) -> Option<Self> {
        match stream_type {
            0x01 => Some(Self::Mpeg1Video),
            0x02 => Some(Self::Mpeg2Video),
            0x10 => Some(Self::Mpeg4Video),
            0x1B => Some(Self::H264),
            0x24 => Some(Self::H265),
            0x03 => Some(Self::Mpeg1Audio),
            0x04 => Some(Self::Mpeg2Audio),
            0x0F => Some(Self::Aac),
            0x11 => Some(Self::AacLatm),
            0x81 => Some(Self::Ac3),
            0x87 => Some(Self::Eac3),
            _ => None,
        }
    }

    /// Map a registration descriptor format identifier to a codec.
    pub fn from_format_identifier(fourcc: [u8; 4]) -> Option<Self> {
        match &fourcc {
            b"AC-3" => Some(Self::Ac3),
            b"EC-3" => Some(Self::Eac3),
            b"HEVC" => Some(Self::H265),
            _ => None,
        }
    }

    /// Classification of this codec.
    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Mpeg1Video | Self::Mpeg2Video | Self::Mpeg4Video | Self::H264 | Self::H265 => {
                StreamKind::Video
            }
            Self::Mpeg1Audio
            | Self::Mpeg2Audio
            | Self::Aac
            | Self::AacLatm
            | Self::Ac3
            | Self::Eac3 => StreamKind::Audio,
            Self::DvbSubtitle => StreamKind::Subtitle,
        }
    }

    /// Human-readable codec name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mpeg1Video => "MPEG-1 Video",
            Self::Mpeg2Video => "MPEG-2 Video",
            Self::Mpeg4Video => "MPEG-4 Video",
            Self::H264 => "H.264/AVC",
            Self::H265 => "H.265/HEVC",
            Self::Mpeg1Audio => "MPEG-1 Audio",
            Self::Mpeg2Audio => "MPEG-2 Audio",
            Self::Aac => "AAC (ADTS)",
            Self::AacLatm => "AAC (LATM)",
            Self::Ac3 => "AC-3",
            Self::Eac3 => "E-AC-3",
            Self::DvbSubtitle => "DVB Subtitle",
        }
    }
}

/// One elementary stream of the selected program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsStream {
    /// Elementary PID.
    pub pid: u16,
    /// Raw PMT stream_type.
    pub stream_type: u8,
    /// Resolved codec, if the lookup succeeded.
    pub codec: Option<StreamCodec>,
    /// DVB subtitle composition page id.
    pub composition_page_id: Option<u16>,
    /// DVB subtitle ancillary page id.
    pub ancillary_page_id: Option<u16>,
}

impl EsStream {
    /// Classification of this stream.
    pub fn kind(&self) -> StreamKind {
        match self.codec {
            Some(codec) => codec.kind(),
            None => StreamKind::Other,
        }
    }
}

/// Scrambling parameters, from the scrambling-mode descriptor and the
/// private part of CA descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrambleInfo {
    /// Scrambling algorithm identifier.
    pub algorithm: Option<u8>,
    /// Cipher mode.
    pub mode: Option<u8>,
    /// Block alignment.
    pub alignment: Option<u8>,
    /// Initialization vector, when the CA system carries one inline.
    pub iv: Option<Vec<u8>>,
}

/// The current, possibly partial picture of one selected program.
#[derive(Debug, Clone, Default)]
pub struct ProgramInfo {
    /// Program number (service id) of the selected program.
    pub program_number: Option<u16>,
    /// PID carrying the program's PMT.
    pub pmt_pid: Option<u16>,
    /// PCR PID.
    pub pcr_pid: Option<u16>,

    /// Conditional-access system id.
    pub ca_system_id: Option<u32>,
    /// Stream-wide EMM PID (from the CAT).
    pub emm_pid: Option<u16>,
    /// Whether the program carries CA descriptors at all.
    pub scrambled: bool,
    /// Scrambling parameters.
    pub scramble_info: ScrambleInfo,
    /// ECM PID for the video component.
    pub ecm_pid_video: Option<u16>,
    /// ECM PID for the audio component.
    pub ecm_pid_audio: Option<u16>,
    /// ECM PID for the subtitle component.
    pub ecm_pid_subtitle: Option<u16>,
    /// Private CA data from the program-level CA descriptor, capped at
    /// [`MAX_CA_PRIVATE_LEN`] bytes.
    pub ca_private: Vec<u8>,

    /// Primary (first discovered) video stream.
    pub video: Option<EsStream>,
    /// Primary audio stream.
    pub audio: Option<EsStream>,
    /// Primary subtitle stream.
    pub subtitle: Option<EsStream>,
    /// All video streams, in PMT discovery order.
    pub videos: Vec<EsStream>,
    /// All audio streams.
    pub audios: Vec<EsStream>,
    /// All subtitle streams.
    pub subtitles: Vec<EsStream>,
}

impl ProgramInfo {
    /// Whether any ECM PID slot is populated.
    pub fn has_ecm(&self) -> bool {
        self.ecm_pid_video.is_some()
            || self.ecm_pid_audio.is_some()
            || self.ecm_pid_subtitle.is_some()
    }

    /// Completeness predicate gating the `ProgramParsed` notification:
    /// an A/V PID has been found, and if the program is scrambled, at
    /// least one ECM or EMM PID is known.
    pub fn is_complete(&self) -> bool {
        let has_av = self.video.is_some() || self.audio.is_some();
        let ca_ready = !self.scrambled || self.has_ecm() || self.emm_pid.is_some();
        has_av && ca_ready
    }

    /// Fill every still-empty ECM slot with `pid` (program-level CA
    /// descriptor applies to all components).
    pub fn fill_ecm_slots(&mut self, pid: u16) {
        if self.ecm_pid_video.is_none() {
            self.ecm_pid_video = Some(pid);
        }
        if self.ecm_pid_audio.is_none() {
            self.ecm_pid_audio = Some(pid);
        }
        if self.ecm_pid_subtitle.is_none() {
            self.ecm_pid_subtitle = Some(pid);
        }
    }

    /// Set the ECM slot for one component kind (per-stream CA
    /// descriptor overrides the program-level value).
    pub fn set_ecm_slot(&mut self, kind: StreamKind, pid: u16) {
        match kind {
            StreamKind::Video => self.ecm_pid_video = Some(pid),
            StreamKind::Audio => self.ecm_pid_audio = Some(pid),
            StreamKind::Subtitle => self.ecm_pid_subtitle = Some(pid),
            StreamKind::Other => {}
        }
    }

    /// Store private CA data, truncating to the cap.
    pub fn set_ca_private(&mut self, data: &[u8]) {
        let len = data.len().min(MAX_CA_PRIVATE_LEN);
        self.ca_private = data[..len].to_vec();
    }

    /// Replace the elementary-stream picture from a fresh PMT decode.
    pub fn set_streams(&mut self, streams: Vec<EsStream>) {
        self.videos.clear();
        self.audios.clear();
        self.subtitles.clear();
        self.video = None;
        self.audio = None;
        self.subtitle = None;
        for stream in streams {
            match stream.kind() {
                StreamKind::Video => {
                    if self.video.is_none() {
                        self.video = Some(stream.clone());
                    }
                    self.videos.push(stream);
                }
                StreamKind::Audio => {
                    if self.audio.is_none() {
                        self.audio = Some(stream.clone());
                    }
                    self.audios.push(stream);
                }
                StreamKind::Subtitle => {
                    if self.subtitle.is_none() {
                        self.subtitle = Some(stream.clone());
                    }
                    self.subtitles.push(stream);
                }
                StreamKind::Other => {}
            }
        }
    }
}

/// Representative PID-change pair between two PMT revisions.
///
/// `old` and `new` are the elementary PIDs of the previous and current
/// stream loops in discovery order. Reports the first PID present only
/// in `old` paired with the first present only in `new`; when either
/// side is empty (pure add or pure removal) there is no pair to report.
pub fn first_changed_pair(old: &[u16], new: &[u16]) -> Option<(u16, u16)> {
    let old_only = old.iter().find(|pid| !new.contains(pid))?;
    let new_only = new.iter().find(|pid| !old.contains(pid))?;
    Some((*old_only, *new_only))
}
