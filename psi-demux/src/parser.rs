//! PSI parser state machine.
//!
//! `PsiParser` drives program discovery: `open()` registers PAT and CAT
//! filters, the PAT opens one PMT filter per program, PMTs populate the
//! [`ProgramInfo`] aggregate (and open one-shot ECM filters for
//! scrambled programs), and the consumer is notified through discrete
//! [`ProgramEvent`]s. A caller thread can block in [`PsiParser::wait`]
//! until the program picture is complete.
//!
//! All decode-and-update steps run under one state mutex. Backend and
//! registry calls, event callbacks and condvar waits happen outside it,
//! so delivery threads for different PIDs never block each other on
//! external work and teardown cannot deadlock against an in-flight
//! delivery.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};

use crate::channel::{ChannelRegistry, SectionChannel, SectionFilter};
use crate::error::{DemuxError, WaitError};
use crate::pid;
use crate::program::{EsStream, ProgramInfo, ScrambleInfo, StreamKind};
use crate::psi::{CatSection, PatSection, PmtSection};

/// Discrete notifications emitted to the consumer callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgramEvent {
    /// The selected program's picture became complete.
    ProgramParsed {
        /// Program number of the selected program.
        program_number: u16,
    },
    /// A later PMT revision replaced one elementary PID with another.
    AvPidChanged {
        /// PID present only in the previous revision.
        old_pid: u16,
        /// PID present only in the new revision.
        new_pid: u16,
    },
    /// Raw ECM section bytes, forwarded verbatim for an external CA
    /// engine.
    EcmData {
        /// PID the ECM arrived on.
        pid: u16,
        /// Unparsed section bytes.
        data: Bytes,
    },
}

/// Consumer event callback.
pub type EventCallback = Arc<dyn Fn(&ProgramEvent) + Send + Sync>;

/// How the target program is chosen among the programs in the PAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgramSelector {
    /// No hint: the first program in the PAT becomes the target.
    First,
    /// Match by program number.
    ByNumber(u16),
    /// Match the first PMT containing one of the requested A/V PIDs.
    ByAvPids {
        video: Option<u16>,
        audio: Option<u16>,
    },
}

/// A filter/channel pair opened by the parser, kept for teardown.
struct OpenedFilter {
    filter: Arc<SectionFilter>,
    channel: Arc<SectionChannel>,
}

/// Cached per-PMT-PID table state, diffed against future revisions.
struct PmtState {
    program_number: u16,
    version_number: u8,
    /// Elementary PIDs in discovery order.
    stream_pids: Vec<u16>,
}

#[derive(Default)]
struct ParserState {
    target_program: Option<u16>,
    selected_pmt_pid: Option<u16>,
    pat_handled: bool,
    pmt_states: HashMap<u16, PmtState>,
    /// ECM PIDs for which a filter has already been opened. Only ever
    /// grows: ECM filters stay open for the parser's lifetime.
    ecm_pids: HashSet<u16>,
    program: ProgramInfo,
    complete_notified: bool,
    parse_done: bool,
    quit: bool,
    pat: Option<OpenedFilter>,
    cat: Option<OpenedFilter>,
    pmts: Vec<OpenedFilter>,
    ecms: Vec<OpenedFilter>,
}

/// The PSI protocol state machine.
pub struct PsiParser {
    registry: Arc<ChannelRegistry>,
    selector: Mutex<ProgramSelector>,
    state: Mutex<ParserState>,
    cond: Condvar,
    event_cb: Mutex<Option<EventCallback>>,
    self_weak: Weak<PsiParser>,
}

impl PsiParser {
    /// Create a parser over `registry`.
    pub fn new(registry: Arc<ChannelRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry,
            selector: Mutex::new(ProgramSelector::First),
            state: Mutex::new(ParserState::default()),
            cond: Condvar::new(),
            event_cb: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    /// Register the consumer event callback.
    pub fn set_event_callback(&self, callback: EventCallback) {
        *self.event_cb.lock().unwrap() = Some(callback);
    }

    /// Target a program by its program number. Call before `open()`.
    pub fn select_program(&self, program_number: u16) {
        *self.selector.lock().unwrap() = ProgramSelector::ByNumber(program_number);
    }

    /// Target whichever program carries one of these A/V PIDs. Call
    /// before `open()`.
    pub fn select_av_pids(&self, video: Option<u16>, audio: Option<u16>) {
        *self.selector.lock().unwrap() = ProgramSelector::ByAvPids { video, audio };
    }

    /// Start parsing: registers the PAT filter on PID 0x0000 and the
    /// CAT filter on PID 0x0001.
    pub fn open(&self) -> Result<(), DemuxError> {
        {
            let state = self.state.lock().unwrap();
            if state.cat.is_some() {
                return Err(DemuxError::InvalidState("parser already open"));
            }
        }
        let pat = self.open_filter(pid::PAT, true, Self::on_pat)?;
        let cat = match self.open_filter(pid::CAT, true, Self::on_cat) {
            Ok(cat) => cat,
            Err(e) => {
                self.teardown_filter(pat);
                return Err(e);
            }
        };
        let mut state = self.state.lock().unwrap();
        state.pat = Some(pat);
        state.cat = Some(cat);
        info!("PSI parsing started (waiting for PAT)");
        Ok(())
    }

    /// Block until parsing finishes: the program picture is complete,
    /// or the PAT carried zero programs. A stream that never completes
    /// is reported as `TimedOut`; `signal_quit()`/`close()` wakes the
    /// wait with `QuitRequested`.
    pub fn wait(&self, timeout: Duration) -> Result<(), WaitError> {
        let state = self.state.lock().unwrap();
        let (state, _timeout_result) = self
            .cond
            .wait_timeout_while(state, timeout, |s| !s.parse_done && !s.quit)
            .unwrap();
        if state.parse_done {
            Ok(())
        } else if state.quit {
            Err(WaitError::QuitRequested)
        } else {
            Err(WaitError::TimedOut)
        }
    }

    /// Wake pending `wait()` calls with `QuitRequested`.
    pub fn signal_quit(&self) {
        let mut state = self.state.lock().unwrap();
        state.quit = true;
        self.cond.notify_all();
    }

    /// The program picture, once complete.
    pub fn program_info(&self) -> Option<ProgramInfo> {
        let state = self.state.lock().unwrap();
        if state.program.is_complete() {
            Some(state.program.clone())
        } else {
            None
        }
    }

    /// Stop parsing and release every filter and channel this parser
    /// opened. Safe to call from any thread, concurrently with
    /// in-flight deliveries; safe to call twice.
    pub fn close(&self) {
        let opened: Vec<OpenedFilter> = {
            let mut state = self.state.lock().unwrap();
            state.quit = true;
            self.cond.notify_all();
            let pmts: Vec<OpenedFilter> = state.pmts.drain(..).collect();
            state
                .pat
                .take()
                .into_iter()
                .chain(state.cat.take())
                .chain(pmts)
                .chain(state.ecms.drain(..))
                .collect()
        };
        for open in opened {
            self.teardown_filter(open);
        }
        debug!("PSI parser closed");
    }

    fn open_filter(
        &self,
        target_pid: u16,
        check_crc: bool,
        handler: fn(&PsiParser, u16, &Bytes),
    ) -> Result<OpenedFilter, DemuxError> {
        let channel = self.registry.create_channel(target_pid, check_crc)?;
        let weak = self.self_weak.clone();
        let filter = self.registry.create_filter(Arc::new(move |pid, data| {
            if let Some(parser) = weak.upgrade() {
                handler(&parser, pid, data);
            }
        }));
        self.registry.attach_filter(&filter, &channel)?;
        Ok(OpenedFilter { filter, channel })
    }

    fn teardown_filter(&self, open: OpenedFilter) {
        if let Err(e) = self.registry.detach_filter(&open.filter, &open.channel) {
            debug!("detach during teardown: {e}");
        }
        self.registry.destroy_filter(&open.filter);
        if let Err(e) = self.registry.destroy_channel(&open.channel) {
            // Another consumer may still hold filters on this PID.
            debug!(
                "channel PID 0x{:04X} left alive during teardown: {e}",
                open.channel.pid()
            );
        }
    }

    fn emit(&self, events: &[ProgramEvent]) {
        if events.is_empty() {
            return;
        }
        let callback = self.event_cb.lock().unwrap().clone();
        if let Some(callback) = callback {
            for event in events {
                callback(event);
            }
        }
    }

    fn on_pat(&self, _pid: u16, data: &Bytes) {
        let pat = match PatSection::parse(data) {
            Ok(pat) => pat,
            Err(e) => {
                warn!("PAT decode failed: {e}");
                return;
            }
        };

        let (pmt_pids, pat_open) = {
            let mut state = self.state.lock().unwrap();
            if state.quit || state.pat_handled {
                return;
            }
            state.pat_handled = true;

            if pat.programs.is_empty() {
                info!("PAT carries no programs; parsing finished");
                state.parse_done = true;
                self.cond.notify_all();
                (Vec::new(), state.pat.take())
            } else {
                if state.target_program.is_none() {
                    let selector = *self.selector.lock().unwrap();
                    state.target_program = match selector {
                        ProgramSelector::ByNumber(n) => Some(n),
                        ProgramSelector::First => Some(pat.programs[0].program_number),
                        ProgramSelector::ByAvPids { .. } => None,
                    };
                }
                let mut pids: Vec<u16> = Vec::new();
                for program in &pat.programs {
                    if !pids.contains(&program.pmt_pid) {
                        pids.push(program.pmt_pid);
                    }
                }
                debug!(
                    "PAT v{}: {} program(s), target {:?}",
                    pat.version_number,
                    pat.programs.len(),
                    state.target_program
                );
                (pids, state.pat.take())
            }
        };

        let mut opened = Vec::new();
        for pmt_pid in pmt_pids {
            match self.open_filter(pmt_pid, true, Self::on_pmt) {
                Ok(open) => opened.push(open),
                Err(e) => error!("failed to open PMT filter for PID 0x{pmt_pid:04X}: {e}"),
            }
        }
        if !opened.is_empty() {
            let mut state = self.state.lock().unwrap();
            if state.quit {
                drop(state);
                for open in opened {
                    self.teardown_filter(open);
                }
            } else {
                state.pmts.extend(opened);
            }
        }

        // The PAT is one-shot: tear its filter down after the first
        // successful parse.
        if let Some(open) = pat_open {
            self.teardown_filter(open);
        }
    }

    fn on_pmt(&self, pmt_pid: u16, data: &Bytes) {
        let pmt = match PmtSection::parse(data) {
            Ok(pmt) => pmt,
            Err(e) => {
                warn!("PMT decode failed on PID 0x{pmt_pid:04X}: {e}");
                return;
            }
        };
        if !pmt.current_next {
            debug!("PMT v{} on PID 0x{pmt_pid:04X} not yet active", pmt.version_number);
            return;
        }

        let mut events = Vec::new();
        let mut ecm_to_open = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.quit {
                return;
            }
            if let Some(cached) = state.pmt_states.get(&pmt_pid) {
                if cached.version_number == pmt.version_number {
                    // Retransmission of an unchanged table: never
                    // re-fire events.
                    return;
                }
            }

            let previous_pids = state
                .pmt_states
                .get(&pmt_pid)
                .map(|cached| cached.stream_pids.clone());
            let stream_pids: Vec<u16> = pmt.streams.iter().map(|s| s.elementary_pid).collect();
            state.pmt_states.insert(
                pmt_pid,
                PmtState {
                    program_number: pmt.program_number,
                    version_number: pmt.version_number,
                    stream_pids: stream_pids.clone(),
                },
            );

            if !self.pmt_selected(&state, pmt_pid, &pmt) {
                debug!(
                    "PMT for program {} on PID 0x{pmt_pid:04X} is not the target",
                    pmt.program_number
                );
                return;
            }
            state.selected_pmt_pid = Some(pmt_pid);
            state.target_program = Some(pmt.program_number);

            self.apply_pmt(&mut state.program, pmt_pid, &pmt);

            if state.program.scrambled {
                let mut candidates: Vec<u16> = Vec::new();
                candidates.extend(valid_pid(pmt.ecm_pid.unwrap_or(pid::NULL)));
                for stream in &pmt.streams {
                    candidates.extend(valid_pid(stream.ecm_pid.unwrap_or(pid::NULL)));
                }
                for ecm_pid in candidates {
                    if state.ecm_pids.insert(ecm_pid) {
                        ecm_to_open.push(ecm_pid);
                    }
                }
            }

            if let Some(previous) = previous_pids {
                if let Some((old_pid, new_pid)) =
                    crate::program::first_changed_pair(&previous, &stream_pids)
                {
                    info!(
                        "A/V PID change on program {}: 0x{old_pid:04X} -> 0x{new_pid:04X}",
                        pmt.program_number
                    );
                    events.push(ProgramEvent::AvPidChanged { old_pid, new_pid });
                }
            }
            if state.program.is_complete() {
                state.parse_done = true;
                if !state.complete_notified {
                    state.complete_notified = true;
                    events.push(ProgramEvent::ProgramParsed {
                        program_number: pmt.program_number,
                    });
                }
                self.cond.notify_all();
            }
        }

        self.emit(&events);

        for ecm_pid in ecm_to_open {
            // ECM payloads carry no CRC framing worth validating here;
            // the CA engine owns their integrity.
            match self.open_filter(ecm_pid, false, Self::on_ecm) {
                Ok(open) => {
                    debug!("ECM filter opened on PID 0x{ecm_pid:04X}");
                    let mut state = self.state.lock().unwrap();
                    if state.quit {
                        drop(state);
                        self.teardown_filter(open);
                    } else {
                        state.ecms.push(open);
                    }
                }
                // ECM filter failure does not fail PMT parsing.
                Err(e) => warn!("failed to open ECM filter for PID 0x{ecm_pid:04X}: {e}"),
            }
        }
    }

    fn on_cat(&self, _pid: u16, data: &Bytes) {
        let cat = match CatSection::parse(data) {
            Ok(cat) => cat,
            Err(e) => {
                warn!("CAT decode failed: {e}");
                return;
            }
        };

        let mut events = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.quit {
                return;
            }
            if let Some(emm_pid) = cat.emm_pid.and_then(valid_pid) {
                state.program.emm_pid = Some(emm_pid);
            }
            if state.program.ca_system_id.is_none() {
                state.program.ca_system_id = cat.ca_system_id.map(u32::from);
            }
            debug!(
                "CAT v{}: ca_system_id={:?} emm_pid={:?}",
                cat.version_number, cat.ca_system_id, cat.emm_pid
            );
            if state.program.is_complete() {
                state.parse_done = true;
                if !state.complete_notified {
                    state.complete_notified = true;
                    let program_number = state.program.program_number.unwrap_or(0);
                    events.push(ProgramEvent::ProgramParsed { program_number });
                }
                self.cond.notify_all();
            }
        }
        self.emit(&events);
    }

    fn on_ecm(&self, ecm_pid: u16, data: &Bytes) {
        {
            let state = self.state.lock().unwrap();
            if state.quit {
                return;
            }
        }
        self.emit(&[ProgramEvent::EcmData {
            pid: ecm_pid,
            data: data.clone(),
        }]);
    }

    /// Whether this PMT selects the caller's target: an already
    /// selected PMT PID, a program-number match, containment of a
    /// requested A/V PID, or first-PMT-wins when no hint exists.
    fn pmt_selected(&self, state: &ParserState, pmt_pid: u16, pmt: &PmtSection) -> bool {
        if let Some(selected) = state.selected_pmt_pid {
            return selected == pmt_pid;
        }
        match *self.selector.lock().unwrap() {
            ProgramSelector::ByNumber(n) => pmt.program_number == n,
            ProgramSelector::ByAvPids { video, audio } => pmt.streams.iter().any(|s| {
                Some(s.elementary_pid) == video || Some(s.elementary_pid) == audio
            }),
            ProgramSelector::First => match state.target_program {
                Some(target) => pmt.program_number == target,
                None => true,
            },
        }
    }

    /// Populate the program picture from a decoded PMT.
    fn apply_pmt(&self, program: &mut ProgramInfo, pmt_pid: u16, pmt: &PmtSection) {
        program.program_number = Some(pmt.program_number);
        program.pmt_pid = Some(pmt_pid);
        program.pcr_pid = valid_pid(pmt.pcr_pid);

        if let Some(ca_system_id) = pmt.ca_system_id {
            program.scrambled = true;
            program.ca_system_id = Some(u32::from(ca_system_id));
        }
        if !pmt.ca_private.is_empty() {
            program.set_ca_private(&pmt.ca_private);
        }
        if let Some(info) = &pmt.scramble_info {
            program.scramble_info = info.clone();
        }

        let streams: Vec<EsStream> = pmt
            .streams
            .iter()
            .map(|s| EsStream {
                pid: s.elementary_pid,
                stream_type: s.stream_type,
                codec: s.codec,
                composition_page_id: s.composition_page_id,
                ancillary_page_id: s.ancillary_page_id,
            })
            .collect();
        program.set_streams(streams);

        // Per-stream CA descriptors override their own component slot;
        // the program-level ECM PID fills whatever is left.
        for stream in &pmt.streams {
            if let Some(ecm_pid) = stream.ecm_pid.and_then(valid_pid) {
                program.scrambled = true;
                let kind = stream
                    .codec
                    .map(|c| c.kind())
                    .unwrap_or(StreamKind::Other);
                program.set_ecm_slot(kind, ecm_pid);
                if program.scramble_info == ScrambleInfo::default() {
                    if let Some(info) = &stream.scramble_info {
                        program.scramble_info = info.clone();
                    }
                }
            }
        }
        if let Some(ecm_pid) = pmt.ecm_pid.and_then(valid_pid) {
            program.fill_ecm_slots(ecm_pid);
        }
    }
}

/// A PID usable as a real target: not 0 (PAT) and not the null PID.
fn valid_pid(pid_value: u16) -> Option<u16> {
    if pid_value == 0 || pid_value >= pid::NULL {
        None
    } else {
        Some(pid_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::crc32_mpeg2;
    use crate::source::MemorySource;
    use crate::StreamCodec;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn long_section(table_id: u8, ext: u16, version: u8, current: bool, body: &[u8]) -> Vec<u8> {
        let section_length = 5 + body.len() + 4;
        let mut s = vec![
            table_id,
            0xB0 | ((section_length >> 8) as u8 & 0x0F),
            (section_length & 0xFF) as u8,
            (ext >> 8) as u8,
            (ext & 0xFF) as u8,
            0xC0 | (version << 1) | (current as u8),
            0,
            0,
        ];
        s.extend_from_slice(body);
        let crc = crc32_mpeg2(&s);
        s.extend_from_slice(&crc.to_be_bytes());
        s
    }

    fn pat_section(entries: &[(u16, u16)]) -> Vec<u8> {
        let mut body = Vec::new();
        for &(num, pid) in entries {
            body.extend_from_slice(&num.to_be_bytes());
            body.extend_from_slice(&(0xE000 | pid).to_be_bytes());
        }
        long_section(0x00, 0x0001, 0, true, &body)
    }

    fn pmt_section(
        program_number: u16,
        version: u8,
        current: bool,
        program_descriptors: &[u8],
        streams: &[(u8, u16, &[u8])],
    ) -> Vec<u8> {
        let mut body = Vec::new();
        let pcr_pid = streams.first().map(|s| s.1).unwrap_or(0x1FFF);
        body.extend_from_slice(&(0xE000 | pcr_pid).to_be_bytes());
        body.extend_from_slice(&(0xF000 | program_descriptors.len() as u16).to_be_bytes());
        body.extend_from_slice(program_descriptors);
        for &(stream_type, pid, es_info) in streams {
            body.push(stream_type);
            body.extend_from_slice(&(0xE000 | pid).to_be_bytes());
            body.extend_from_slice(&(0xF000 | es_info.len() as u16).to_be_bytes());
            body.extend_from_slice(es_info);
        }
        long_section(0x02, program_number, version, current, &body)
    }

    fn cat_section(descriptors: &[u8]) -> Vec<u8> {
        long_section(0x01, 0xFFFF, 0, true, descriptors)
    }

    fn packetize(pid: u16, section: &[u8], cc: u8) -> Vec<u8> {
        assert!(section.len() <= 183, "test sections must fit one packet");
        let mut pkt = vec![0xFFu8; 188];
        pkt[0] = 0x47;
        pkt[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
        pkt[2] = (pid & 0xFF) as u8;
        pkt[3] = 0x10 | (cc & 0x0F);
        pkt[4] = 0;
        pkt[5..5 + section.len()].copy_from_slice(section);
        pkt
    }

    struct Harness {
        source: Arc<MemorySource>,
        registry: Arc<ChannelRegistry>,
        parser: Arc<PsiParser>,
        events: Arc<Mutex<Vec<ProgramEvent>>>,
    }

    fn harness() -> Harness {
        init_logs();
        let source = MemorySource::new();
        let registry = ChannelRegistry::new(source.clone());
        source.connect(&registry);
        let parser = PsiParser::new(registry.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        parser.set_event_callback(Arc::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));
        Harness {
            source,
            registry,
            parser,
            events,
        }
    }

    fn parsed_count(events: &Mutex<Vec<ProgramEvent>>) -> usize {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ProgramEvent::ProgramParsed { .. }))
            .count()
    }

    #[test]
    fn test_end_to_end_unscrambled_program() {
        let h = harness();
        h.parser.open().unwrap();

        let mut buf = packetize(0x0000, &pat_section(&[(1, 0x20)]), 0);
        buf.extend_from_slice(&packetize(
            0x20,
            &pmt_section(1, 0, true, &[], &[(0x1B, 0x101, &[]), (0x0F, 0x102, &[])]),
            0,
        ));
        h.source.feed(&buf);

        h.parser.wait(Duration::from_secs(3)).unwrap();
        let info = h.parser.program_info().unwrap();
        assert_eq!(info.program_number, Some(1));
        assert_eq!(info.pmt_pid, Some(0x20));
        assert_eq!(info.video.as_ref().unwrap().pid, 0x101);
        assert_eq!(info.video.as_ref().unwrap().codec, Some(StreamCodec::H264));
        assert_eq!(info.audio.as_ref().unwrap().pid, 0x102);
        assert_eq!(info.audio.as_ref().unwrap().codec, Some(StreamCodec::Aac));
        assert!(!info.scrambled);
        assert_eq!(parsed_count(&h.events), 1);

        // PAT filter is one-shot: its channel is gone after the parse.
        assert!(h.registry.channel(0x0000).is_none());
        h.parser.close();
    }

    #[test]
    fn test_pmt_redelivery_is_idempotent() {
        let h = harness();
        h.parser.open().unwrap();

        let pmt = pmt_section(1, 0, true, &[], &[(0x1B, 0x101, &[])]);
        let mut buf = packetize(0x0000, &pat_section(&[(1, 0x20)]), 0);
        buf.extend_from_slice(&packetize(0x20, &pmt, 0));
        buf.extend_from_slice(&packetize(0x20, &pmt, 1)); // retransmission
        h.source.feed(&buf);
        h.source.feed(&packetize(0x20, &pmt, 2)); // and again

        h.parser.wait(Duration::from_secs(3)).unwrap();
        assert_eq!(parsed_count(&h.events), 1);
        h.parser.close();
    }

    #[test]
    fn test_av_pid_change_detection() {
        let h = harness();
        h.parser.open().unwrap();

        let mut buf = packetize(0x0000, &pat_section(&[(1, 0x20)]), 0);
        buf.extend_from_slice(&packetize(
            0x20,
            &pmt_section(1, 1, true, &[], &[(0x1B, 0x100, &[]), (0x0F, 0x102, &[])]),
            0,
        ));
        h.source.feed(&buf);
        h.parser.wait(Duration::from_secs(3)).unwrap();

        // version 2 replaces the video PID
        h.source.feed(&packetize(
            0x20,
            &pmt_section(1, 2, true, &[], &[(0x1B, 0x200, &[]), (0x0F, 0x102, &[])]),
            1,
        ));

        let events = h.events.lock().unwrap().clone();
        assert_eq!(parsed_count(&h.events), 1);
        assert!(events.contains(&ProgramEvent::AvPidChanged {
            old_pid: 0x100,
            new_pid: 0x200
        }));
        assert_eq!(
            h.parser.program_info().unwrap().video.unwrap().pid,
            0x200
        );
        h.parser.close();
    }

    #[test]
    fn test_not_yet_active_pmt_is_discarded() {
        let h = harness();
        h.parser.open().unwrap();

        let mut buf = packetize(0x0000, &pat_section(&[(1, 0x20)]), 0);
        buf.extend_from_slice(&packetize(
            0x20,
            &pmt_section(1, 0, false, &[], &[(0x1B, 0x101, &[])]),
            0,
        ));
        h.source.feed(&buf);

        assert_eq!(
            h.parser.wait(Duration::from_millis(50)),
            Err(WaitError::TimedOut)
        );
        assert!(h.parser.program_info().is_none());
        h.parser.close();
    }

    #[test]
    fn test_ca_descriptor_extraction_and_ecm_filter() {
        let h = harness();
        h.parser.open().unwrap();

        // program-level CA descriptor: system 0x0602, ECM PID 0x0050
        let ca = [0x09, 0x04, 0x06, 0x02, 0xE0, 0x50];
        let mut buf = packetize(0x0000, &pat_section(&[(1, 0x20)]), 0);
        buf.extend_from_slice(&packetize(
            0x20,
            &pmt_section(1, 0, true, &ca, &[(0x1B, 0x101, &[])]),
            0,
        ));
        h.source.feed(&buf);
        h.parser.wait(Duration::from_secs(3)).unwrap();

        let info = h.parser.program_info().unwrap();
        assert!(info.scrambled);
        assert_eq!(info.ca_system_id, Some(0x0602));
        assert_eq!(info.ecm_pid_video, Some(0x0050));

        // an ECM filter was opened, without CRC checking
        let ecm_channel = h.registry.channel(0x0050).unwrap();
        assert!(!ecm_channel.check_crc());

        // raw ECM bytes are forwarded verbatim (short-form section)
        let ecm = [0x80u8, 0x30, 0x04, 0xDE, 0xAD, 0xBE, 0xEF];
        h.source.feed(&packetize(0x0050, &ecm, 0));
        let events = h.events.lock().unwrap().clone();
        assert!(events.iter().any(|e| matches!(
            e,
            ProgramEvent::EcmData { pid: 0x0050, data } if data[..] == ecm[..]
        )));
        h.parser.close();
    }

    #[test]
    fn test_ecm_filter_opened_once_per_pid() {
        let h = harness();
        h.parser.open().unwrap();

        let ca = [0x09, 0x04, 0x06, 0x02, 0xE0, 0x50];
        let mut buf = packetize(0x0000, &pat_section(&[(1, 0x20)]), 0);
        buf.extend_from_slice(&packetize(
            0x20,
            &pmt_section(1, 0, true, &ca, &[(0x1B, 0x101, &[])]),
            0,
        ));
        h.source.feed(&buf);
        h.parser.wait(Duration::from_secs(3)).unwrap();

        // a new PMT version with the same ECM PID must not open another
        // filter on it
        h.source.feed(&packetize(
            0x20,
            &pmt_section(1, 1, true, &ca, &[(0x1B, 0x102, &[])]),
            1,
        ));
        let state = h.parser.state.lock().unwrap();
        assert_eq!(state.ecms.len(), 1);
        drop(state);
        h.parser.close();
    }

    #[test]
    fn test_cat_completes_scrambled_program() {
        let h = harness();
        h.parser.open().unwrap();

        // CA descriptor whose ECM PID is the null PID: scrambled but no
        // usable ECM source, so the program stays incomplete.
        let ca = [0x09, 0x04, 0x06, 0x02, 0xFF, 0xFF];
        let mut buf = packetize(0x0000, &pat_section(&[(1, 0x20)]), 0);
        buf.extend_from_slice(&packetize(
            0x20,
            &pmt_section(1, 0, true, &ca, &[(0x1B, 0x101, &[])]),
            0,
        ));
        h.source.feed(&buf);
        assert_eq!(
            h.parser.wait(Duration::from_millis(50)),
            Err(WaitError::TimedOut)
        );

        // CAT supplies the EMM PID; the program becomes complete.
        h.source.feed(&packetize(
            0x0001,
            &cat_section(&[0x09, 0x04, 0x06, 0x02, 0xE0, 0x60]),
            0,
        ));
        h.parser.wait(Duration::from_secs(3)).unwrap();
        let info = h.parser.program_info().unwrap();
        assert_eq!(info.emm_pid, Some(0x0060));
        assert_eq!(parsed_count(&h.events), 1);
        h.parser.close();
    }

    #[test]
    fn test_completeness_is_monotonic_under_unrelated_updates() {
        let h = harness();
        h.parser.open().unwrap();

        let mut buf = packetize(0x0000, &pat_section(&[(1, 0x20)]), 0);
        buf.extend_from_slice(&packetize(
            0x20,
            &pmt_section(1, 0, true, &[], &[(0x1B, 0x101, &[])]),
            0,
        ));
        h.source.feed(&buf);
        h.parser.wait(Duration::from_secs(3)).unwrap();
        assert!(h.parser.program_info().is_some());

        // an unrelated CAT update must not un-complete the program or
        // re-fire ProgramParsed
        h.source.feed(&packetize(
            0x0001,
            &cat_section(&[0x09, 0x04, 0x17, 0x00, 0xE0, 0x70]),
            0,
        ));
        assert!(h.parser.program_info().is_some());
        assert_eq!(parsed_count(&h.events), 1);
        h.parser.close();
    }

    #[test]
    fn test_zero_program_pat_finishes_immediately() {
        let h = harness();
        h.parser.open().unwrap();

        h.source.feed(&packetize(0x0000, &pat_section(&[]), 0));
        // parsing is finished, but there is nothing to report
        h.parser.wait(Duration::from_secs(3)).unwrap();
        assert!(h.parser.program_info().is_none());
        assert_eq!(parsed_count(&h.events), 0);
        h.parser.close();
    }

    #[test]
    fn test_program_selection_by_number() {
        let h = harness();
        h.parser.select_program(2);
        h.parser.open().unwrap();

        let mut buf = packetize(0x0000, &pat_section(&[(1, 0x20), (2, 0x21)]), 0);
        // program 1 arrives first but is not the target
        buf.extend_from_slice(&packetize(
            0x20,
            &pmt_section(1, 0, true, &[], &[(0x1B, 0x101, &[])]),
            0,
        ));
        buf.extend_from_slice(&packetize(
            0x21,
            &pmt_section(2, 0, true, &[], &[(0x1B, 0x201, &[]), (0x0F, 0x202, &[])]),
            0,
        ));
        h.source.feed(&buf);

        h.parser.wait(Duration::from_secs(3)).unwrap();
        let info = h.parser.program_info().unwrap();
        assert_eq!(info.program_number, Some(2));
        assert_eq!(info.video.unwrap().pid, 0x201);
        h.parser.close();
    }

    #[test]
    fn test_program_selection_by_av_pid() {
        let h = harness();
        h.parser.select_av_pids(None, Some(0x202));
        h.parser.open().unwrap();

        let mut buf = packetize(0x0000, &pat_section(&[(1, 0x20), (2, 0x21)]), 0);
        buf.extend_from_slice(&packetize(
            0x20,
            &pmt_section(1, 0, true, &[], &[(0x0F, 0x102, &[])]),
            0,
        ));
        buf.extend_from_slice(&packetize(
            0x21,
            &pmt_section(2, 0, true, &[], &[(0x0F, 0x202, &[])]),
            0,
        ));
        h.source.feed(&buf);

        h.parser.wait(Duration::from_secs(3)).unwrap();
        assert_eq!(h.parser.program_info().unwrap().program_number, Some(2));
        h.parser.close();
    }

    #[test]
    fn test_malformed_section_is_local() {
        let h = harness();
        h.parser.open().unwrap();

        h.source.feed(&packetize(0x0000, &pat_section(&[(1, 0x20)]), 0));

        // oversized section_length (4094) injected directly: the PMT
        // callback fails, the channel must survive
        let mut bogus = vec![0x02u8, 0xBF, 0xFE];
        bogus.extend_from_slice(&[0u8; 9]);
        h.registry
            .dispatch(0x20, Bytes::from(bogus), Some(0));

        assert!(h.registry.channel(0x20).is_some());

        // a well-formed PMT on the same channel still completes parsing
        h.source.feed(&packetize(
            0x20,
            &pmt_section(1, 1, true, &[], &[(0x1B, 0x101, &[])]),
            0,
        ));
        h.parser.wait(Duration::from_secs(3)).unwrap();
        assert!(h.parser.program_info().is_some());
        h.parser.close();
    }

    #[test]
    fn test_double_open_rejected() {
        let h = harness();
        h.parser.open().unwrap();
        assert_eq!(
            h.parser.open(),
            Err(DemuxError::InvalidState("parser already open"))
        );
        h.parser.close();
    }

    #[test]
    fn test_quit_wakes_wait() {
        let h = harness();
        h.parser.open().unwrap();

        let parser = h.parser.clone();
        let waiter = std::thread::spawn(move || parser.wait(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        h.parser.signal_quit();
        assert_eq!(waiter.join().unwrap(), Err(WaitError::QuitRequested));
        h.parser.close();
    }

    #[test]
    fn test_close_is_idempotent_and_releases_channels() {
        let h = harness();
        h.parser.open().unwrap();

        let mut buf = packetize(0x0000, &pat_section(&[(1, 0x20)]), 0);
        buf.extend_from_slice(&packetize(
            0x20,
            &pmt_section(1, 0, true, &[], &[(0x1B, 0x101, &[])]),
            0,
        ));
        h.source.feed(&buf);
        h.parser.wait(Duration::from_secs(3)).unwrap();

        h.parser.close();
        h.parser.close();
        assert!(h.registry.channel(0x20).is_none());
        assert!(h.registry.channel(0x0001).is_none());

        // deliveries after close are ignored
        h.source.feed(&packetize(0x20, &pmt_section(1, 2, true, &[], &[]), 0));
        assert_eq!(parsed_count(&h.events), 1);
    }
}
