//! In-process software demux source.
//!
//! `MemorySource` is the backend used when section bytes come from a
//! caller-owned buffer (e.g. a software ring buffer) instead of a
//! hardware demux: the caller pushes raw TS bytes through
//! [`MemorySource::feed`] and the source reassembles sections per
//! enabled PID, CRC-checks them when the channel asked for it, and
//! delivers them into the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use log::{debug, trace};

use crate::backend::{BackendChannelId, DemuxBackend};
use crate::channel::SectionSink;
use crate::error::DemuxError;
use crate::packet::TsPacketIterator;
use crate::section::{validate_section_crc, SectionAssembler};

struct PidEntry {
    id: BackendChannelId,
    check_crc: bool,
    enabled: bool,
    assembler: SectionAssembler,
}

struct SourceState {
    pids: HashMap<u16, PidEntry>,
    next_id: u32,
}

/// Software/memory demux backend fed by explicit `feed()` calls.
pub struct MemorySource {
    state: Mutex<SourceState>,
    sink: Mutex<Weak<dyn SectionSink>>,
}

impl MemorySource {
    /// Create an unconnected source.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SourceState {
                pids: HashMap::new(),
                next_id: 1,
            }),
            sink: Mutex::new(Weak::<crate::channel::ChannelRegistry>::new()),
        })
    }

    /// Connect the source to the registry it delivers into. Held as a
    /// weak reference so source and registry may be dropped in any
    /// order.
    pub fn connect(&self, sink: &Arc<crate::channel::ChannelRegistry>) {
        let weak = Arc::downgrade(sink) as Weak<dyn SectionSink>;
        *self.sink.lock().unwrap() = weak;
    }

    /// Push raw TS bytes into the source.
    ///
    /// Returns the number of bytes consumed (trailing partial packets
    /// are not buffered; the caller re-feeds them with the next chunk).
    /// Completed sections are dispatched synchronously on the calling
    /// thread; no source lock is held across dispatch.
    pub fn feed(&self, buf: &[u8]) -> usize {
        let sink = self.sink.lock().unwrap().upgrade();
        let Some(sink) = sink else {
            debug!("feed() on a disconnected source; dropping {} bytes", buf.len());
            return buf.len();
        };

        let mut iter = TsPacketIterator::new(buf);
        for packet in &mut iter {
            if packet.header.transport_error || packet.header.is_scrambled() {
                continue;
            }
            if !packet.header.has_payload() {
                continue;
            }

            let completed = {
                let mut state = self.state.lock().unwrap();
                let Some(entry) = state.pids.get_mut(&packet.header.pid) else {
                    continue;
                };
                if !entry.enabled {
                    continue;
                }
                let done = entry.assembler.push(
                    packet.payload,
                    packet.header.continuity_counter,
                    packet.header.payload_unit_start,
                );
                if done {
                    entry
                        .assembler
                        .take_section()
                        .map(|s| (s, entry.check_crc))
                } else {
                    None
                }
            };

            if let Some((section, check_crc)) = completed {
                if check_crc && !validate_section_crc(&section) {
                    debug!(
                        "dropping section on PID 0x{:04X}: CRC-32 mismatch",
                        packet.header.pid
                    );
                    continue;
                }
                let version = table_version(&section);
                trace!(
                    "section complete on PID 0x{:04X}: {} bytes, version {:?}",
                    packet.header.pid,
                    section.len(),
                    version
                );
                sink.deliver(packet.header.pid, Bytes::from(section), version);
            }
        }
        iter.consumed()
    }
}

impl DemuxBackend for MemorySource {
    fn create_channel(&self, pid: u16, check_crc: bool) -> Result<BackendChannelId, DemuxError> {
        let mut state = self.state.lock().unwrap();
        if state.pids.contains_key(&pid) {
            return Err(DemuxError::ResourceError(format!(
                "PID 0x{pid:04X} already has a software filter"
            )));
        }
        let id = BackendChannelId(state.next_id);
        state.next_id += 1;
        state.pids.insert(
            pid,
            PidEntry {
                id,
                check_crc,
                enabled: false,
                assembler: SectionAssembler::new(),
            },
        );
        Ok(id)
    }

    fn open_channel(&self, id: BackendChannelId) -> Result<(), DemuxError> {
        self.with_entry(id, |e| e.enabled = true)
    }

    fn close_channel(&self, id: BackendChannelId) -> Result<(), DemuxError> {
        self.with_entry(id, |e| {
            e.enabled = false;
            e.assembler.clear();
        })
    }

    fn destroy_channel(&self, id: BackendChannelId) -> Result<(), DemuxError> {
        let mut state = self.state.lock().unwrap();
        let before = state.pids.len();
        state.pids.retain(|_, e| e.id != id);
        if state.pids.len() == before {
            return Err(DemuxError::ResourceError(format!(
                "unknown software channel {id:?}"
            )));
        }
        Ok(())
    }
}

impl MemorySource {
    fn with_entry(
        &self,
        id: BackendChannelId,
        f: impl FnOnce(&mut PidEntry),
    ) -> Result<(), DemuxError> {
        let mut state = self.state.lock().unwrap();
        match state.pids.values_mut().find(|e| e.id == id) {
            Some(entry) => {
                f(entry);
                Ok(())
            }
            None => Err(DemuxError::ResourceError(format!(
                "unknown software channel {id:?}"
            ))),
        }
    }
}

/// Extract the table version_number from a long-form section, `None`
/// for short-form payloads (which are not version-tagged).
fn table_version(section: &[u8]) -> Option<u8> {
    if section.len() >= 6 && section[1] & 0x80 != 0 {
        Some((section[5] & 0x3E) >> 1)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelRegistry;
    use crate::section::crc32_mpeg2;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn long_section(table_id: u8, ext: u16, version: u8, body: &[u8]) -> Vec<u8> {
        let section_length = 5 + body.len() + 4;
        let mut s = vec![
            table_id,
            0xB0 | ((section_length >> 8) as u8 & 0x0F),
            (section_length & 0xFF) as u8,
            (ext >> 8) as u8,
            (ext & 0xFF) as u8,
            0xC0 | (version << 1) | 0x01,
            0,
            0,
        ];
        s.extend_from_slice(body);
        let crc = crc32_mpeg2(&s);
        s.extend_from_slice(&crc.to_be_bytes());
        s
    }

    fn packetize(pid: u16, section: &[u8], cc: u8) -> Vec<u8> {
        assert!(section.len() <= 183);
        let mut pkt = vec![0xFFu8; 188];
        pkt[0] = 0x47;
        pkt[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
        pkt[2] = (pid & 0xFF) as u8;
        pkt[3] = 0x10 | (cc & 0x0F);
        pkt[4] = 0; // pointer field
        pkt[5..5 + section.len()].copy_from_slice(section);
        pkt
    }

    #[test]
    fn test_feed_delivers_enabled_pid_only() {
        let source = MemorySource::new();
        let registry = ChannelRegistry::new(source.clone());
        source.connect(&registry);

        let channel = registry.create_channel(0x20, true).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let filter = registry.create_filter(Arc::new(move |pid, _| {
            assert_eq!(pid, 0x20);
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        registry.attach_filter(&filter, &channel).unwrap();

        let section = long_section(0x02, 1, 0, &[0xE1, 0x00, 0xF0, 0x00]);
        let mut buf = packetize(0x20, &section, 0);
        buf.extend_from_slice(&packetize(0x99, &section, 0)); // no channel

        let consumed = source.feed(&buf);
        assert_eq!(consumed, buf.len());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_feed_drops_bad_crc() {
        let source = MemorySource::new();
        let registry = ChannelRegistry::new(source.clone());
        source.connect(&registry);

        let channel = registry.create_channel(0x20, true).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let filter = registry.create_filter(Arc::new(move |_, _| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        registry.attach_filter(&filter, &channel).unwrap();

        let mut section = long_section(0x02, 1, 0, &[0xE1, 0x00, 0xF0, 0x00]);
        let last = section.len() - 1;
        section[last] ^= 0xFF; // corrupt CRC
        source.feed(&packetize(0x20, &section, 0));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_feed_skips_crc_for_unchecked_channel() {
        let source = MemorySource::new();
        let registry = ChannelRegistry::new(source.clone());
        source.connect(&registry);

        let channel = registry.create_channel(0x50, false).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let filter = registry.create_filter(Arc::new(move |_, _| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        registry.attach_filter(&filter, &channel).unwrap();

        let mut section = long_section(0x80, 0, 0, &[0x11, 0x22]);
        let last = section.len() - 1;
        section[last] ^= 0xFF;
        source.feed(&packetize(0x50, &section, 0));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_table_version_extraction() {
        let section = long_section(0x02, 1, 7, &[0, 0, 0, 0]);
        assert_eq!(table_version(&section), Some(7));
        // short-form section: no version
        assert_eq!(table_version(&[0x80, 0x30, 0x02, 0xAA, 0xBB]), None);
    }
}
