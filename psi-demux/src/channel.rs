//! Section channels, filters and the PID-keyed registry.
//!
//! A [`SectionChannel`] represents one demultiplexing channel keyed by
//! a 13-bit PID and fans delivered sections out to its attached
//! [`SectionFilter`]s. The [`ChannelRegistry`] owns the PID→channel map
//! and enforces the lifecycle invariants: a channel is created on first
//! reference to a PID and cannot be destroyed while filters are still
//! attached.
//!
//! Ownership is `Arc`-shared. Teardown on one thread never frees an
//! object an in-flight delivery on another thread still references;
//! the last holder drops it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use log::{debug, warn};

use crate::backend::{BackendChannelId, DemuxBackend};
use crate::error::DemuxError;

/// Callback invoked with `(pid, section)` for every non-duplicate
/// delivery to a filter.
pub type SectionCallback = Arc<dyn Fn(u16, &Bytes) + Send + Sync>;

/// Delivery entry point for section producers (implemented by
/// [`ChannelRegistry`]).
pub trait SectionSink: Send + Sync {
    /// Deliver one complete section for `pid`. `version` is the table
    /// version_number for long-form sections, `None` for payloads that
    /// carry no version (e.g. raw ECM data).
    fn deliver(&self, pid: u16, section: Bytes, version: Option<u8>);
}

/// One registered section consumer.
pub struct SectionFilter {
    id: u32,
    callback: SectionCallback,
    /// Version of the last section forwarded to this filter. Tables are
    /// retransmitted continuously on the wire; an unchanged version is
    /// dropped here so downstream state machines only see revisions.
    last_version: Mutex<Option<u8>>,
    /// Non-owning back-reference to the owning channel, used only to
    /// find the channel for detachment.
    owner: Mutex<Weak<SectionChannel>>,
}

impl SectionFilter {
    fn new(id: u32, callback: SectionCallback) -> Arc<Self> {
        Arc::new(Self {
            id,
            callback,
            last_version: Mutex::new(None),
            owner: Mutex::new(Weak::new()),
        })
    }

    /// Filter id (unique per registry).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The channel this filter is currently attached to, if any.
    pub fn owner(&self) -> Option<Arc<SectionChannel>> {
        self.owner.lock().unwrap().upgrade()
    }

    /// Deliver a section to this filter, suppressing redundant
    /// retransmissions of an unchanged table version.
    pub fn notify(&self, pid: u16, section: &Bytes, version: Option<u8>) {
        if let Some(v) = version {
            let mut last = self.last_version.lock().unwrap();
            if *last == Some(v) {
                return;
            }
            *last = Some(v);
        }
        (self.callback)(pid, section);
    }
}

/// One demultiplexing channel keyed by PID.
pub struct SectionChannel {
    pid: u16,
    check_crc: bool,
    backend_id: BackendChannelId,
    enabled: AtomicBool,
    filters: Mutex<Vec<Arc<SectionFilter>>>,
}

impl SectionChannel {
    /// The PID this channel delivers.
    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// Whether sections on this channel are CRC-validated.
    pub fn check_crc(&self) -> bool {
        self.check_crc
    }

    /// Whether delivery is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Number of attached filters.
    pub fn filter_count(&self) -> usize {
        self.filters.lock().unwrap().len()
    }

    fn snapshot_filters(&self) -> Vec<Arc<SectionFilter>> {
        self.filters.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for SectionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectionChannel")
            .field("pid", &self.pid)
            .field("check_crc", &self.check_crc)
            .field("backend_id", &self.backend_id)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl PartialEq for SectionChannel {
    fn eq(&self, other: &Self) -> bool {
        self.backend_id == other.backend_id
    }
}

struct RegistryInner {
    channels: HashMap<u16, Arc<SectionChannel>>,
    stopped: bool,
}

/// Owner of the PID→channel map.
pub struct ChannelRegistry {
    backend: Arc<dyn DemuxBackend>,
    inner: Mutex<RegistryInner>,
    next_filter_id: AtomicU32,
}

impl ChannelRegistry {
    /// Create a registry over the given backend.
    pub fn new(backend: Arc<dyn DemuxBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            inner: Mutex::new(RegistryInner {
                channels: HashMap::new(),
                stopped: false,
            }),
            next_filter_id: AtomicU32::new(1),
        })
    }

    /// Get or create the channel for `pid`.
    ///
    /// The backend resource is opened outside the registry lock; if two
    /// threads race on the same new PID, the loser's resource is
    /// released and the winner's channel returned.
    pub fn create_channel(
        &self,
        pid: u16,
        check_crc: bool,
    ) -> Result<Arc<SectionChannel>, DemuxError> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.stopped {
                return Err(DemuxError::Stopped);
            }
            if let Some(ch) = inner.channels.get(&pid) {
                return Ok(ch.clone());
            }
        }

        let backend_id = match self.backend.create_channel(pid, check_crc) {
            Ok(id) => id,
            Err(e) => {
                // A backend that rejects duplicate PIDs fails the loser
                // of a create race before the re-check below is ever
                // reached; the winner's channel is the right answer.
                if let Some(existing) = self.channel(pid) {
                    return Ok(existing);
                }
                return Err(e);
            }
        };
        self.backend.open_channel(backend_id)?;

        let channel = Arc::new(SectionChannel {
            pid,
            check_crc,
            backend_id,
            enabled: AtomicBool::new(true),
            filters: Mutex::new(Vec::new()),
        });

        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            drop(inner);
            let _ = self.backend.destroy_channel(backend_id);
            return Err(DemuxError::Stopped);
        }
        if let Some(existing) = inner.channels.get(&pid) {
            // Lost the race: another thread opened this PID first.
            let existing = existing.clone();
            drop(inner);
            let _ = self.backend.destroy_channel(backend_id);
            return Ok(existing);
        }
        inner.channels.insert(pid, channel.clone());
        debug!("channel created for PID 0x{pid:04X} (check_crc={check_crc})");
        Ok(channel)
    }

    /// Destroy a channel and release its backend resource.
    ///
    /// Rejected with `InvalidState` while filters are still attached;
    /// the channel stays registered in that case.
    pub fn destroy_channel(&self, channel: &Arc<SectionChannel>) -> Result<(), DemuxError> {
        {
            let mut inner = self.inner.lock().unwrap();
            let filters = channel.filters.lock().unwrap();
            if !filters.is_empty() {
                warn!(
                    "refusing to destroy channel PID 0x{:04X}: {} filter(s) still attached",
                    channel.pid,
                    filters.len()
                );
                return Err(DemuxError::InvalidState(
                    "channel still has attached filters",
                ));
            }
            channel.enabled.store(false, Ordering::SeqCst);
            inner.channels.remove(&channel.pid);
        }
        let _ = self.backend.close_channel(channel.backend_id);
        self.backend.destroy_channel(channel.backend_id)?;
        debug!("channel destroyed for PID 0x{:04X}", channel.pid);
        Ok(())
    }

    /// Allocate an unattached filter with a fresh id.
    pub fn create_filter(&self, callback: SectionCallback) -> Arc<SectionFilter> {
        let id = self.next_filter_id.fetch_add(1, Ordering::SeqCst);
        SectionFilter::new(id, callback)
    }

    /// Release a filter. A still-attached filter indicates a caller
    /// bug: it is detached first, with a warning.
    pub fn destroy_filter(&self, filter: &Arc<SectionFilter>) {
        if let Some(channel) = filter.owner() {
            warn!(
                "filter {} destroyed while still attached to PID 0x{:04X}; detaching",
                filter.id, channel.pid
            );
            let _ = self.detach_filter(filter, &channel);
        }
    }

    /// Attach `filter` to `channel`.
    pub fn attach_filter(
        &self,
        filter: &Arc<SectionFilter>,
        channel: &Arc<SectionChannel>,
    ) -> Result<(), DemuxError> {
        let mut filters = channel.filters.lock().unwrap();
        let mut owner = filter.owner.lock().unwrap();
        if owner.upgrade().is_some() {
            warn!("filter {} is already attached", filter.id);
            return Err(DemuxError::InvalidState("filter already attached"));
        }
        *owner = Arc::downgrade(channel);
        filters.push(filter.clone());
        Ok(())
    }

    /// Detach `filter` from `channel`.
    pub fn detach_filter(
        &self,
        filter: &Arc<SectionFilter>,
        channel: &Arc<SectionChannel>,
    ) -> Result<(), DemuxError> {
        let mut filters = channel.filters.lock().unwrap();
        let mut owner = filter.owner.lock().unwrap();
        let before = filters.len();
        filters.retain(|f| f.id != filter.id);
        if filters.len() == before {
            warn!(
                "filter {} is not attached to channel PID 0x{:04X}",
                filter.id, channel.pid
            );
            return Err(DemuxError::InvalidState("filter not attached to channel"));
        }
        *owner = Weak::new();
        Ok(())
    }

    /// Look up the channel for `pid`, if registered.
    pub fn channel(&self, pid: u16) -> Option<Arc<SectionChannel>> {
        self.inner.lock().unwrap().channels.get(&pid).cloned()
    }

    /// Deliver a section to every filter currently attached to the
    /// channel for `pid`. A no-op for unknown, disabled or empty
    /// channels.
    ///
    /// The filter list is snapshotted under the lock; callbacks run
    /// outside it, so a callback may attach/detach/destroy freely.
    pub fn dispatch(&self, pid: u16, section: Bytes, version: Option<u8>) {
        let Some(channel) = self.channel(pid) else {
            return;
        };
        if !channel.is_enabled() {
            return;
        }
        let filters = channel.snapshot_filters();
        for filter in filters {
            filter.notify(pid, &section, version);
        }
    }

    /// Stop the registry: no further channels are handed out and every
    /// registered channel is released.
    pub fn stop(&self) {
        let channels: Vec<Arc<SectionChannel>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.stopped = true;
            inner.channels.drain().map(|(_, ch)| ch).collect()
        };
        for channel in channels {
            channel.enabled.store(false, Ordering::SeqCst);
            let _ = self.backend.close_channel(channel.backend_id);
            let _ = self.backend.destroy_channel(channel.backend_id);
        }
    }
}

impl SectionSink for ChannelRegistry {
    fn deliver(&self, pid: u16, section: Bytes, version: Option<u8>) {
        self.dispatch(pid, section, version);
    }
}
