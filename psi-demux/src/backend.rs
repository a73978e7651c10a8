//! External demultiplexer boundary.
//!
//! The registry does not talk to hardware directly: PID channel
//! resources are opened through [`DemuxBackend`], so a hardware demux,
//! the in-process [`MemorySource`](crate::MemorySource) and test mocks
//! are interchangeable.

use crate::error::DemuxError;

/// Opaque handle to a per-PID resource owned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendChannelId(pub u32);

/// The external demultiplexing collaborator.
///
/// Implementations must be safe to call from the registry on any
/// thread. Calls are never made while registry or parser locks are
/// held, so an implementation may block or take its own locks.
pub trait DemuxBackend: Send + Sync {
    /// Open a filter resource for `pid`. Sections delivered on this
    /// channel are CRC-validated by the backend when `check_crc` is
    /// set.
    fn create_channel(&self, pid: u16, check_crc: bool) -> Result<BackendChannelId, DemuxError>;

    /// Enable delivery on an existing channel.
    fn open_channel(&self, id: BackendChannelId) -> Result<(), DemuxError>;

    /// Disable delivery without destroying the resource.
    fn close_channel(&self, id: BackendChannelId) -> Result<(), DemuxError>;

    /// Release the resource.
    fn destroy_channel(&self, id: BackendChannelId) -> Result<(), DemuxError>;
}
