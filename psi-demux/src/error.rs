//! Error types for the demux core.

use thiserror::Error;

/// Errors raised by the channel registry and the PSI decoders.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DemuxError {
    /// A section failed a header or length sanity check. The section is
    /// discarded; the parser and its channels stay alive.
    #[error("Malformed section: {0}")]
    MalformedSection(&'static str),

    /// The external demux collaborator could not provide a channel or
    /// filter resource.
    #[error("Demux resource error: {0}")]
    ResourceError(String),

    /// An operation would corrupt the registry (e.g. destroying a
    /// channel that still has attached filters).
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// The registry has been stopped and no longer hands out channels.
    #[error("Registry stopped")]
    Stopped,
}

/// Expected outcomes of [`PsiParser::wait`](crate::PsiParser::wait)
/// other than "parsing finished". Neither is a failure of the stream.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The timeout elapsed before the program picture became complete.
    #[error("Wait timed out")]
    TimedOut,

    /// `signal_quit()` or `close()` was called while waiting.
    #[error("Quit requested")]
    QuitRequested,
}
