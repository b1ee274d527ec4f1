use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by channel creation, attachment, and consumption.
///
/// "Full" (producer) and "empty" (consumer) are ordinary return values
/// expressed as `None`, not errors; everything here requires caller
/// intervention.
#[derive(Debug, Error)]
pub enum Error {
    /// The shared-memory object could not be created or opened.
    ///
    /// On the consumer side this usually means the producer is not running.
    #[error("failed to create or open shared-memory segment for topic {topic:?}: {source}")]
    OpenFailed {
        topic: String,
        #[source]
        source: io::Error,
    },

    /// The segment exists but mapping it into the address space failed.
    #[error("failed to map shared-memory segment for topic {topic:?}: {source}")]
    MapFailed {
        topic: String,
        #[source]
        source: io::Error,
    },

    /// The segment exists but does not carry the channel magic. Either it
    /// belongs to another application or it is a corrupt leftover.
    #[error(
        "segment for topic {topic:?} is not a broadcast channel \
         (magic {found:#018x}); remove it with `unlink` and restart the producer"
    )]
    StaleMemory { topic: String, found: u64 },

    /// The segment speaks a different protocol version than this build.
    #[error(
        "protocol version mismatch on topic {topic:?}: segment has v{found}, \
         this build speaks v{expected}"
    )]
    VersionMismatch {
        topic: String,
        found: u32,
        expected: u32,
    },

    /// The record layout or ring geometry in the segment disagrees with the
    /// types this process was compiled against.
    #[error(
        "layout mismatch on topic {topic:?}: {field} is {found}, expected {expected}"
    )]
    LayoutMismatch {
        topic: String,
        field: &'static str,
        found: u64,
        expected: u64,
    },

    /// A consumer id outside `0..MAX_CONSUMERS` was requested.
    #[error("consumer id {id} out of range (0..{max})")]
    InvalidConsumerId { id: usize, max: usize },

    /// The consumer found its active flag cleared: the producer (or the
    /// admin tool) evicted it. The caller must re-attach.
    #[error("consumer {id} was disconnected by the producer; re-attach to resume")]
    Disconnected { id: usize },
}
