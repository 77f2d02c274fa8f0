//! Receive-side library for relaydrop transfers.
//!
//! A [`ReceiveFilesBubble`] drives one inbound data connection to completion,
//! materializing every announced file under a destination directory. It
//! exposes:
//! - Receiver configuration presets (chunk sizing).
//! - Events and subscription (see [`ReceiveFilesEvent`]) to observe the
//!   receiver manifest and per-file progress.
//!
//! Typical flow:
//! 1. Build a `ReceiveFilesBubble` with a `ReceiverConfig`.
//! 2. Subscribe to observe events.
//! 3. Call `ReceiveFilesBubble::run` with a connected stream and a directory.
//!    The bubble may be run again for the next connection.
//! 4. Inspect the returned [`ReceiveOutcome`]: `Idle` when the peer closed the
//!    connection without sending anything, otherwise the received batch.

mod receive_files;

pub use receive_files::*;

/// Tunable settings that influence how content is pulled off the wire.
///
/// - `chunk_size` bounds how much content is read from the connection before
///   being written to disk. It does not need to match the sender's chunking.
///
/// Use one of the presets (`high_performance`, `balanced`, `low_bandwidth`) or
/// construct/override as needed.
#[derive(Clone, Debug)]
pub struct ReceiverConfig {
    /// Read buffer size in bytes for incoming file content.
    pub chunk_size: u64,
}

impl Default for ReceiverConfig {
    /// Returns the balanced preset: 512 KiB reads.
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 512, // 512KB chunks
        }
    }
}

impl ReceiverConfig {
    /// Preset for fast links: 2 MiB reads.
    pub fn high_performance() -> Self {
        Self {
            chunk_size: 1024 * 1024 * 2, // 2MB chunks
        }
    }

    /// Alias of `Default::default()` returning a balanced configuration.
    pub fn balanced() -> Self {
        Self::default()
    }

    /// Preset tuned for constrained devices: 64 KiB reads.
    pub fn low_bandwidth() -> Self {
        Self {
            chunk_size: 1024 * 64, // 64KB chunks
        }
    }
}
