//! Send side of a relaydrop exchange.
//!
//! A [`SendFilesBubble`] pushes one batch of local files down an already
//! established connection: the route (receiver manifest), the file manifest
//! and the content of every file, streamed in flushed chunks. Progress is
//! reported to subscribers as [`SendFilesEvent`]s.

mod send_files;

use std::path::{Path, PathBuf};

use relaydropx_common::{DEFAULT_CHUNK_SIZE, TransferError, TransferResult};

pub use send_files::*;

/// A local file selected for sending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SenderFile {
    /// Name announced on the wire, never a path.
    pub name: String,
    pub path: PathBuf,
}

impl SenderFile {
    /// Uses the last component of `path` as the announced name.
    pub fn from_path(path: impl AsRef<Path>) -> TransferResult<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                TransferError::storage(
                    path,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "path has no usable file name",
                    ),
                )
            })?;
        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct SenderConfig {
    /// Largest content chunk written before a flush.
    pub chunk_size: u64,
    /// Remove the source files once the whole batch went out. Files shared
    /// by several deliveries must not use this.
    pub delete_sources: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            delete_sources: false,
        }
    }
}

impl SenderConfig {
    pub fn high_performance() -> Self {
        Self {
            chunk_size: 4 * 1024 * 1024, // 4MB chunks
            ..Self::default()
        }
    }

    pub fn balanced() -> Self {
        Self::default()
    }

    pub fn low_bandwidth() -> Self {
        Self {
            chunk_size: 64 * 1024, // 64KB chunks
            ..Self::default()
        }
    }
}
