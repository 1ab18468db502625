//! Interfaces to the index, the cluster and the block finder.
//!
//! The pull engine consumes these; the database and network layers
//! implement them.

use crate::protocol::{BlockHash, DeviceId, FileInfo};
use anyhow::Result;
use std::fmt;

/// Externally visible folder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderState {
    Idle,
    Scanning,
    Syncing,
}

impl fmt::Display for FolderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FolderState::Idle => write!(f, "idle"),
            FolderState::Scanning => write!(f, "scanning"),
            FolderState::Syncing => write!(f, "syncing"),
        }
    }
}

/// The index and cluster operations the pull engine relies on.
pub trait Model: Send + Sync {
    /// Visit the items `device` needs in `folder`, in lexicographic name
    /// order, until the visitor returns false or the snapshot is
    /// exhausted. The snapshot is self-consistent but may age while it is
    /// being walked.
    fn with_need(&self, folder: &str, device: DeviceId, visit: &mut dyn FnMut(&FileInfo) -> bool);

    /// The version of `name` currently recorded for the local device, or
    /// `None` when the index has no entry.
    fn current_folder_file(&self, folder: &str, name: &str) -> Option<FileInfo>;

    /// Record that the local copy of `file` is now at the given version.
    fn update_local(&self, folder: &str, file: &FileInfo);

    /// Opaque monotonic stamp of the latest index revision received from
    /// peers. Cheap to call.
    fn remote_local_version(&self, folder: &str) -> u64;

    /// The devices currently advertising `name` at its needed version.
    fn availability(&self, folder: &str, name: &str) -> Vec<DeviceId>;

    /// Fetch one block from `device`. Blocks until the data arrives or
    /// the request fails; timeouts are the transport's concern.
    fn request_global(
        &self,
        device: DeviceId,
        folder: &str,
        name: &str,
        offset: u64,
        size: u32,
        hash: &BlockHash,
    ) -> Result<Vec<u8>>;

    fn set_state(&self, folder: &str, state: FolderState);

    fn scan_folder(&self, folder: &str) -> Result<()>;

    /// Take the folder out of service, recording the reason.
    fn invalidate_folder(&self, folder: &str, reason: &str);
}

/// Answers which local files claim to hold a block with a given content
/// hash. Claims are taken from the index and may be stale; callers must
/// verify the data they read.
pub trait BlockFinder: Send + Sync {
    /// Invoke `visit(folder, name, block_index)` for every local claim on
    /// `hash`. The visitor returns true to stop; `iterate` returns whether
    /// it was stopped.
    fn iterate(&self, hash: &BlockHash, visit: &mut dyn FnMut(&str, &str, u32) -> bool) -> bool;
}
