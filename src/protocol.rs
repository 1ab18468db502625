//! Cluster data model: devices, files and content-addressed blocks

use std::fmt;

/// Uniform block size. Every block of a file is this long except possibly
/// the last one.
pub const BLOCK_SIZE: u64 = 128 * 1024;

/// Width of a block content hash (blake3).
pub const HASH_LEN: usize = 32;

/// Content hash of a single block.
pub type BlockHash = [u8; HASH_LEN];

/// Flags word layout: the low nine bits are POSIX mode bits, the high bits
/// encode the entry type.
pub const FLAG_DELETED: u32 = 1 << 12;
pub const FLAG_DIRECTORY: u32 = 1 << 14;

/// Identifies a device in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub [u8; 32]);

impl DeviceId {
    /// The id of this device itself.
    pub const LOCAL: DeviceId = DeviceId([0xff; 32]);
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The leading bytes are enough to tell devices apart in logs.
        for b in &self.0[..6] {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

/// One contiguous region of a file, identified by its content hash.
///
/// Offsets are not carried on the wire; they are derived locally by
/// prefix-summing sizes (see `scanner::populate_offsets`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub offset: u64,
    pub size: u32,
    pub hash: BlockHash,
}

/// Index entry for one file, directory or deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// Path within the folder, forward-slash separated.
    pub name: String,
    pub flags: u32,
    /// Modification time in whole seconds since the epoch.
    pub modified: i64,
    /// Monotonically increasing version counter.
    pub version: u64,
    pub blocks: Vec<BlockInfo>,
}

impl FileInfo {
    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    /// The POSIX permission bits of the entry.
    pub fn mode(&self) -> u32 {
        self.flags & 0o777
    }

    /// Total size in bytes, summed over the block list.
    pub fn size(&self) -> u64 {
        self.blocks.iter().map(|b| u64::from(b.size)).sum()
    }
}
