//! Bounded cache of read-only source file handles.
//!
//! A copier working through a large file opens the same few source files
//! over and over; caching the descriptors avoids that. The cache is
//! confined to one copier processing one target file and is cleared in
//! between. Eviction is approximate LFU: when the cache is full, the
//! least-used entries are dropped until the target size is reached, and
//! dropping an entry closes its handle once no reader still holds it.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const UPPER_BOUND: usize = 50;
const LOWER_BOUND: usize = 20;

struct Entry {
    fd: Arc<File>,
    uses: u64,
}

pub struct FdCache {
    entries: HashMap<PathBuf, Entry>,
    upper: usize,
    lower: usize,
}

impl Default for FdCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FdCache {
    pub fn new() -> Self {
        Self::with_bounds(UPPER_BOUND, LOWER_BOUND)
    }

    pub fn with_bounds(upper: usize, lower: usize) -> Self {
        Self {
            entries: HashMap::new(),
            upper,
            lower: lower.min(upper),
        }
    }

    pub fn get(&mut self, path: &Path) -> Option<Arc<File>> {
        let entry = self.entries.get_mut(path)?;
        entry.uses += 1;
        Some(entry.fd.clone())
    }

    /// Cache `fd` under `path`, evicting down to the lower bound first if
    /// the cache is full.
    pub fn insert(&mut self, path: PathBuf, fd: File) -> Arc<File> {
        if self.entries.len() >= self.upper {
            self.evict_to(self.lower);
        }
        let fd = Arc::new(fd);
        self.entries.insert(
            path,
            Entry {
                fd: fd.clone(),
                uses: 1,
            },
        );
        fd
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every cached handle.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_to(&mut self, target: usize) {
        let excess = self.entries.len().saturating_sub(target);
        if excess == 0 {
            return;
        }
        let mut by_use: Vec<(u64, PathBuf)> = self
            .entries
            .iter()
            .map(|(path, entry)| (entry.uses, path.clone()))
            .collect();
        by_use.sort();
        for (_, path) in by_use.into_iter().take(excess) {
            self.entries.remove(&path);
        }
    }
}
