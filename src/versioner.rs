//! Archival of replaced file versions

use crate::osutil;
use anyhow::{Context, Result};
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory under the folder root where archived versions live.
const VERSIONS_DIR: &str = ".versions";

const DEFAULT_KEEP: usize = 5;

/// Puts the previous version of a path aside instead of discarding it.
pub trait Versioner: Send + Sync {
    /// Move `path` out of the way. Archiving a path that does not exist
    /// is success.
    fn archive(&self, path: &Path) -> Result<()>;
}

/// Keeps dated copies under `.versions/` at the folder root, mirroring
/// the folder's directory structure. Old copies beyond the keep limit are
/// pruned, oldest first.
pub struct SimpleVersioner {
    folder_path: PathBuf,
    keep: usize,
}

impl SimpleVersioner {
    pub fn new<P: Into<PathBuf>>(folder_path: P) -> Self {
        Self {
            folder_path: folder_path.into(),
            keep: DEFAULT_KEEP,
        }
    }

    pub fn keep(mut self, n: usize) -> Self {
        self.keep = n.max(1);
        self
    }

    fn prune(&self, dir: &Path, base: &str) -> Result<()> {
        let prefix = format!("{base}~");
        let mut versions: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix))
            })
            .collect();

        // The timestamp suffix sorts lexicographically, oldest first.
        versions.sort();
        for old in versions.iter().rev().skip(self.keep) {
            let _ = fs::remove_file(old);
        }
        Ok(())
    }
}

impl Versioner for SimpleVersioner {
    fn archive(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        let rel = path
            .strip_prefix(&self.folder_path)
            .with_context(|| format!("{} is outside the folder", path.display()))?;
        let base = rel
            .file_name()
            .and_then(|n| n.to_str())
            .context("path has no file name")?
            .to_string();

        let target_dir = self
            .folder_path
            .join(VERSIONS_DIR)
            .join(rel.parent().unwrap_or_else(|| Path::new("")));
        fs::create_dir_all(&target_dir)
            .with_context(|| format!("create {}", target_dir.display()))?;

        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let target = target_dir.join(format!("{base}~{stamp}"));
        osutil::rename(path, &target)
            .with_context(|| format!("archive {} to {}", path.display(), target.display()))?;

        self.prune(&target_dir, &base)
    }
}
