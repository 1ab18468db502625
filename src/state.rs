//! Mutable per-file state shared by the copier, puller and finisher
//! stages during a pull.

use crate::protocol::{BlockInfo, FileInfo};
use anyhow::{anyhow, bail, Error, Result};
use log::info;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

/// Handed to the copier stage, one per file with blocks to acquire.
pub struct CopyBlocksState {
    pub state: Arc<SharedPullerState>,
    /// The blocks not already present in a reusable temp.
    pub blocks: Vec<BlockInfo>,
}

/// Handed to the puller stage, one per block that no local file could
/// satisfy.
pub struct PullBlockState {
    pub state: Arc<SharedPullerState>,
    pub block: BlockInfo,
}

#[derive(Default)]
struct Inner {
    fd: Option<Arc<File>>,
    err: Option<Error>,
    copy_needed: usize,
    pull_total: usize,
    pull_needed: usize,
    copy_origin: usize,
    closed: bool,
}

pub struct SharedPullerState {
    pub file: FileInfo,
    pub folder: String,
    pub temp_name: PathBuf,
    pub real_name: PathBuf,
    /// Number of target blocks already present in the reused temp file.
    pub reused: usize,
    copy_total: usize,
    inner: Mutex<Inner>,
}

impl SharedPullerState {
    pub fn new(
        file: FileInfo,
        folder: String,
        temp_name: PathBuf,
        real_name: PathBuf,
        copy_blocks: usize,
        reused: usize,
    ) -> Self {
        Self {
            file,
            folder,
            temp_name,
            real_name,
            reused,
            copy_total: copy_blocks,
            inner: Mutex::new(Inner {
                copy_needed: copy_blocks,
                ..Default::default()
            }),
        }
    }

    /// Open the temp file if it is not yet open and return a handle good
    /// for positional writes. With nothing reused the open is
    /// exclusive-create, so a stale temp the orchestrator failed to
    /// remove surfaces as an error instead of being overwritten.
    pub fn temp_file(&self) -> Result<Arc<File>> {
        let mut inner = self.inner.lock();
        if let Some(err) = &inner.err {
            bail!("{err:#}");
        }
        if let Some(fd) = &inner.fd {
            return Ok(fd.clone());
        }

        let mut opts = OpenOptions::new();
        opts.write(true);
        if self.reused == 0 {
            opts.create_new(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o644);
        }

        match opts.open(&self.temp_name) {
            Ok(fd) => {
                let fd = Arc::new(fd);
                inner.fd = Some(fd.clone());
                Ok(fd)
            }
            Err(e) => {
                let msg = format!("dst create: {e}");
                self.early_close_locked(&mut inner, "dst create", e.into());
                Err(anyhow!(msg))
            }
        }
    }

    /// A block was satisfied from the target file's own old contents.
    pub fn copied_from_origin(&self) {
        self.inner.lock().copy_origin += 1;
    }

    pub fn copy_done(&self) {
        let mut inner = self.inner.lock();
        inner.copy_needed -= 1;
    }

    /// Move one block from the copy-needed column to the pull-needed one.
    pub fn pull_started(&self) {
        let mut inner = self.inner.lock();
        inner.copy_needed -= 1;
        inner.pull_total += 1;
        inner.pull_needed += 1;
    }

    pub fn pull_done(&self) {
        let mut inner = self.inner.lock();
        inner.pull_needed -= 1;
    }

    /// Record the first failure and close the temp handle. Failures after
    /// the first are ignored.
    pub fn early_close(&self, context: &str, err: Error) {
        let mut inner = self.inner.lock();
        self.early_close_locked(&mut inner, context, err);
    }

    fn early_close_locked(&self, inner: &mut Inner, context: &str, err: Error) {
        if inner.err.is_some() {
            return;
        }
        info!(
            "puller (folder {:?}, file {:?}): {}: {:#}",
            self.folder, self.file.name, context, err
        );
        inner.err = Some(err);
        inner.fd = None;
    }

    /// Whether a failure has been recorded.
    pub fn failed(&self) -> bool {
        self.inner.lock().err.is_some()
    }

    /// Progress counters: (copy total, copy needed, pull total, pull
    /// needed, copied from origin).
    pub fn progress(&self) -> (usize, usize, usize, usize, usize) {
        let inner = self.inner.lock();
        (
            self.copy_total,
            inner.copy_needed,
            inner.pull_total,
            inner.pull_needed,
            inner.copy_origin,
        )
    }

    /// The terminal transition. Returns `Some` exactly once, after all
    /// block work is accounted for or the state has failed, carrying the
    /// first recorded error; `None` on every other call. Whoever receives
    /// `Some` owns finishing the file.
    pub fn final_close(&self) -> Option<Result<()>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        if inner.copy_needed + inner.pull_needed != 0 && inner.err.is_none() {
            return None;
        }
        inner.closed = true;
        inner.fd = None;
        Some(match inner.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        })
    }
}
