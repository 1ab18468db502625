//! The folder pull engine.
//!
//! One `Puller` runs per synchronized folder. Its control loop
//! multiplexes three timer-driven activities: pulling needed items,
//! rescanning the folder, and sweeping orphaned temporaries. A pull pass
//! streams the needed items through a pipeline of worker stages: the
//! copier satisfies blocks from local files that already hold the same
//! content, the puller fetches the rest from the least busy peer, and
//! the finisher verifies the assembled temp and swaps it into place.

use crate::activity::DeviceActivity;
use crate::config::Config;
use crate::events::{Event, EventBus};
use crate::fdcache::FdCache;
use crate::model::{BlockFinder, FolderState, Model};
use crate::osutil;
use crate::protocol::{DeviceId, FileInfo, BLOCK_SIZE};
use crate::scanner;
use crate::state::{CopyBlocksState, PullBlockState, SharedPullerState};
use crate::tempname;
use crate::versioner::Versioner;
use anyhow::{anyhow, ensure, Context, Result};
use crossbeam_channel::{after, select, tick, unbounded, Receiver, Sender};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

// Copying is I/O bound and gains little from contention, while block
// fetches are independently network bound and want plenty of overlap.
const COPIERS_PER_FOLDER: usize = 1;
const PULLERS_PER_FOLDER: usize = 16;
const FINISHERS_PER_FOLDER: usize = 2;

const CHECK_PULL_INTV: Duration = Duration::from_secs(1);
const NEXT_PULL_INTV: Duration = Duration::from_secs(10);
const PAUSE_INTV: Duration = Duration::from_secs(60);
const CLEAN_INTV: Duration = Duration::from_secs(60 * 60);

fn err_no_device() -> anyhow::Error {
    anyhow!("no available source device")
}

pub struct Puller {
    folder: String,
    dir: PathBuf,
    scan_intv: Duration,
    ignore_perms: bool,
    lenient_mtimes: bool,
    cfg: Arc<Config>,
    model: Arc<dyn Model>,
    finder: Arc<dyn BlockFinder>,
    versioner: Option<Arc<dyn Versioner>>,
    events: Arc<EventBus>,
    activity: Arc<DeviceActivity>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl fmt::Display for Puller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "puller/{}", self.folder)
    }
}

impl Puller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<Config>,
        folder: &str,
        model: Arc<dyn Model>,
        finder: Arc<dyn BlockFinder>,
        versioner: Option<Arc<dyn Versioner>>,
        events: Arc<EventBus>,
        activity: Arc<DeviceActivity>,
    ) -> Result<Self> {
        let folder_cfg = cfg
            .folder(folder)
            .with_context(|| format!("folder {folder:?} is not configured"))?;
        ensure!(
            !folder_cfg.is_invalid(),
            "folder {:?} is invalid: {}",
            folder,
            folder_cfg.invalid
        );

        let (stop_tx, stop_rx) = unbounded();
        Ok(Self {
            folder: folder.to_string(),
            dir: folder_cfg.path.clone(),
            scan_intv: Duration::from_secs(u64::from(folder_cfg.scan_interval_sec)),
            ignore_perms: folder_cfg.ignore_perms,
            lenient_mtimes: folder_cfg.lenient_mtimes,
            cfg,
            model,
            finder,
            versioner,
            events,
            activity,
            stop_tx,
            stop_rx,
        })
    }

    /// Run scans and pulls until `stop()` is called or the folder hits a
    /// critical error.
    pub fn serve(&self) {
        debug!("{} starting", self);

        let mut pull_timer = after(CHECK_PULL_INTV);
        // The first scan should happen right away.
        let mut scan_timer = after(Duration::from_millis(1));
        let clean_ticker = tick(CLEAN_INTV);

        let mut prev_ver = 0u64;
        let mut initial_scan_completed = false;

        // Clean out old temporaries before we start pulling.
        self.clean();

        'outer: loop {
            select! {
                recv(self.stop_rx) -> _ => break 'outer,

                recv(pull_timer) -> _ => {
                    if !initial_scan_completed {
                        debug!("{} skip (initial)", self);
                        pull_timer = after(NEXT_PULL_INTV);
                    } else {
                        // remote_local_version is a fast call, it doesn't
                        // touch the database.
                        let mut cur_ver = self.model.remote_local_version(&self.folder);
                        if cur_ver == prev_ver {
                            debug!("{} skip (cur_ver == prev_ver) {}", self, prev_ver);
                            pull_timer = after(CHECK_PULL_INTV);
                        } else {
                            debug!("{} pulling {} -> {}", self, prev_ver, cur_ver);
                            self.set_state(FolderState::Syncing);
                            let mut tries = 0;
                            loop {
                                tries += 1;
                                let changed = self.puller_iteration(
                                    COPIERS_PER_FOLDER,
                                    PULLERS_PER_FOLDER,
                                    FINISHERS_PER_FOLDER,
                                );
                                debug!("{} changed {}", self, changed);

                                if changed == 0 {
                                    // Nothing left to do, we are in sync.
                                    // The device we needed files from may
                                    // have disconnected mid pass, taking
                                    // its index entries with it; in that
                                    // case the stamp has decreased and we
                                    // adopt the lower value, or we would
                                    // keep pulling forever.
                                    let latest = self.model.remote_local_version(&self.folder);
                                    if latest < cur_ver {
                                        debug!("{} adjusting cur_ver to {}", self, latest);
                                        cur_ver = latest;
                                    }
                                    prev_ver = cur_ver;
                                    pull_timer = after(NEXT_PULL_INTV);
                                    break;
                                }

                                if tries > 10 {
                                    // Likely write errors are blocking us.
                                    // Warn and back off instead of spinning.
                                    warn!(
                                        "folder {:?} isn't making progress - check logs for possible root cause; pausing puller for {:?}",
                                        self.folder, PAUSE_INTV
                                    );
                                    pull_timer = after(PAUSE_INTV);
                                    break;
                                }
                            }
                            self.set_state(FolderState::Idle);
                        }
                    }
                }

                // Running the scanner from within the puller guarantees the
                // two never run at the same time.
                recv(scan_timer) -> _ => {
                    debug!("{} rescan", self);
                    self.set_state(FolderState::Scanning);
                    if let Err(e) = self.model.scan_folder(&self.folder) {
                        self.model.invalidate_folder(&self.folder, &format!("{e:#}"));
                        break 'outer;
                    }
                    self.set_state(FolderState::Idle);
                    if !self.scan_intv.is_zero() {
                        scan_timer = after(self.scan_intv);
                    }
                    if !initial_scan_completed {
                        info!("completed initial scan of folder {:?}", self.folder);
                        initial_scan_completed = true;
                    }
                }

                recv(clean_ticker) -> _ => self.clean(),
            }
        }

        self.set_state(FolderState::Idle);
        debug!("{} exiting", self);
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    fn set_state(&self, state: FolderState) {
        debug!("folder {:?} state {}", self.folder, state);
        self.model.set_state(&self.folder, state);
        self.events.emit(Event::StateChanged {
            folder: self.folder.clone(),
            state,
        });
    }

    /// Run a single pull pass over everything currently needed, with the
    /// default worker counts. Returns the number of items handled, even
    /// ones that failed; zero means the folder was in sync.
    pub fn pull_pass(&self) -> usize {
        self.puller_iteration(COPIERS_PER_FOLDER, PULLERS_PER_FOLDER, FINISHERS_PER_FOLDER)
    }

    fn puller_iteration(&self, ncopiers: usize, npullers: usize, nfinishers: usize) -> usize {
        let (copy_tx, copy_rx) = unbounded::<CopyBlocksState>();
        let (pull_tx, pull_rx) = unbounded::<PullBlockState>();
        let (finisher_tx, finisher_rx) = unbounded::<Arc<SharedPullerState>>();

        let mut changed = 0;
        let mut deletions: Vec<FileInfo> = Vec::new();

        thread::scope(|s| {
            for _ in 0..ncopiers {
                let copy_rx = copy_rx.clone();
                let pull_tx = pull_tx.clone();
                let finisher_tx = finisher_tx.clone();
                s.spawn(move || self.copier_routine(copy_rx, pull_tx, finisher_tx));
            }
            for _ in 0..npullers {
                let pull_rx = pull_rx.clone();
                let finisher_tx = finisher_tx.clone();
                s.spawn(move || self.puller_routine(pull_rx, finisher_tx));
            }
            for _ in 0..nfinishers {
                let finisher_rx = finisher_rx.clone();
                s.spawn(move || self.finisher_routine(finisher_rx));
            }

            // The workers hold their own clones. Each stage ends when the
            // last sender for its channel goes away, so dropping these
            // here and copy_tx after the iteration shuts the pipeline
            // down leaf first.
            drop(pull_tx);
            drop(finisher_tx);
            drop(copy_rx);
            drop(pull_rx);
            drop(finisher_rx);

            // The needed list is a database snapshot and can age while we
            // work through it; a later pass re-reconciles anything missed.
            self.model
                .with_need(&self.folder, DeviceId::LOCAL, &mut |file| {
                    // Items arrive sorted by name, so a directory is
                    // handled before anything inside it.
                    self.events.emit(Event::ItemStarted {
                        folder: self.folder.clone(),
                        item: file.name.clone(),
                    });
                    debug!("{} handling {}", self, file.name);

                    if file.is_deleted() {
                        // Deletions are deferred to the end of the pass.
                        deletions.push(file.clone());
                    } else if file.is_directory() {
                        self.handle_dir(file);
                    } else {
                        self.handle_file(file, &copy_tx);
                    }
                    changed += 1;
                    true
                });

            drop(copy_tx);
            // Leaving the scope joins copiers, then pullers, then
            // finishers as their channels drain.
        });

        // Children before parents.
        for deletion in deletions.iter().rev() {
            if deletion.is_directory() {
                self.delete_dir(deletion);
            } else {
                self.delete_file(deletion);
            }
        }

        changed
    }

    /// Create or update one directory.
    fn handle_dir(&self, file: &FileInfo) {
        let real_name = self.dir.join(&file.name);
        let mode = if self.ignore_perms { 0o755 } else { file.mode() };

        match fs::metadata(&real_name) {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Create it with the right mode bits from the start. The
                // parent exists already thanks to the iteration order, so
                // a plain (non-recursive) create is enough.
                match osutil::in_writable_dir(|p| osutil::make_dir(p, mode), &real_name) {
                    Ok(()) => self.model.update_local(&self.folder, file),
                    Err(e) => info!("{} (dir {:?}): {}", self, file.name, e),
                }
            }
            Err(e) => {
                // If we can't even stat it, nothing else will work either.
                info!("{} (dir {:?}): {}", self, file.name, e);
            }
            Ok(meta) if !meta.is_dir() => {
                info!("{} (dir {:?}): should be dir, but is not", self, file.name);
            }
            Ok(_) => {
                // Exists already; correct the mode bits only. Directory
                // mtimes are left alone.
                if self.ignore_perms {
                    self.model.update_local(&self.folder, file);
                } else {
                    match osutil::set_mode(&real_name, mode) {
                        Ok(()) => self.model.update_local(&self.folder, file),
                        Err(e) => info!("{} (dir {:?}): {}", self, file.name, e),
                    }
                }
            }
        }
    }

    fn delete_dir(&self, file: &FileInfo) {
        let real_name = self.dir.join(&file.name);
        match osutil::in_writable_dir(|p| fs::remove_dir(p), &real_name) {
            Ok(()) => self.model.update_local(&self.folder, file),
            Err(e) if e.kind() == ErrorKind::NotFound => self.model.update_local(&self.folder, file),
            Err(e) => info!("{} (dir {:?}): delete: {}", self, file.name, e),
        }
    }

    fn delete_file(&self, file: &FileInfo) {
        let real_name = self.dir.join(&file.name);
        let res = match &self.versioner {
            Some(v) => osutil::in_writable_dir(
                |p| v.archive(p).map_err(std::io::Error::other),
                &real_name,
            ),
            None => osutil::in_writable_dir(|p| fs::remove_file(p), &real_name),
        };
        match res {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                info!("{} (file {:?}): delete: {}", self, file.name, e);
            }
            _ => self.model.update_local(&self.folder, file),
        }
    }

    /// Queue the copies and pulls necessary for one new or changed file.
    fn handle_file(&self, file: &FileInfo, copy_tx: &Sender<CopyBlocksState>) {
        if let Some(cur) = self.model.current_folder_file(&self.folder, &file.name) {
            if cur.blocks.len() == file.blocks.len()
                && cur
                    .blocks
                    .iter()
                    .zip(&file.blocks)
                    .all(|(a, b)| a.hash == b.hash)
            {
                // Every block is already in place; only metadata changed.
                debug!("{} taking shortcut on {}", self, file.name);
                self.shortcut_file(file);
                return;
            }
        }

        let mut file = file.clone();
        scanner::populate_offsets(&mut file.blocks);

        let temp_name = self.dir.join(tempname::temp_name(&file.name));
        let real_name = self.dir.join(&file.name);

        // An aborted pull may have left a temp holding some of the blocks
        // we need.
        let mut reused = 0;
        let blocks = match scanner::hash_file(&temp_name, BLOCK_SIZE) {
            Ok(temp_blocks) => {
                let existing: HashSet<_> = scanner::block_diff(&temp_blocks, &file.blocks)
                    .into_iter()
                    .map(|b| b.hash)
                    .collect();
                let blocks: Vec<_> = file
                    .blocks
                    .iter()
                    .filter(|b| !existing.contains(&b.hash))
                    .cloned()
                    .collect();
                reused = file.blocks.len() - blocks.len();
                blocks
            }
            Err(_) => file.blocks.clone(),
        };

        if reused == 0 {
            // Nothing worth keeping; remove any stale temp so the
            // exclusive create in temp_file() cannot collide with it.
            let _ = fs::remove_file(&temp_name);
        }

        debug!(
            "{} need file {}; copy {}, reused {}",
            self,
            file.name,
            blocks.len(),
            reused
        );

        let state = Arc::new(SharedPullerState::new(
            file,
            self.folder.clone(),
            temp_name,
            real_name,
            blocks.len(),
            reused,
        ));
        let _ = copy_tx.send(CopyBlocksState { state, blocks });
    }

    /// Apply mode and mtime when that is all that changed.
    fn shortcut_file(&self, file: &FileInfo) {
        let real_name = self.dir.join(&file.name);
        if !self.ignore_perms {
            if let Err(e) = osutil::set_mode(&real_name, file.mode()) {
                info!("{} (file {:?}): shortcut: {}", self, file.name, e);
                return;
            }
        }

        if let Err(e) = osutil::set_mtime(&real_name, file.modified) {
            if self.lenient_mtimes {
                // Accept the failure and sync the resulting mtime back
                // out to the cluster later.
                info!(
                    "{} (file {:?}): shortcut: {} (continuing anyway as requested)",
                    self, file.name, e
                );
            } else {
                info!("{} (file {:?}): shortcut: {}", self, file.name, e);
                return;
            }
        }

        self.model.update_local(&self.folder, file);
    }

    /// Satisfy blocks from local files claiming the same content, handing
    /// whatever is left to the puller stage.
    fn copier_routine(
        &self,
        in_rx: Receiver<CopyBlocksState>,
        pull_tx: Sender<PullBlockState>,
        out_tx: Sender<Arc<SharedPullerState>>,
    ) {
        let mut buf = vec![0u8; BLOCK_SIZE as usize];

        for cs in in_rx.iter() {
            let state = &cs.state;
            let Ok(dst_fd) = state.temp_file() else {
                // The open failure was recorded and logged by the state.
                continue;
            };

            let mut fd_cache = FdCache::new();

            for block in &cs.blocks {
                let buf = &mut buf[..block.size as usize];

                let success = self.finder.iterate(&block.hash, &mut |folder, name, index| {
                    let Some(folder_path) = self.cfg.folder_path(folder) else {
                        return false;
                    };
                    let path = folder_path.join(name);

                    let fd = match fd_cache.get(&path) {
                        Some(fd) => fd,
                        None => match File::open(&path) {
                            Ok(fd) => fd_cache.insert(path.clone(), fd),
                            Err(_) => return false,
                        },
                    };

                    // A claim that can't be read is just a bad candidate;
                    // move on to the next one.
                    if osutil::read_exact_at(&fd, buf, BLOCK_SIZE * u64::from(index)).is_err() {
                        return false;
                    }

                    if let Err(e) = osutil::write_all_at(&dst_fd, buf, block.offset) {
                        state.early_close("dst write", e.into());
                    }
                    if folder == state.folder && name == state.file.name {
                        state.copied_from_origin();
                    }
                    true
                });

                if state.failed() {
                    break;
                }

                if success {
                    state.copy_done();
                } else {
                    state.pull_started();
                    let _ = pull_tx.send(PullBlockState {
                        state: state.clone(),
                        block: block.clone(),
                    });
                }
            }

            fd_cache.clear();
            let _ = out_tx.send(state.clone());
        }
    }

    /// Fetch blocks over the network from the least busy device
    /// advertising the file.
    fn puller_routine(&self, in_rx: Receiver<PullBlockState>, out_tx: Sender<Arc<SharedPullerState>>) {
        for ps in in_rx.iter() {
            let state = &ps.state;
            if state.failed() {
                // Something else already killed this file.
                continue;
            }

            // No feasible device fails the block, and in the long run the
            // file.
            let candidates = self.model.availability(&state.folder, &state.file.name);
            let Some(selected) = self.activity.least_busy(&candidates) else {
                state.early_close("pull", err_no_device());
                continue;
            };

            // We don't need the fd until the block has arrived, but if
            // the temp can't be opened there is no point in hitting the
            // network at all.
            let Ok(fd) = state.temp_file() else {
                continue;
            };

            // Mark the device as in use for the duration of the request,
            // so least_busy steers the next block elsewhere.
            self.activity.using(selected);
            let res = self.model.request_global(
                selected,
                &state.folder,
                &state.file.name,
                ps.block.offset,
                ps.block.size,
                &ps.block.hash,
            );
            self.activity.done(selected);

            let data = match res {
                Ok(data) => data,
                Err(e) => {
                    state.early_close("pull", e);
                    continue;
                }
            };

            if let Err(e) = osutil::write_all_at(&fd, &data, ps.block.offset) {
                state.early_close("save", e.into());
                continue;
            }

            debug!(
                "{} pulled block at {} of {} from {}",
                self, ps.block.offset, state.file.name, selected
            );
            state.pull_done();
            let _ = out_tx.send(state.clone());
        }
    }

    /// Verify, fix up metadata, archive the old version and swap the new
    /// file into place. States come through once per completed block;
    /// only the observation that accounts for the last one performs the
    /// terminal transition, the rest are no-ops.
    fn finisher_routine(&self, in_rx: Receiver<Arc<SharedPullerState>>) {
        for state in in_rx.iter() {
            let Some(res) = state.final_close() else {
                continue;
            };
            debug!("{} closing {}", self, state.file.name);

            if let Err(e) = res {
                // The temp stays behind for the next pass or the sweep.
                warn!("puller: final: {:#}", e);
                continue;
            }

            // Verify the temp against the expected block hashes before it
            // goes anywhere near the real name.
            let mut fd = match File::open(&state.temp_name) {
                Ok(fd) => fd,
                Err(e) => {
                    warn!("puller: final: {}", e);
                    continue;
                }
            };
            let verified = scanner::verify(&mut fd, BLOCK_SIZE, &state.file.blocks);
            drop(fd);
            if let Err(e) = verified {
                info!(
                    "puller: {}: {:#} (file changed during pull?)",
                    state.file.name, e
                );
                continue;
            }

            if !self.ignore_perms {
                if let Err(e) = osutil::set_mode(&state.temp_name, state.file.mode()) {
                    warn!("puller: final: {}", e);
                    continue;
                }
            }

            if let Err(e) = osutil::set_mtime(&state.temp_name, state.file.modified) {
                if self.lenient_mtimes {
                    info!(
                        "{} (file {:?}): final: {} (continuing anyway as requested)",
                        self, state.file.name, e
                    );
                } else {
                    warn!("puller: final: {}", e);
                    continue;
                }
            }

            // Let the versioner put the old version aside before we
            // replace it; archiving a file that does not exist is fine.
            if let Some(v) = &self.versioner {
                if let Err(e) = v.archive(&state.real_name) {
                    warn!("puller: final: {:#}", e);
                    continue;
                }
            }

            if let Err(e) = osutil::rename(&state.temp_name, &state.real_name) {
                warn!("puller: final: {}", e);
                continue;
            }

            self.model.update_local(&self.folder, &state.file);
        }
    }

    /// Unlink orphaned temporaries that have outlived the configured keep
    /// time.
    pub fn clean(&self) {
        let keep = Duration::from_secs(u64::from(self.cfg.options.keep_temporaries_h) * 3600);
        let now = SystemTime::now();

        for entry in WalkDir::new(&self.dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || !tempname::is_temporary(entry.path()) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            if modified + keep < now {
                debug!("{} sweeping stale temp {}", self, entry.path().display());
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}
