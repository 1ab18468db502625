//! End-to-end pull scenarios over a real filesystem, with a scripted
//! index and block transport standing in for the database and network.

use anyhow::{anyhow, Result};
use foldsync::activity::DeviceActivity;
use foldsync::config::{Config, FolderConfig, Options};
use foldsync::events::{Event, EventBus};
use foldsync::model::{BlockFinder, FolderState, Model};
use foldsync::protocol::{
    BlockHash, DeviceId, FileInfo, BLOCK_SIZE, FLAG_DELETED, FLAG_DIRECTORY,
};
use foldsync::puller::Puller;
use foldsync::scanner;
use foldsync::versioner::SimpleVersioner;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, UNIX_EPOCH};
use tempfile::TempDir;

const FOLDER: &str = "default";

fn dev(b: u8) -> DeviceId {
    DeviceId([b; 32])
}

#[derive(Default)]
struct TestModel {
    need: Mutex<Vec<FileInfo>>,
    current: Mutex<HashMap<String, FileInfo>>,
    updated: Mutex<Vec<String>>,
    versions: Mutex<VecDeque<u64>>,
    avail: Mutex<Vec<DeviceId>>,
    served: Mutex<HashMap<BlockHash, Vec<u8>>>,
    requests: AtomicUsize,
    states: Mutex<Vec<FolderState>>,
    invalidated: Mutex<Vec<String>>,
    fail_scan: AtomicBool,
}

impl TestModel {
    fn set_need(&self, files: Vec<FileInfo>) {
        *self.need.lock().unwrap() = files;
    }

    fn serve_blocks(&self, path: &Path) {
        let mut served = self.served.lock().unwrap();
        let data = fs::read(path).unwrap();
        for block in scanner::hash_file(path, BLOCK_SIZE).unwrap() {
            let start = block.offset as usize;
            let end = start + block.size as usize;
            served.insert(block.hash, data[start..end].to_vec());
        }
    }

    fn updated_names(&self) -> Vec<String> {
        self.updated.lock().unwrap().clone()
    }
}

impl Model for TestModel {
    fn with_need(&self, _folder: &str, _device: DeviceId, visit: &mut dyn FnMut(&FileInfo) -> bool) {
        let mut need = self.need.lock().unwrap().clone();
        need.sort_by(|a, b| a.name.cmp(&b.name));
        for file in &need {
            if !visit(file) {
                break;
            }
        }
    }

    fn current_folder_file(&self, _folder: &str, name: &str) -> Option<FileInfo> {
        self.current.lock().unwrap().get(name).cloned()
    }

    fn update_local(&self, _folder: &str, file: &FileInfo) {
        self.updated.lock().unwrap().push(file.name.clone());
        self.current
            .lock()
            .unwrap()
            .insert(file.name.clone(), file.clone());
        // A recorded item is no longer needed.
        self.need.lock().unwrap().retain(|f| f.name != file.name);
    }

    fn remote_local_version(&self, _folder: &str) -> u64 {
        let mut versions = self.versions.lock().unwrap();
        if versions.len() > 1 {
            versions.pop_front().unwrap()
        } else {
            versions.front().copied().unwrap_or(0)
        }
    }

    fn availability(&self, _folder: &str, _name: &str) -> Vec<DeviceId> {
        self.avail.lock().unwrap().clone()
    }

    fn request_global(
        &self,
        _device: DeviceId,
        _folder: &str,
        _name: &str,
        _offset: u64,
        _size: u32,
        hash: &BlockHash,
    ) -> Result<Vec<u8>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.served
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or_else(|| anyhow!("no device has this block"))
    }

    fn set_state(&self, _folder: &str, state: FolderState) {
        self.states.lock().unwrap().push(state);
    }

    fn scan_folder(&self, _folder: &str) -> Result<()> {
        if self.fail_scan.load(Ordering::SeqCst) {
            return Err(anyhow!("filesystem went away"));
        }
        Ok(())
    }

    fn invalidate_folder(&self, folder: &str, reason: &str) {
        self.invalidated
            .lock()
            .unwrap()
            .push(format!("{folder}: {reason}"));
    }
}

#[derive(Default)]
struct TestFinder {
    claims: Mutex<HashMap<BlockHash, Vec<(String, String, u32)>>>,
}

impl TestFinder {
    /// Register every block of the real file at `path` as claimed by
    /// `(folder, name)`.
    fn index_file(&self, folder: &str, name: &str, path: &Path) {
        let mut claims = self.claims.lock().unwrap();
        for (i, block) in scanner::hash_file(path, BLOCK_SIZE)
            .unwrap()
            .iter()
            .enumerate()
        {
            claims
                .entry(block.hash)
                .or_default()
                .push((folder.to_string(), name.to_string(), i as u32));
        }
    }

    fn claim(&self, hash: BlockHash, folder: &str, name: &str, index: u32) {
        self.claims
            .lock()
            .unwrap()
            .entry(hash)
            .or_default()
            .push((folder.to_string(), name.to_string(), index));
    }
}

impl BlockFinder for TestFinder {
    fn iterate(&self, hash: &BlockHash, visit: &mut dyn FnMut(&str, &str, u32) -> bool) -> bool {
        let claims = self
            .claims
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .unwrap_or_default();
        for (folder, name, index) in &claims {
            if visit(folder, name, *index) {
                return true;
            }
        }
        false
    }
}

struct Harness {
    dir: TempDir,
    cfg: Arc<Config>,
    model: Arc<TestModel>,
    finder: Arc<TestFinder>,
    events: Arc<EventBus>,
    activity: Arc<DeviceActivity>,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let cfg = Arc::new(Config {
            folders: vec![FolderConfig {
                id: FOLDER.into(),
                path: dir.path().to_path_buf(),
                scan_interval_sec: 0,
                ignore_perms: false,
                lenient_mtimes: false,
                invalid: String::new(),
            }],
            options: Options {
                keep_temporaries_h: 1,
            },
        });
        Self {
            dir,
            cfg,
            model: Arc::new(TestModel::default()),
            finder: Arc::new(TestFinder::default()),
            events: Arc::new(EventBus::new()),
            activity: Arc::new(DeviceActivity::new()),
        }
    }

    fn puller(&self) -> Puller {
        Puller::new(
            self.cfg.clone(),
            FOLDER,
            self.model.clone(),
            self.finder.clone(),
            None,
            self.events.clone(),
            self.activity.clone(),
        )
        .unwrap()
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(foldsync::tempname::temp_name(name))
    }
}

/// An index record for the contents of the real file at `path`. Offsets
/// are zeroed, as on the wire; the engine derives them itself.
fn file_record(name: &str, path: &Path, flags: u32, modified: i64) -> FileInfo {
    let mut blocks = scanner::hash_file(path, BLOCK_SIZE).unwrap();
    for block in &mut blocks {
        block.offset = 0;
    }
    FileInfo {
        name: name.into(),
        flags,
        modified,
        version: 1,
        blocks,
    }
}

fn write_pattern(path: &Path, len: usize, seed: u8) {
    let mut data = vec![0u8; len];
    let mut v = seed;
    for b in data.iter_mut() {
        *b = v;
        v = v.wrapping_mul(31).wrapping_add(7);
    }
    fs::write(path, data).unwrap();
}

#[test]
fn metadata_only_change_takes_shortcut() {
    let h = Harness::new();
    write_pattern(&h.path("a.txt"), 1000, 1);

    // The cluster agrees on the same content with new mode and mtime.
    let target = file_record("a.txt", &h.path("a.txt"), 0o755, 1_400_000_000);
    let current = file_record("a.txt", &h.path("a.txt"), 0o644, 1_300_000_000);
    h.model
        .current
        .lock()
        .unwrap()
        .insert("a.txt".into(), current);
    h.model.set_need(vec![target]);

    let rx = h.events.subscribe();
    assert_eq!(h.puller().pull_pass(), 1);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(h.path("a.txt")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }
    let modified = fs::metadata(h.path("a.txt")).unwrap().modified().unwrap();
    assert_eq!(modified, UNIX_EPOCH + Duration::from_secs(1_400_000_000));

    // No temp was created and no block crossed the network.
    assert!(!h.temp_path("a.txt").exists());
    assert_eq!(h.model.requests.load(Ordering::SeqCst), 0);
    assert_eq!(h.model.updated_names(), vec!["a.txt".to_string()]);

    let events: Vec<Event> = rx.try_iter().collect();
    assert!(events.contains(&Event::ItemStarted {
        folder: FOLDER.into(),
        item: "a.txt".into(),
    }));
}

#[test]
fn whole_file_is_assembled_from_local_blocks() {
    let h = Harness::new();
    write_pattern(&h.path("c.bin"), BLOCK_SIZE as usize + 100, 2);
    h.finder.index_file(FOLDER, "c.bin", &h.path("c.bin"));

    let target = file_record("b.bin", &h.path("c.bin"), 0o644, 1_400_000_000);
    h.model.set_need(vec![target]);

    assert_eq!(h.puller().pull_pass(), 1);

    assert_eq!(
        fs::read(h.path("b.bin")).unwrap(),
        fs::read(h.path("c.bin")).unwrap()
    );
    assert_eq!(h.model.requests.load(Ordering::SeqCst), 0);
    assert_eq!(h.model.updated_names(), vec!["b.bin".to_string()]);
    assert!(!h.temp_path("b.bin").exists());
}

#[test]
fn stale_temp_blocks_are_reused() {
    let h = Harness::new();

    // The finished file is two blocks; a previous attempt already saved
    // the first one in the temp.
    let mut content = vec![0u8; BLOCK_SIZE as usize + 64 * 1024];
    let mut v = 3u8;
    for b in content.iter_mut() {
        *b = v;
        v = v.wrapping_mul(31).wrapping_add(7);
    }
    let staging = h.dir.path().join("staging.bin");
    fs::write(&staging, &content).unwrap();
    fs::write(h.temp_path("d.bin"), &content[..BLOCK_SIZE as usize]).unwrap();

    let target = file_record("d.bin", &staging, 0o644, 1_400_000_000);
    h.model.serve_blocks(&staging);
    fs::remove_file(&staging).unwrap();
    *h.model.avail.lock().unwrap() = vec![dev(1)];
    h.model.set_need(vec![target]);

    assert_eq!(h.puller().pull_pass(), 1);

    assert_eq!(fs::read(h.path("d.bin")).unwrap(), content);
    // Only the missing second block was fetched.
    assert_eq!(h.model.requests.load(Ordering::SeqCst), 1);
    assert_eq!(h.model.updated_names(), vec!["d.bin".to_string()]);
}

#[test]
fn unavailable_source_fails_file_without_touching_target() {
    let h = Harness::new();

    let staging = h.dir.path().join("staging.bin");
    write_pattern(&staging, 4096, 4);
    let target = file_record("e.bin", &staging, 0o644, 1_400_000_000);
    fs::remove_file(&staging).unwrap();
    h.model.set_need(vec![target]);
    // No local claims, and availability comes back empty.

    assert_eq!(h.puller().pull_pass(), 1);

    assert!(!h.path("e.bin").exists());
    assert!(h.model.updated_names().is_empty());
    // The orphaned temp stays behind for the sweep.
    assert!(h.temp_path("e.bin").exists());
}

#[test]
fn failed_verification_discards_the_temp_quietly() {
    let h = Harness::new();

    // A local file claims the needed block, but its contents have
    // changed since the index last looked at it.
    let staging = h.dir.path().join("staging.bin");
    write_pattern(&staging, 4096, 5);
    let target = file_record("f.bin", &staging, 0o644, 1_400_000_000);
    fs::remove_file(&staging).unwrap();

    write_pattern(&h.path("liar.bin"), 4096, 6);
    h.finder
        .claim(target.blocks[0].hash, FOLDER, "liar.bin", 0);
    h.model.set_need(vec![target]);

    assert_eq!(h.puller().pull_pass(), 1);

    assert!(!h.path("f.bin").exists());
    assert!(h.model.updated_names().is_empty());
    assert!(h.temp_path("f.bin").exists());
}

#[test]
fn directories_are_created_before_children_and_deleted_after() {
    let h = Harness::new();

    // Outgoing tree that the cluster has deleted.
    fs::create_dir(h.path("olddir")).unwrap();
    write_pattern(&h.path("olddir/victim"), 100, 7);

    // Incoming tree: a directory and a file inside it, served remotely.
    let staging = h.dir.path().join("staging.bin");
    write_pattern(&staging, 4096, 8);
    let child = file_record("dir/child", &staging, 0o644, 1_400_000_000);
    h.model.serve_blocks(&staging);
    fs::remove_file(&staging).unwrap();
    *h.model.avail.lock().unwrap() = vec![dev(1)];

    h.model.set_need(vec![
        FileInfo {
            name: "dir".into(),
            flags: FLAG_DIRECTORY | 0o755,
            modified: 1_400_000_000,
            version: 1,
            blocks: vec![],
        },
        child,
        FileInfo {
            name: "olddir".into(),
            flags: FLAG_DIRECTORY | FLAG_DELETED,
            modified: 1_400_000_001,
            version: 2,
            blocks: vec![],
        },
        FileInfo {
            name: "olddir/victim".into(),
            flags: FLAG_DELETED,
            modified: 1_400_000_001,
            version: 2,
            blocks: vec![],
        },
    ]);

    assert_eq!(h.puller().pull_pass(), 4);

    assert!(h.path("dir").is_dir());
    assert!(h.path("dir/child").is_file());
    // remove_dir only succeeds on an empty directory, so olddir being
    // gone proves the victim went first.
    assert!(!h.path("olddir").exists());
    assert_eq!(h.model.updated_names().len(), 4);
}

#[test]
fn versioner_archives_replaced_and_deleted_files() {
    let h = Harness::new();

    fs::write(h.path("v.bin"), b"old v contents").unwrap();
    fs::write(h.path("w.txt"), b"old w contents").unwrap();

    // v.bin is replaced from the network, w.txt is deleted.
    let staging = h.dir.path().join("staging.bin");
    write_pattern(&staging, 4096, 9);
    let replacement = file_record("v.bin", &staging, 0o644, 1_400_000_000);
    h.model.serve_blocks(&staging);
    let new_content = fs::read(&staging).unwrap();
    fs::remove_file(&staging).unwrap();
    *h.model.avail.lock().unwrap() = vec![dev(1)];

    h.model.set_need(vec![
        replacement,
        FileInfo {
            name: "w.txt".into(),
            flags: FLAG_DELETED,
            modified: 1_400_000_001,
            version: 2,
            blocks: vec![],
        },
    ]);

    let versioner = Arc::new(SimpleVersioner::new(h.dir.path()));
    let puller = Puller::new(
        h.cfg.clone(),
        FOLDER,
        h.model.clone(),
        h.finder.clone(),
        Some(versioner),
        h.events.clone(),
        h.activity.clone(),
    )
    .unwrap();

    assert_eq!(puller.pull_pass(), 2);

    assert_eq!(fs::read(h.path("v.bin")).unwrap(), new_content);
    assert!(!h.path("w.txt").exists());

    let mut archived: Vec<String> = fs::read_dir(h.path(".versions"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    archived.sort();
    assert_eq!(archived.len(), 2);
    assert!(archived[0].starts_with("v.bin~"));
    assert!(archived[1].starts_with("w.txt~"));
}

#[test]
fn sweep_removes_only_expired_temporaries() {
    let h = Harness::new();

    let old_temp = h.temp_path("gone.bin");
    let fresh_temp = h.temp_path("active.bin");
    let regular = h.path("keeper.txt");
    fs::write(&old_temp, b"x").unwrap();
    fs::write(&fresh_temp, b"y").unwrap();
    fs::write(&regular, b"z").unwrap();

    // Older than the 1 hour keep limit; the regular file is older still
    // but not a temp.
    let two_hours_ago = now_secs() - 7200;
    foldsync::osutil::set_mtime(&old_temp, two_hours_ago).unwrap();
    foldsync::osutil::set_mtime(&regular, two_hours_ago - 7200).unwrap();

    h.puller().clean();

    assert!(!old_temp.exists());
    assert!(fresh_temp.exists());
    assert!(regular.exists());
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[test]
fn stop_terminates_the_control_loop() {
    let h = Harness::new();
    let puller = Arc::new(h.puller());

    let serving = puller.clone();
    let handle = thread::spawn(move || serving.serve());

    // Give the initial scan a moment, then stop.
    thread::sleep(Duration::from_millis(300));
    puller.stop();

    // Await the join with a timeout so a hung loop fails the test
    // instead of wedging it.
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    thread::spawn(move || {
        let _ = handle.join();
        let _ = done_tx.send(());
    });
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("serve did not exit after stop");

    let states = h.model.states.lock().unwrap().clone();
    assert!(states.contains(&FolderState::Scanning));
    assert_eq!(states.last(), Some(&FolderState::Idle));
}

#[test]
fn scan_failure_invalidates_the_folder() {
    let h = Harness::new();
    h.model.fail_scan.store(true, Ordering::SeqCst);

    let puller = Arc::new(h.puller());
    let serving = puller.clone();
    let handle = thread::spawn(move || serving.serve());

    // The failing initial scan makes serve exit on its own.
    handle.join().unwrap();

    let invalidated = h.model.invalidated.lock().unwrap().clone();
    assert_eq!(invalidated.len(), 1);
    assert!(invalidated[0].starts_with("default: "));
    assert!(invalidated[0].contains("filesystem went away"));
}

#[test]
fn rejects_invalid_folder_config() {
    let h = Harness::new();
    let mut cfg = (*h.cfg).clone();
    cfg.folders[0].invalid = "scan failed earlier".into();

    let res = Puller::new(
        Arc::new(cfg),
        FOLDER,
        h.model.clone(),
        h.finder.clone(),
        None,
        h.events.clone(),
        h.activity.clone(),
    );
    assert!(res.is_err());
}

#[test]
fn retreating_version_stamp_is_adopted() {
    let h = Harness::new();
    // The stamp reads 5 when the pull starts, then a peer disconnects
    // and every later read says 3. Nothing is actually needed.
    *h.model.versions.lock().unwrap() = VecDeque::from([5, 3]);

    let puller = Arc::new(h.puller());
    let serving = puller.clone();
    let handle = thread::spawn(move || serving.serve());

    // One pull fires at ~1s and rearms 10s out after going idle. If the
    // lower stamp was not adopted, the ~11s check would see 3 != 5 and
    // sync a second time.
    thread::sleep(Duration::from_millis(12_500));
    puller.stop();
    handle.join().unwrap();

    let syncing = h
        .model
        .states
        .lock()
        .unwrap()
        .iter()
        .filter(|s| **s == FolderState::Syncing)
        .count();
    assert_eq!(syncing, 1);
}
