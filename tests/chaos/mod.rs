//! Chaos testing for Verspace
//!
//! Injects write, rename, read, removal and copy failures through a
//! [`FileSystem`] implementation and corrupts stored data out-of-band, then
//! checks that live files and version history stay consistent.

use ::verspace::*;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use tracing::info;

/// Which operation a fault applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
    Rename,
    Remove,
    Copy,
}

/// A fault firing on paths containing `needle`
///
/// The first `skip` matching calls pass; the next `times` calls fail.
#[derive(Debug, Clone)]
pub struct Fault {
    pub op: Op,
    pub needle: String,
    pub skip: usize,
    pub times: usize,
}

/// Filesystem that fails selected operations
#[derive(Debug, Default)]
pub struct ChaosFileSystem {
    inner: StdFileSystem,
    faults: Mutex<Vec<Fault>>,
    pub injected: AtomicUsize,
}

impl ChaosFileSystem {
    /// Fail the matching call after `skip` successes, once
    pub fn inject(&self, op: Op, needle: impl Into<String>, skip: usize) {
        self.push(Fault {
            op,
            needle: needle.into(),
            skip,
            times: 1,
        });
    }

    /// Fail every matching call
    pub fn inject_always(&self, op: Op, needle: impl Into<String>) {
        self.push(Fault {
            op,
            needle: needle.into(),
            skip: 0,
            times: usize::MAX,
        });
    }

    fn push(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    pub fn clear(&self) {
        self.faults.lock().clear();
    }

    fn check(&self, op: Op, path: &Path) -> io::Result<()> {
        let text = path.to_string_lossy();
        let mut faults = self.faults.lock();
        let Some(index) = faults.iter().position(|f| f.op == op && text.contains(&f.needle)) else {
            return Ok(());
        };
        let fault = &mut faults[index];
        if fault.skip > 0 {
            fault.skip -= 1;
            return Ok(());
        }
        fault.times -= 1;
        if fault.times == 0 {
            faults.remove(index);
        }
        self.injected.fetch_add(1, Ordering::SeqCst);
        Err(io::Error::new(io::ErrorKind::Other, format!("chaos: {:?} {:?}", op, path)))
    }
}

impl FileSystem for ChaosFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.check(Op::Read, path)?;
        self.inner.read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        if let Err(e) = self.check(Op::Write, path) {
            // A torn write leaves a prefix behind
            self.inner.write(path, &contents[..contents.len() / 3])?;
            return Err(e);
        }
        self.inner.write(path, contents)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.check(Op::Rename, to)?;
        self.inner.rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.check(Op::Remove, path)?;
        self.inner.remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_dir_all(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.inner.read_dir(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn metadata(&self, path: &Path) -> io::Result<fs::Metadata> {
        self.inner.metadata(path)
    }

    fn set_permissions(&self, path: &Path, permissions: fs::Permissions) -> io::Result<()> {
        self.inner.set_permissions(path, permissions)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        self.check(Op::Copy, to)?;
        self.inner.copy(from, to)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        self.inner.read_link(path)
    }

    fn symlink(&self, original: &Path, link: &Path) -> io::Result<()> {
        self.inner.symlink(original, link)
    }
}

/// Keeper wired to a chaos filesystem, with one space
pub struct ChaosHarness {
    pub temp_dir: TempDir,
    pub chaos: Arc<ChaosFileSystem>,
    pub keeper: VersionKeeper,
    pub space: Space,
}

impl ChaosHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let chaos = Arc::new(ChaosFileSystem::default());
        let keeper = VersionKeeper::builder()
            .filesystem(chaos.clone())
            .build()
            .unwrap();
        let space = keeper.create_space(temp_dir.path()).unwrap();
        Self {
            temp_dir,
            chaos,
            keeper,
            space,
        }
    }

    pub fn file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.space.root().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    /// No temp files left next to live files or blobs
    pub fn assert_no_temp_files(&self) {
        let leftovers: Vec<_> = walkdir::WalkDir::new(self.space.root())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .map(|e| e.path().to_path_buf())
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {:?}", leftovers);
    }
}

#[test]
fn test_failed_restore_write_leaves_live_file_intact() {
    let h = ChaosHarness::new();
    let file = h.file("report.txt", b"version one");
    let target = h.keeper.capture(&h.space, &file, None).unwrap();
    h.file("report.txt", b"current unsaved work");

    // Writes of the live file's temp sibling fail
    h.chaos.inject(Op::Write, ".report.txt.", 0);
    let err = h
        .keeper
        .restore(&h.space, &file, &target.short_id(), None)
        .unwrap_err();
    assert!(matches!(err, VersionError::RestorationFailed(_)), "{:?}", err);
    assert_eq!(fs::read(&file).unwrap(), b"current unsaved work");
    h.assert_no_temp_files();
}

#[test]
fn test_failed_commit_rename_leaves_live_file_intact() {
    let h = ChaosHarness::new();
    let file = h.file("data.csv", b"a,b\n1,2\n");
    let target = h.keeper.capture(&h.space, &file, None).unwrap();
    h.file("data.csv", b"a,b\n3,4\n");

    let live = file.to_string_lossy().into_owned();
    h.chaos.inject(Op::Rename, live, 0);
    assert!(h.keeper.restore(&h.space, &file, &target.short_id(), None).is_err());
    assert_eq!(fs::read(&file).unwrap(), b"a,b\n3,4\n");
}

#[test]
fn test_rollback_failure_is_escalated() {
    let h = ChaosHarness::new();
    let file = h.file("ledger.txt", b"old");
    let target = h.keeper.capture(&h.space, &file, None).unwrap();
    h.file("ledger.txt", b"new");

    // The restore write lands, verification cannot read it back, and the
    // rollback write fails as well
    let name = file.to_string_lossy().into_owned();
    h.chaos.inject(Op::Read, name.clone(), 1);
    h.chaos.inject(Op::Write, ".ledger.txt.", 1);

    let err = h
        .keeper
        .restore(&h.space, &file, &target.short_id(), None)
        .unwrap_err();
    assert!(err.is_rollback_failure(), "{:?}", err);
    if let VersionError::RollbackFailed { backup, .. } = &err {
        let backup = backup.as_ref().expect("backup location");
        assert_eq!(fs::read(backup).unwrap(), b"new");
    }
}

#[test]
fn test_tampered_blob_never_returns_wrong_bytes() {
    let h = ChaosHarness::new();
    let file = h.file("photo.raw", &[7u8; 512]);
    let version = h.keeper.capture(&h.space, &file, None).unwrap();

    let mut blob = fs::read(&version.storage_path).unwrap();
    blob[100] ^= 0xff;
    fs::write(&version.storage_path, &blob).unwrap();

    assert!(h.keeper.read(&version).unwrap_err().is_corruption());

    h.file("photo.raw", &[1u8; 16]);
    let err = h
        .keeper
        .restore(&h.space, &file, &version.short_id(), None)
        .unwrap_err();
    assert!(err.is_corruption());
    assert_eq!(fs::read(&file).unwrap(), vec![1u8; 16]);
}

#[test]
fn test_capture_failures_leave_no_partial_state() {
    let h = ChaosHarness::new();
    let file = h.file("page.md", b"# hello");

    h.chaos.inject(Op::Write, "file_metadata", 0);
    assert!(h.keeper.capture(&h.space, &file, None).is_err());
    h.chaos.clear();

    h.chaos.inject(Op::Write, ".blob", 0);
    assert!(h.keeper.capture(&h.space, &file, None).is_err());
    h.chaos.clear();

    assert!(h.keeper.list_versions(&h.space, &file).unwrap().is_empty());
    let blobs: usize = walkdir::WalkDir::new(h.space.root().join(".control/file_versions"))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count();
    assert_eq!(blobs, 0);
    h.assert_no_temp_files();

    let version = h.keeper.capture(&h.space, &file, None).unwrap();
    assert_eq!(h.keeper.read(&version).unwrap(), b"# hello");
}

#[test]
fn test_random_record_corruption_is_isolated() {
    let h = ChaosHarness::new();
    let mut rng = StdRng::seed_from_u64(42);
    let file = h.file("log.txt", b"");

    let mut versions = Vec::new();
    for i in 0..20 {
        h.file("log.txt", format!("entry {}", i).as_bytes());
        versions.push(h.keeper.capture(&h.space, &file, None).unwrap());
    }

    let record_dir = h.space.file_metadata_root().join(space::path_hash(&file));
    let mut corrupted = 0;
    for version in &versions {
        if rng.random_bool(0.3) {
            let record = record_dir.join(format!("{}.json", version.id));
            let mut bytes = fs::read(&record).unwrap();
            let cut = rng.random_range(1..bytes.len() / 2);
            bytes.truncate(cut);
            fs::write(&record, bytes).unwrap();
            corrupted += 1;
        }
    }
    info!("corrupted {} of {} records", corrupted, versions.len());

    let listed = h.keeper.list_versions(&h.space, &file).unwrap();
    assert_eq!(listed.len(), versions.len() - corrupted);
    for version in &listed {
        assert!(h.keeper.read(version).is_ok());
    }
}

#[test]
fn test_interleaved_capture_and_restore() {
    let h = Arc::new(ChaosHarness::new());
    let file = h.file("busy.txt", b"seed");
    let seed = h.keeper.capture(&h.space, &file, None).unwrap();

    let writer = {
        let h = Arc::clone(&h);
        let file = file.clone();
        thread::spawn(move || {
            for i in 0..20 {
                fs::write(&file, format!("write {}", i)).unwrap();
                let _ = h.keeper.capture(&h.space, &file, None);
            }
        })
    };
    let restorer = {
        let h = Arc::clone(&h);
        let file = file.clone();
        let id = seed.id.to_string();
        thread::spawn(move || {
            for _ in 0..10 {
                // A concurrent external write can fail verification; the
                // restore must then roll back rather than escalate
                if let Err(e) = h.keeper.restore(&h.space, &file, &id, None) {
                    assert!(matches!(e, VersionError::RestorationFailed(_)), "{:?}", e);
                }
            }
        })
    };
    writer.join().unwrap();
    restorer.join().unwrap();

    // Every recorded version is intact and ids are unique
    let listed = h.keeper.list_versions(&h.space, &file).unwrap();
    let mut ids: Vec<_> = listed.iter().map(|v| v.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), listed.len());
    for version in &listed {
        assert!(h.keeper.read(version).is_ok());
    }
    h.assert_no_temp_files();
}

#[test]
fn test_retention_survives_removal_failures() {
    let h = ChaosHarness::new();
    let a = h.file("a.txt", b"a");
    let b = h.file("b.txt", b"b");
    for _ in 0..3 {
        h.keeper.capture(&h.space, &a, None).unwrap();
        h.keeper.capture(&h.space, &b, None).unwrap();
    }

    let a_hash = space::path_hash(&a);
    h.chaos.inject_always(Op::Remove, a_hash);
    let outcome = h.keeper.enforce(&h.space, &StoragePolicy::max_versions(1)).unwrap();
    let PolicyOutcome::Enforced(report) = outcome else {
        panic!("expected enforcement");
    };
    assert!(!report.is_clean());
    // Five of six go; at least two of them belong to the failing file
    assert_eq!(report.removed_versions + report.errors.len(), 5);
    assert!(report.errors.len() >= 2);
    assert!(h.chaos.injected.load(Ordering::SeqCst) > 0);
}

#[test]
fn test_failed_snapshot_leaves_no_tree() {
    let h = ChaosHarness::new();
    h.file("a.txt", b"a");
    h.chaos.inject(Op::Write, "space_metadata", 0);

    assert!(h.keeper.snapshot_space(&h.space, None).is_err());
    assert_eq!(fs::read_dir(h.space.space_versions_dir()).unwrap().count(), 0);
    assert!(h.keeper.list_space_versions(&h.space).unwrap().is_empty());
}

/// Relative path and bytes of every file under `root`, control tree excluded
fn tree_contents(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files: Vec<_> = walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".control")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let relative = e.path().strip_prefix(root).unwrap().to_path_buf();
            (relative, fs::read(e.path()).unwrap())
        })
        .collect();
    files.sort();
    files
}

#[test]
fn test_failed_staging_leaves_live_tree_intact() {
    let h = ChaosHarness::new();
    h.file("a.txt", b"alpha");
    h.file("b.txt", b"bravo");
    fs::create_dir_all(h.space.root().join("docs")).unwrap();
    h.file("docs/c.md", b"charlie");
    let target = h.keeper.snapshot_space(&h.space, None).unwrap();

    h.file("a.txt", b"alpha, edited");
    fs::remove_file(h.space.root().join("b.txt")).unwrap();
    h.file("d.txt", b"delta");
    let before = tree_contents(h.space.root());

    // One file reaches the staging area, the next copy fails
    h.chaos.inject(Op::Copy, "staging", 1);
    let err = h
        .keeper
        .restore_space(&h.space, &target.short_id())
        .unwrap_err();

    assert!(matches!(err, VersionError::RestorationFailed(_)), "{:?}", err);
    assert_eq!(h.chaos.injected.load(Ordering::SeqCst), 1);
    assert_eq!(tree_contents(h.space.root()), before);
    assert_eq!(fs::read_dir(h.space.tmp_dir()).unwrap().count(), 0);

    h.chaos.clear();
    h.keeper.restore_space(&h.space, &target.short_id()).unwrap();
    assert_eq!(fs::read(h.space.root().join("b.txt")).unwrap(), b"bravo");
    assert!(!h.space.root().join("d.txt").exists());
}
