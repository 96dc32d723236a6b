//! Integration tests for Verspace
//!
//! Scenarios spanning capture, restore, snapshots, monitoring and retention
//! through the public API.

use ::verspace::*;
use filetime::FileTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::info;

/// Test harness holding a keeper and one space
pub struct SpaceHarness {
    pub temp_dir: TempDir,
    pub keeper: Arc<VersionKeeper>,
    pub space: Space,
}

impl SpaceHarness {
    pub fn new() -> Self {
        Self::with_keeper(VersionKeeper::new())
    }

    pub fn with_keeper(keeper: VersionKeeper) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let space = keeper.create_space(temp_dir.path()).unwrap();
        Self {
            temp_dir,
            keeper: Arc::new(keeper),
            space,
        }
    }

    pub fn write(&self, name: &str, content: impl AsRef<[u8]>) -> PathBuf {
        let path = self.space.root().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    false
}

#[test]
fn test_notes_scenario() {
    let h = SpaceHarness::new();
    let notes = h.write("notes.txt", b"ten bytes!");

    let version = h.keeper.capture(&h.space, &notes, None).unwrap();
    let versions = h.keeper.list_versions(&h.space, &notes).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].size, 10);
    assert_eq!(versions[0].content_hash, version.content_hash);

    h.write("notes.txt", b"something else entirely");
    h.keeper.restore(&h.space, &notes, &version.id.to_string(), None).unwrap();

    assert_eq!(fs::read(&notes).unwrap(), b"ten bytes!");
    assert_eq!(h.keeper.list_versions(&h.space, &notes).unwrap().len(), 2);
}

#[test]
fn test_concurrent_captures_same_path() {
    let h = SpaceHarness::new();
    let file = h.write("shared.txt", b"contended");

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let keeper = Arc::clone(&h.keeper);
            let space = h.space.clone();
            let file = file.clone();
            thread::spawn(move || {
                (0..10)
                    .map(|_| keeper.capture(&space, &file, None).unwrap().id)
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let ids: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), 20);

    let listed = h.keeper.list_versions(&h.space, &file).unwrap();
    assert_eq!(listed.len(), 20);
    for version in &listed {
        assert_eq!(h.keeper.read(version).unwrap(), b"contended");
    }
}

#[test]
fn test_parallel_captures_distinct_paths() {
    let h = SpaceHarness::new();
    let mut rng = StdRng::seed_from_u64(7);
    let files: Vec<(PathBuf, Vec<u8>)> = (0..16)
        .map(|i| {
            let len = rng.random_range(1..4096);
            let content: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            (h.write(&format!("dir{}/file{}.bin", i % 4, i), &content), content)
        })
        .collect();

    thread::scope(|scope| {
        for (path, _) in &files {
            let keeper = &h.keeper;
            let space = &h.space;
            scope.spawn(move || keeper.capture(space, path, None).unwrap());
        }
    });

    for (path, content) in &files {
        let versions = h.keeper.list_versions(&h.space, path).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(&h.keeper.read(&versions[0]).unwrap(), content);
    }
}

#[test]
fn test_corruption_isolated_among_valid_records() {
    let h = SpaceHarness::new();
    let file = h.write("doc.md", b"v");
    for i in 0..5 {
        h.write("doc.md", format!("v{}", i));
        h.keeper.capture(&h.space, &file, None).unwrap();
    }
    let record_dir = h
        .space
        .file_metadata_root()
        .join(space::path_hash(&file));
    fs::write(record_dir.join("00000000-0000-4000-8000-000000000000.json"), b"{\"id\": 3").unwrap();

    assert_eq!(h.keeper.list_versions(&h.space, &file).unwrap().len(), 5);
}

#[test]
fn test_restore_then_restore_backup() {
    let h = SpaceHarness::new();
    let file = h.write("essay.txt", b"draft one");
    let first = h.keeper.capture(&h.space, &file, None).unwrap();
    h.write("essay.txt", b"draft two");

    let result = h.keeper.restore(&h.space, &file, &first.short_id(), None).unwrap();
    let backup = result.backup_version.unwrap();
    assert_eq!(backup.comment.as_deref().map(|c| c.starts_with("Pre-restore backup")), Some(true));

    // Undo the restore through its safety version
    h.keeper.restore(&h.space, &file, &backup.id.to_string(), None).unwrap();
    assert_eq!(fs::read(&file).unwrap(), b"draft two");
    assert_eq!(h.keeper.list_versions(&h.space, &file).unwrap().len(), 3);
}

#[test]
fn test_restore_deleted_file() {
    let h = SpaceHarness::new();
    let file = h.write("gone.txt", b"keep me");
    let version = h.keeper.capture(&h.space, &file, None).unwrap();
    fs::remove_file(&file).unwrap();

    let result = h.keeper.restore(&h.space, &file, &version.short_id(), None).unwrap();
    assert!(result.backup_version.is_none());
    assert_eq!(fs::read(&file).unwrap(), b"keep me");
}

#[test]
fn test_space_restore_reverses_tree_changes() {
    let h = SpaceHarness::new();
    h.write("a.txt", b"a");
    h.write("src/lib.rs", b"pub fn x() {}");
    let snapshot = h.keeper.snapshot_space(&h.space, Some("baseline".into())).unwrap();

    h.write("src/lib.rs", b"broken");
    h.write("src/new.rs", b"new");
    fs::remove_file(h.space.root().join("a.txt")).unwrap();

    let result = h.keeper.restore_space(&h.space, &snapshot.short_id()).unwrap();
    assert_eq!(fs::read(h.space.root().join("src/lib.rs")).unwrap(), b"pub fn x() {}");
    assert!(!h.space.root().join("src/new.rs").exists());
    assert_eq!(fs::read(h.space.root().join("a.txt")).unwrap(), b"a");

    // The pre-restore state can be brought back
    h.keeper
        .restore_space(&h.space, &result.backup_version.id.to_string())
        .unwrap();
    assert_eq!(fs::read(h.space.root().join("src/new.rs")).unwrap(), b"new");
    assert!(!h.space.root().join("a.txt").exists());
}

fn fast_keeper() -> VersionKeeper {
    VersionKeeper::builder()
        .monitor_config(MonitorConfig {
            scan_interval: Duration::from_millis(50),
            throttle_window: Duration::from_millis(200),
            ..Default::default()
        })
        .build()
        .unwrap()
}

#[test]
fn test_fallback_scanner_uses_recent_mtime() {
    let h = SpaceHarness::with_keeper(fast_keeper());
    let stale = h.write("stale.txt", b"old news");
    let old = FileTime::from_unix_time(FileTime::now().unix_seconds() - 3600, 0);
    filetime::set_file_mtime(&stale, old).unwrap();

    h.keeper.start_monitoring(&h.space, Arc::new(|_| {})).unwrap();
    let rescan = notify::Event::new(notify::EventKind::Other).set_flag(notify::event::Flag::Rescan);
    h.keeper.monitor().deliver(h.space.root(), Ok(rescan));
    assert!(wait_for(|| h.keeper.monitor_state(&h.space) == MonitorState::Fallback));

    let fresh = h.write("fresh.txt", b"breaking");
    assert!(wait_for(|| !h.keeper.list_versions(&h.space, &fresh).unwrap().is_empty()));
    thread::sleep(Duration::from_millis(300));
    assert!(h.keeper.list_versions(&h.space, &stale).unwrap().is_empty());

    // Touching the stale file makes it recent
    filetime::set_file_mtime(&stale, FileTime::now()).unwrap();
    assert!(wait_for(|| !h.keeper.list_versions(&h.space, &stale).unwrap().is_empty()));

    assert!(h.keeper.stop_monitoring(&h.space));
    info!("fallback stats: {:?}", h.keeper.monitor_stats(&h.space));
    assert_eq!(h.keeper.monitor_state(&h.space), MonitorState::Stopped);
}

#[test]
fn test_monitor_skips_hidden_and_excluded() {
    let h = SpaceHarness::with_keeper(fast_keeper());
    let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    h.keeper
        .start_monitoring(&h.space, Arc::new(move |e: MonitorEvent| sink.lock().push(e.path)))
        .unwrap();

    let hidden = h.write(".secret", b"x");
    let temp = h.write("build.tmp", b"x");
    let visible = h.write("visible.txt", b"x");
    let modify = |p: &PathBuf| {
        Ok(notify::Event::new(notify::EventKind::Modify(notify::event::ModifyKind::Any))
            .add_path(p.clone()))
    };
    for path in [&hidden, &temp, &visible] {
        h.keeper.monitor().deliver(h.space.root(), modify(path));
    }

    assert!(wait_for(|| !h.keeper.list_versions(&h.space, &visible).unwrap().is_empty()));
    h.keeper.stop_monitoring(&h.space);

    let seen = events.lock();
    assert!(seen.contains(&visible));
    assert!(!seen.contains(&hidden));
    assert!(!seen.contains(&temp));
    assert!(h.keeper.list_versions(&h.space, &temp).unwrap().is_empty());
}

#[test]
fn test_retention_by_count_across_files() {
    let h = SpaceHarness::new();
    for round in 0..3 {
        for name in ["a.txt", "b.txt", "c.txt"] {
            let path = h.write(name, format!("{}-{}", name, round));
            h.keeper.capture(&h.space, &path, None).unwrap();
        }
    }

    match h.keeper.enforce(&h.space, &StoragePolicy::max_versions(4)).unwrap() {
        PolicyOutcome::Enforced(report) => assert_eq!(report.removed_versions, 5),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(h.keeper.usage(&h.space).unwrap().version_count, 4);
}

#[tokio::test]
async fn test_async_space_restore() {
    let h = SpaceHarness::new();
    h.write("page.html", b"<p>v1</p>");
    let snapshot = h.keeper.snapshot_space(&h.space, None).unwrap();
    h.write("page.html", b"<p>v2</p>");

    let result = h
        .keeper
        .restore_space_async(&h.space, &snapshot.short_id())
        .await
        .unwrap();
    assert_eq!(result.version_id, snapshot.id);
    assert_eq!(fs::read(h.space.root().join("page.html")).unwrap(), b"<p>v1</p>");
}
