//! Property-based testing for Verspace
//!
//! Uses proptest to check invariants of capture, restore, retention,
//! throttling and diffing across randomly generated inputs.

use ::verspace::diff::compare;
use ::verspace::monitor::Throttle;
use ::verspace::*;
use proptest::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::info;

/// Generate file names the space tracks
fn name_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "file[0-9]{1,3}\\.txt",
        "[a-z]{1,8}\\.(txt|rs|md|csv)",
        "[a-z]{3,10}",
    ]
}

/// Generate random file content
fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        // Small text files
        "[a-zA-Z0-9 \n]{0,1000}".prop_map(|s| s.into_bytes()),
        // Binary data
        prop::collection::vec(any::<u8>(), 0..10000),
        // Repetitive patterns
        (any::<u8>(), 1..1000usize).prop_map(|(byte, count)| vec![byte; count]),
    ]
}

/// Generate line-oriented text without NUL bytes
fn text_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-c ]{0,3}", 0..40).prop_map(|lines| lines.join("\n"))
}

fn setup() -> anyhow::Result<(TempDir, VersionKeeper, Space)> {
    let temp_dir = TempDir::new()?;
    let keeper = VersionKeeper::new();
    let space = keeper.create_space(temp_dir.path())?;
    Ok((temp_dir, keeper, space))
}

fn write_file(root: &Path, name: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
    let path = root.join(name);
    fs::write(&path, content)?;
    Ok(path)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Stored bytes come back exactly, and restore reproduces them on disk
    #[test]
    fn capture_read_restore_identity(
        name in name_strategy(),
        content in content_strategy(),
        overwrite in content_strategy(),
    ) {
        let (_dir, keeper, space) = setup().unwrap();
        let path = write_file(space.root(), &name, &content).unwrap();

        let version = keeper.capture(&space, &path, None).unwrap();
        prop_assert_eq!(version.size, content.len() as u64);
        prop_assert_eq!(&keeper.read(&version).unwrap(), &content);

        fs::write(&path, &overwrite).unwrap();
        let result = keeper.restore(&space, &path, &version.short_id(), None).unwrap();
        prop_assert_eq!(&fs::read(&path).unwrap(), &content);

        let backup = result.backup_version.unwrap();
        prop_assert_eq!(&keeper.read(&backup).unwrap(), &overwrite);
    }

    /// Count retention keeps min(M, N) versions, and they are the newest
    #[test]
    fn count_retention_keeps_newest(
        captures in 1..12usize,
        limit in 1..8usize,
    ) {
        let (_dir, keeper, space) = setup().unwrap();
        let path = write_file(space.root(), "tracked.txt", b"").unwrap();

        let mut ids = Vec::new();
        for i in 0..captures {
            fs::write(&path, format!("revision {}", i)).unwrap();
            ids.push(keeper.capture(&space, &path, None).unwrap().id);
        }

        keeper.enforce(&space, &StoragePolicy::max_versions(limit)).unwrap();

        let kept: HashSet<_> = keeper
            .list_versions(&space, &path)
            .unwrap()
            .into_iter()
            .map(|v| v.id)
            .collect();
        let expected: HashSet<_> = ids.iter().rev().take(limit).copied().collect();
        prop_assert_eq!(kept.len(), captures.min(limit));
        prop_assert_eq!(kept, expected);
    }

    /// A burst inside the throttle window yields one capture per path
    #[test]
    fn throttle_admits_once_per_window(
        burst in 1..50usize,
        paths in prop::collection::hash_set("[a-z]{1,6}", 1..10),
    ) {
        let throttle = Throttle::new(&MonitorConfig {
            throttle_window: Duration::from_secs(60),
            ..Default::default()
        });

        for path in &paths {
            let path = Path::new("/space").join(path);
            let admitted = (0..burst).filter(|_| throttle.should_capture(&path)).count();
            prop_assert_eq!(admitted, 1);
        }
        prop_assert_eq!(throttle.len(), paths.len());
    }

    /// Hunk line counts account for the full change in line count
    #[test]
    fn diff_counts_balance(
        old in text_strategy(),
        new in text_strategy(),
    ) {
        let (kind, hunks) = compare(old.as_bytes(), new.as_bytes(), &DiffOptions::default());
        let changes: Vec<_> = hunks.iter().flat_map(|h| h.changes.iter()).collect();
        let added = changes.iter().filter(|c| matches!(c, LineChange::Added(..))).count();
        let deleted = changes.iter().filter(|c| matches!(c, LineChange::Deleted(..))).count();

        let old_lines: Vec<&str> = old.lines().collect();
        let new_lines: Vec<&str> = new.lines().collect();
        prop_assert_eq!(
            added as isize - deleted as isize,
            new_lines.len() as isize - old_lines.len() as isize
        );
        if old == new {
            prop_assert_eq!(kind, DiffKind::Identical);
        }

        // Every line a hunk names is the line at that position
        for change in changes {
            match change {
                LineChange::Deleted(n, text) => prop_assert_eq!(old_lines[n - 1], text.as_str()),
                LineChange::Added(n, text) => prop_assert_eq!(new_lines[n - 1], text.as_str()),
                LineChange::Context(n, text) => prop_assert_eq!(old_lines[n - 1], text.as_str()),
            }
        }
    }
}

#[cfg(test)]
mod edge_case_tests {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Histories of sibling files never bleed into each other
        #[test]
        fn histories_stay_per_file(
            counts in prop::collection::vec(0..5usize, 1..6),
        ) {
            let (_dir, keeper, space) = setup().unwrap();
            let mut files = Vec::new();
            for (i, count) in counts.iter().enumerate() {
                let path = write_file(space.root(), &format!("f{}.txt", i), format!("{}", i).as_bytes()).unwrap();
                for _ in 0..*count {
                    keeper.capture(&space, &path, None).unwrap();
                }
                files.push(path);
            }

            for (path, count) in files.iter().zip(&counts) {
                let versions = keeper.list_versions(&space, path).unwrap();
                prop_assert_eq!(versions.len(), *count);
                prop_assert!(versions.iter().all(|v| &v.file_path == path));
            }
            let total: usize = counts.iter().sum();
            prop_assert_eq!(keeper.usage(&space).unwrap().version_count, total);
            info!("{} versions across {} files", total, files.len());
        }
    }
}
