//! Main test module for Verspace
//!
//! This module includes all test suites:
//! - Integration tests for multi-component scenarios
//! - Chaos tests for resilience under injected faults
//! - Property-based tests for invariants

pub mod chaos;
pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::verspace::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, VersionKeeper, Space) {
        let temp_dir = TempDir::new().unwrap();
        let keeper = VersionKeeper::new();
        let space = keeper.create_space(temp_dir.path()).unwrap();
        (temp_dir, keeper, space)
    }

    #[test]
    fn test_empty_file() {
        let (_dir, keeper, space) = setup();
        let file = space.root().join("empty.txt");
        fs::write(&file, b"").unwrap();

        let version = keeper.capture(&space, &file, None).unwrap();
        assert_eq!(version.size, 0);
        assert!(keeper.read(&version).unwrap().is_empty());
    }

    #[test]
    fn test_special_filenames() {
        let (_dir, keeper, space) = setup();
        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "file[with]brackets.txt",
            "ünïcödé.txt",
        ];

        for name in names {
            let path = space.root().join(name);
            if fs::write(&path, format!("Content of {}", name)).is_err() {
                // Skip if the OS rejects the name
                continue;
            }
            let version = keeper.capture(&space, &path, None).unwrap();
            assert_eq!(keeper.read(&version).unwrap(), format!("Content of {}", name).as_bytes());
        }
    }

    #[test]
    fn test_nested_paths_keep_separate_histories() {
        let (_dir, keeper, space) = setup();
        fs::create_dir_all(space.root().join("a/b")).unwrap();
        let top = space.root().join("x.txt");
        let nested = space.root().join("a/b/x.txt");
        fs::write(&top, b"top").unwrap();
        fs::write(&nested, b"nested").unwrap();

        keeper.capture(&space, &top, None).unwrap();
        keeper.capture(&space, &nested, None).unwrap();
        keeper.capture(&space, &nested, None).unwrap();

        assert_eq!(keeper.list_versions(&space, &top).unwrap().len(), 1);
        assert_eq!(keeper.list_versions(&space, &nested).unwrap().len(), 2);
    }

    #[test]
    fn test_rejected_paths() {
        let (_dir, keeper, space) = setup();
        let outside = TempDir::new().unwrap();
        let stray = outside.path().join("stray.txt");
        fs::write(&stray, b"x").unwrap();

        let err = keeper.capture(&space, &stray, None).unwrap_err();
        assert!(matches!(err, VersionError::InvalidPath(_)));

        fs::create_dir(space.root().join("folder")).unwrap();
        let err = keeper.capture(&space, &space.root().join("folder"), None).unwrap_err();
        assert!(matches!(err, VersionError::InvalidPath(_)));

        let err = keeper.capture(&space, &space.root().join("missing.txt"), None).unwrap_err();
        assert!(matches!(err, VersionError::InvalidPath(_)));

        let control = space.root().join(".control/metadata.json");
        assert!(keeper.capture(&space, &control, None).is_err());
    }

    #[test]
    fn test_find_space_from_nested_file() {
        let (_dir, keeper, space) = setup();
        fs::create_dir_all(space.root().join("deep/er")).unwrap();
        let file = space.root().join("deep/er/file.txt");
        fs::write(&file, b"x").unwrap();

        let found = keeper.find_space(&file).unwrap();
        assert_eq!(found.root(), space.root());

        let elsewhere = TempDir::new().unwrap();
        assert!(matches!(
            keeper.find_space(elsewhere.path()),
            Err(VersionError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_double_init_and_untracked_open() {
        let (_dir, keeper, space) = setup();
        assert!(matches!(
            keeper.create_space(space.root()),
            Err(VersionError::SpaceAlreadyExists(_))
        ));

        let plain = TempDir::new().unwrap();
        assert!(matches!(
            keeper.open_space(plain.path()),
            Err(VersionError::SpaceNotInitialized(_))
        ));
    }

    #[test]
    fn test_tracked_name_rules() {
        let (_dir, _keeper, space) = setup();
        assert!(space.is_tracked_name("notes.md"));
        assert!(!space.is_tracked_name(".hidden"));
        assert!(!space.is_tracked_name("~$report.docx"));
        assert!(!space.is_tracked_name("scratch.tmp"));
        assert!(!space.is_tracked_name(".DS_Store"));
        assert!(!space.is_tracked_path(&space.root().join(".control/file_versions/x")));
    }
}
