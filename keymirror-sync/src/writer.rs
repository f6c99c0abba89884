//! Filesystem applier: the mirror side of a [`KeyDiff`].
//!
//! ## `apply`: ordering
//!
//! 1. Every deletion, in diff order. A missing file is an error.
//! 2. Every insert, then every update. Parent directories are created with
//!    the directory mode; files are opened (created with the file mode if
//!    absent), truncated and rewritten in full.
//!
//! There is no rollback: a failure part-way leaves the earlier entries
//! applied and is reported to the caller, which stops the pipeline.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use keymirror_core::{KeyDiff, KeyRecord, KeyRecords};

use crate::error::{io_err, SyncError};

// ---------------------------------------------------------------------------
// Apply result
// ---------------------------------------------------------------------------

/// Counts of what [`apply`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub deleted: usize,
    pub written: usize,
}

// ---------------------------------------------------------------------------
// Key ↔ path
// ---------------------------------------------------------------------------

/// Map a relative `/`-separated key to a path under `root`.
///
/// Empty segments are ignored (`a//b` is `a/b`, a leading `/` is dropped);
/// `.` and `..` segments are rejected so no key escapes the mirror.
pub fn key_path(root: &Path, key: &str) -> Result<PathBuf, SyncError> {
    let mut path = root.to_path_buf();
    let mut pushed = false;
    for segment in key.split('/').filter(|segment| !segment.is_empty()) {
        if segment == "." || segment == ".." || segment.contains('\\') {
            return Err(SyncError::InvalidKey {
                key: key.to_string(),
            });
        }
        path.push(segment);
        pushed = true;
    }
    if !pushed {
        return Err(SyncError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(path)
}

/// The key for a file found under `root`: its relative path joined with `/`.
fn path_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(segment) => Some(segment.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    (!segments.is_empty()).then(|| segments.join("/"))
}

/// The key [`scan`] reports for the file [`key_path`] maps `key` to:
/// empty segments dropped, the rest joined with `/`.
pub fn normalize_key(key: &str) -> String {
    key.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether the file backing `key` currently exists.
///
/// A path that runs through a regular file (`a/b` while `a` is a file) does
/// not exist yet.
pub fn key_exists(root: &Path, key: &str) -> Result<bool, SyncError> {
    let path = key_path(root, key)?;
    match fs::symlink_metadata(&path) {
        Ok(_) => Ok(true),
        Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
            Ok(false)
        }
        Err(err) => Err(io_err(path, err)),
    }
}

// ---------------------------------------------------------------------------
// ensure_root
// ---------------------------------------------------------------------------

/// Create the mirror root (and its parents) if it does not exist yet.
pub fn ensure_root(root: &Path, dir_mode: u32) -> Result<(), SyncError> {
    match fs::metadata(root) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(SyncError::NotADirectory {
            path: root.to_path_buf(),
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            create_dirs(root, dir_mode)?;
            tracing::info!("created mirror root {}", root.display());
            Ok(())
        }
        Err(err) => Err(io_err(root, err)),
    }
}

// ---------------------------------------------------------------------------
// scan
// ---------------------------------------------------------------------------

/// Walk `root` and return one record per regular file, keyed relative to
/// `root` with `/` separators. Store metadata fields are zero.
pub fn scan(root: &Path) -> Result<KeyRecords, SyncError> {
    let mut records = KeyRecords::new();
    let mut dirs = vec![root.to_path_buf()];

    while let Some(current) = dirs.pop() {
        let entries = fs::read_dir(&current).map_err(|e| io_err(&current, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let path = entry.path();
            let ty = entry.file_type().map_err(|e| io_err(&path, e))?;
            if ty.is_dir() {
                dirs.push(path);
            } else if ty.is_file() {
                let Some(key) = path_key(root, &path) else {
                    continue;
                };
                let value = fs::read(&path).map_err(|e| io_err(&path, e))?;
                records.insert(key.clone(), KeyRecord::from_file(key, value));
            } else {
                tracing::debug!("skipping non-regular file {}", path.display());
            }
        }
    }

    Ok(records)
}

// ---------------------------------------------------------------------------
// apply
// ---------------------------------------------------------------------------

/// Make the mirror under `root` reflect `diff`: deletions first, then upserts.
pub fn apply(
    root: &Path,
    diff: &KeyDiff,
    file_mode: u32,
    dir_mode: u32,
) -> Result<ApplyOutcome, SyncError> {
    let mut outcome = ApplyOutcome::default();

    for key in &diff.deletions {
        let path = key_path(root, key)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(SyncError::MissingFile { path });
            }
            Err(err) => return Err(io_err(path, err)),
        }
        tracing::debug!("deleted: {}", path.display());
        outcome.deleted += 1;
    }

    for (key, value) in diff.upserts() {
        let path = key_path(root, key)?;
        if let Some(parent) = path.parent() {
            create_dirs(parent, dir_mode)?;
        }
        write_file(&path, value, file_mode)?;
        tracing::debug!("wrote: {}", path.display());
        outcome.written += 1;
    }

    Ok(outcome)
}

fn write_file(path: &Path, content: &[u8], file_mode: u32) -> Result<(), SyncError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    set_file_mode(&mut options, file_mode);

    let mut file = options.open(path).map_err(|e| io_err(path, e))?;
    file.write_all(content).map_err(|e| io_err(path, e))?;
    file.flush().map_err(|e| io_err(path, e))?;
    Ok(())
}

fn create_dirs(path: &Path, dir_mode: u32) -> Result<(), SyncError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    set_dir_mode(&mut builder, dir_mode);
    builder.create(path).map_err(|e| io_err(path, e))
}

#[cfg(unix)]
fn set_file_mode(options: &mut OpenOptions, mode: u32) {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(mode);
}

#[cfg(not(unix))]
fn set_file_mode(_options: &mut OpenOptions, _mode: u32) {}

#[cfg(unix)]
fn set_dir_mode(builder: &mut fs::DirBuilder, mode: u32) {
    use std::os::unix::fs::DirBuilderExt;
    builder.mode(mode);
}

#[cfg(not(unix))]
fn set_dir_mode(_builder: &mut fs::DirBuilder, _mode: u32) {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use keymirror_core::ValueMap;
    use rstest::rstest;
    use tempfile::TempDir;

    fn values(pairs: &[(&str, &str)]) -> ValueMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn key_path_joins_segments() {
        let root = Path::new("/mirror");
        assert_eq!(key_path(root, "a/b/c").unwrap(), PathBuf::from("/mirror/a/b/c"));
        assert_eq!(key_path(root, "/a//b").unwrap(), PathBuf::from("/mirror/a/b"));
    }

    #[test]
    fn normalized_key_names_the_same_file() {
        let root = Path::new("/mirror");
        let key = normalize_key("/a//b/");
        assert_eq!(key, "a/b");
        assert_eq!(key_path(root, &key).unwrap(), key_path(root, "/a//b/").unwrap());
    }

    #[test]
    fn key_below_a_regular_file_does_not_exist() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a"), "leaf").unwrap();
        assert!(!key_exists(tmp.path(), "a/b").unwrap());
    }

    #[rstest]
    #[case::parent_escape("../etc/passwd")]
    #[case::current_dir("a/./b")]
    #[case::backslash("a\\b")]
    #[case::empty("")]
    #[case::only_separators("/")]
    fn key_path_rejects_escapes_and_empty_keys(#[case] key: &str) {
        assert!(
            matches!(key_path(Path::new("/mirror"), key), Err(SyncError::InvalidKey { .. })),
            "key {key:?} should be rejected"
        );
    }

    #[test]
    fn ensure_root_creates_and_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("deep").join("mirror");
        ensure_root(&root, 0o770).unwrap();
        assert!(root.is_dir());
        ensure_root(&root, 0o770).unwrap();
    }

    #[test]
    fn ensure_root_rejects_regular_file() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("file");
        fs::write(&root, "x").unwrap();
        let err = ensure_root(&root, 0o770).unwrap_err();
        assert!(matches!(err, SyncError::NotADirectory { .. }));
    }

    #[test]
    fn scan_keys_are_relative_and_slash_separated() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("dir").join("sub")).unwrap();
        fs::write(tmp.path().join("top"), "1").unwrap();
        fs::write(tmp.path().join("dir").join("sub").join("leaf"), "2").unwrap();

        let records = scan(tmp.path()).unwrap();
        assert_eq!(records.keys().collect::<Vec<_>>(), vec!["dir/sub/leaf", "top"]);
        assert_eq!(records["top"].value, b"1");
        assert_eq!(records["dir/sub/leaf"].version, 0);
    }

    #[test]
    fn scan_skips_empty_directories() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("empty")).unwrap();
        assert!(scan(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn apply_creates_parent_directories() {
        let tmp = TempDir::new().unwrap();
        let diff = KeyDiff {
            inserts: values(&[("a/b/c.conf", "content")]),
            ..KeyDiff::default()
        };
        let outcome = apply(tmp.path(), &diff, 0o660, 0o770).unwrap();
        assert_eq!(outcome, ApplyOutcome { deleted: 0, written: 1 });
        assert_eq!(
            fs::read_to_string(tmp.path().join("a").join("b").join("c.conf")).unwrap(),
            "content"
        );
    }

    #[test]
    fn update_truncates_longer_previous_content() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a"), "a much longer previous value").unwrap();
        let diff = KeyDiff {
            updates: values(&[("a", "9")]),
            ..KeyDiff::default()
        };
        apply(tmp.path(), &diff, 0o660, 0o770).unwrap();
        assert_eq!(fs::read_to_string(tmp.path().join("a")).unwrap(), "9");
    }

    #[test]
    fn deleting_missing_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let diff = KeyDiff {
            deletions: vec!["ghost".to_string()],
            ..KeyDiff::default()
        };
        let err = apply(tmp.path(), &diff, 0o660, 0o770).unwrap_err();
        assert!(matches!(err, SyncError::MissingFile { .. }), "got: {err}");
    }

    #[test]
    fn deletions_run_before_upserts() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("node"), "file").unwrap();
        // `node` turns from a file into a directory within one diff.
        let diff = KeyDiff {
            inserts: values(&[("node/child", "x")]),
            deletions: vec!["node".to_string()],
            ..KeyDiff::default()
        };
        let outcome = apply(tmp.path(), &diff, 0o660, 0o770).unwrap();
        assert_eq!(outcome, ApplyOutcome { deleted: 1, written: 1 });
        assert!(tmp.path().join("node").is_dir());
    }

    #[test]
    fn key_exists_reflects_mirror() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("present"), "x").unwrap();
        assert!(key_exists(tmp.path(), "present").unwrap());
        assert!(!key_exists(tmp.path(), "absent").unwrap());
    }

    #[test]
    #[cfg(unix)]
    fn new_files_and_directories_get_configured_modes() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let diff = KeyDiff {
            inserts: values(&[("dir/file", "x")]),
            ..KeyDiff::default()
        };
        apply(tmp.path(), &diff, 0o600, 0o700).unwrap();

        let file_mode = fs::metadata(tmp.path().join("dir").join("file"))
            .unwrap()
            .permissions()
            .mode();
        let dir_mode = fs::metadata(tmp.path().join("dir"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}
