//! Filesystem staging area.
//!
//! Three directories define the file lifecycle: producers drop files into
//! `wait/`, the orchestrator moves enqueued files into `run/`, and workers
//! either delete them (success) or move them into `buggy/` (failure). All
//! moves are rename-based with a copy+delete fallback for cross-filesystem
//! destinations; a destination collision is resolved last-writer-wins
//! because content is addressed by `mail_id` in the ledger.

use std::fs;
use std::path::{Path, PathBuf};

use mailfeed_core::{IngestError, IngestResult, PathsConfig};

/// Upper bound on filenames returned by a single scan.
pub const SCAN_LIMIT: usize = 1000;

/// Owns the three staging directories and the moves between them.
#[derive(Debug, Clone)]
pub struct Stager {
    wait_dir: PathBuf,
    run_dir: PathBuf,
    buggy_dir: PathBuf,
}

impl Stager {
    #[must_use]
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            wait_dir: paths.wait_dir.clone(),
            run_dir: paths.run_dir.clone(),
            buggy_dir: paths.buggy_dir.clone(),
        }
    }

    /// Create all three directories if absent.
    pub fn ensure_dirs(&self) -> IngestResult<()> {
        for dir in [&self.wait_dir, &self.run_dir, &self.buggy_dir] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn wait_dir(&self) -> &Path {
        &self.wait_dir
    }

    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    #[must_use]
    pub fn buggy_dir(&self) -> &Path {
        &self.buggy_dir
    }

    /// Up to `limit` message filenames waiting in `wait/`, sorted by name.
    ///
    /// Only `.json` files count; dot-prefixed temp files and subdirectories
    /// are ignored. Never blocks on anything but directory iteration.
    pub fn list_pending(&self, limit: usize) -> IngestResult<Vec<String>> {
        list_message_files(&self.wait_dir, limit)
    }

    /// Message filenames currently in `run/`, used by startup recovery.
    pub fn list_run(&self) -> IngestResult<Vec<String>> {
        list_message_files(&self.run_dir, usize::MAX)
    }

    #[must_use]
    pub fn wait_path(&self, name: &str) -> PathBuf {
        self.wait_dir.join(name)
    }

    #[must_use]
    pub fn run_path(&self, name: &str) -> PathBuf {
        self.run_dir.join(name)
    }

    /// Move a waiting file into `run/`, returning its new path.
    pub fn move_to_run(&self, name: &str) -> IngestResult<PathBuf> {
        let dst = self.run_dir.join(name);
        move_file(&self.wait_dir.join(name), &dst)?;
        Ok(dst)
    }

    /// Return a `run/` file to `wait/` (startup recovery, full-queue backoff).
    pub fn move_run_back_to_wait(&self, name: &str) -> IngestResult<PathBuf> {
        let dst = self.wait_dir.join(name);
        move_file(&self.run_dir.join(name), &dst)?;
        Ok(dst)
    }

    /// Quarantine a file from anywhere into `buggy/`.
    pub fn move_to_buggy(&self, path: &Path) -> IngestResult<PathBuf> {
        let name = path
            .file_name()
            .ok_or_else(|| IngestError::MalformedRecord {
                detail: format!("path {} has no file name", path.display()),
            })?;
        let dst = self.buggy_dir.join(name);
        move_file(path, &dst)?;
        Ok(dst)
    }

    /// Unlink a file; a missing file is not an error.
    pub fn delete(&self, path: &Path) -> IngestResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

fn list_message_files(dir: &Path, limit: usize) -> IngestResult<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        names.push(name);
    }
    names.sort_unstable();
    names.truncate(limit);
    Ok(names)
}

/// Rename with copy+delete fallback. A destination that already exists is
/// overwritten. Partial fallback failure is fatal for the file: the error
/// surfaces and the source is left wherever the attempt got to.
fn move_file(src: &Path, dst: &Path) -> IngestResult<()> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    // Cross-filesystem moves land here; so do genuinely broken sources,
    // which the copy will then report accurately.
    fs::copy(src, dst)
        .and_then(|_| fs::remove_file(src))
        .map_err(|source| IngestError::MoveFailed {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            source,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, Stager) {
        let dir = tempfile::tempdir().expect("temp dir");
        let paths = PathsConfig {
            wait_dir: dir.path().join("wait"),
            run_dir: dir.path().join("run"),
            buggy_dir: dir.path().join("buggy"),
            sqlite_path: dir.path().join("status.sqlite3"),
        };
        let stager = Stager::new(&paths);
        stager.ensure_dirs().expect("dirs should be creatable");
        (dir, stager)
    }

    fn drop_file(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"{}").expect("fixture write");
    }

    #[test]
    fn list_pending_filters_and_sorts() {
        let (_dir, stager) = fixture();
        drop_file(stager.wait_dir(), "b.json");
        drop_file(stager.wait_dir(), "a.json");
        drop_file(stager.wait_dir(), ".hidden.json");
        drop_file(stager.wait_dir(), "notes.txt");
        fs::create_dir(stager.wait_dir().join("subdir.json")).expect("subdir");

        let names = stager.list_pending(SCAN_LIMIT).expect("scan");
        assert_eq!(names, vec!["a.json".to_owned(), "b.json".to_owned()]);
    }

    #[test]
    fn list_pending_honors_the_limit() {
        let (_dir, stager) = fixture();
        for i in 0..10 {
            drop_file(stager.wait_dir(), &format!("m{i:02}.json"));
        }
        let names = stager.list_pending(3).expect("scan");
        assert_eq!(names.len(), 3);
        assert_eq!(names[0], "m00.json");
    }

    #[test]
    fn move_to_run_and_back() {
        let (_dir, stager) = fixture();
        drop_file(stager.wait_dir(), "m.json");

        let run_path = stager.move_to_run("m.json").expect("move to run");
        assert!(run_path.exists());
        assert!(!stager.wait_path("m.json").exists());

        let wait_path = stager.move_run_back_to_wait("m.json").expect("move back");
        assert!(wait_path.exists());
        assert!(!run_path.exists());
    }

    #[test]
    fn move_to_buggy_overwrites_existing_destination() {
        let (_dir, stager) = fixture();
        fs::write(stager.buggy_dir().join("m.json"), b"old").expect("seed buggy");
        fs::write(stager.wait_path("m.json"), b"new").expect("seed wait");

        stager
            .move_to_buggy(&stager.wait_path("m.json"))
            .expect("move to buggy");
        let contents = fs::read(stager.buggy_dir().join("m.json")).expect("read");
        assert_eq!(contents, b"new", "later write wins");
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, stager) = fixture();
        drop_file(stager.run_dir(), "m.json");
        let path = stager.run_path("m.json");
        stager.delete(&path).expect("first delete");
        stager.delete(&path).expect("second delete of missing file");
    }

    #[test]
    fn moving_a_missing_file_reports_the_paths() {
        let (_dir, stager) = fixture();
        let err = stager.move_to_run("ghost.json").expect_err("missing file");
        assert!(matches!(err, IngestError::MoveFailed { .. }));
        assert!(err.to_string().contains("ghost.json"));
    }

    #[test]
    fn list_run_sees_leftover_files() {
        let (_dir, stager) = fixture();
        drop_file(stager.run_dir(), "leftover.json");
        assert_eq!(stager.list_run().expect("scan"), vec!["leftover.json"]);
    }
}
