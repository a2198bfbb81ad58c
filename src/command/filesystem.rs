//! Filesystem commands: create, copy and delete directories.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::Command;
use crate::error::{Error, Result};
use crate::storage::Broker;

// ---------------------------------------------------------------------------
// CreateDirectory
// ---------------------------------------------------------------------------

/// Create a directory (and missing parents). Undo removes it only if this
/// command created it.
pub struct CreateDirectory {
    description: String,
    path: PathBuf,
    created: bool,
}

impl CreateDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            description: format!("create directory {}", path.display()),
            path,
            created: false,
        }
    }
}

impl Command for CreateDirectory {
    fn description(&self) -> &str {
        &self.description
    }

    fn execute(&mut self, _broker: &Broker<'_>) -> Result<()> {
        if self.path.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&self.path)?;
        self.created = true;
        Ok(())
    }

    fn undo(&mut self) {
        if !self.created {
            return;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => self.created = false,
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "undo create directory failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// CopyDirectory
// ---------------------------------------------------------------------------

/// One file written by [`CopyDirectory`], as seen by the progress callback.
#[derive(Debug, Clone)]
pub struct CopiedFile {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub bytes: u64,
}

impl CopiedFile {
    pub fn is_dicom(&self) -> bool {
        self.destination
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
    }
}

type ProgressFn<'a> = Box<dyn FnMut(&CopiedFile) + 'a>;

/// Recursively copy `source` to `destination`, preserving relative layout.
///
/// The progress callback runs synchronously after every file. Undo removes
/// the destination if this command created it, otherwise the files it wrote
/// (including one left half-written) and the subdirectories it created.
pub struct CopyDirectory<'a> {
    description: String,
    source: PathBuf,
    destination: PathBuf,
    progress: Option<ProgressFn<'a>>,
    created: bool,
    created_dirs: Vec<PathBuf>,
    written: Vec<PathBuf>,
}

impl<'a> CopyDirectory<'a> {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        let source = source.into();
        let destination = destination.into();
        Self {
            description: format!(
                "copy {} to {}",
                source.display(),
                destination.display()
            ),
            source,
            destination,
            progress: None,
            created: false,
            created_dirs: Vec::new(),
            written: Vec::new(),
        }
    }

    pub fn on_progress(mut self, callback: impl FnMut(&CopiedFile) + 'a) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    fn copy_tree(&mut self) -> Result<()> {
        if !self.source.is_dir() {
            return Err(Error::Command {
                command: self.description.clone(),
                reason: format!("source {} is not a directory", self.source.display()),
            });
        }
        if !self.destination.exists() {
            fs::create_dir_all(&self.destination)?;
            self.created = true;
        }

        for entry in WalkDir::new(&self.source).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            let relative = entry
                .path()
                .strip_prefix(&self.source)
                .map_err(|e| Error::Other(e.to_string()))?;
            let target = self.destination.join(relative);

            if entry.file_type().is_dir() {
                if !target.exists() {
                    fs::create_dir_all(&target)?;
                    self.created_dirs.push(target);
                }
                continue;
            }

            self.written.push(target.clone());
            let bytes = fs::copy(entry.path(), &target)?;

            if let Some(progress) = self.progress.as_mut() {
                progress(&CopiedFile {
                    source: entry.path().to_path_buf(),
                    destination: target,
                    bytes,
                });
            }
        }
        Ok(())
    }
}

impl Command for CopyDirectory<'_> {
    fn description(&self) -> &str {
        &self.description
    }

    fn execute(&mut self, _broker: &Broker<'_>) -> Result<()> {
        self.copy_tree()
    }

    fn undo(&mut self) {
        if self.created {
            if let Err(e) = fs::remove_dir_all(&self.destination) {
                tracing::warn!(
                    path = %self.destination.display(),
                    error = %e,
                    "undo copy failed to remove destination"
                );
            }
            self.created = false;
        } else {
            for path in self.written.drain(..).rev() {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "undo copy failed to remove file")
                    }
                }
            }
            for dir in self.created_dirs.drain(..).rev() {
                if let Err(e) = fs::remove_dir_all(&dir) {
                    tracing::warn!(path = %dir.display(), error = %e, "undo copy failed to remove directory");
                }
            }
        }
        self.written.clear();
        self.created_dirs.clear();
    }
}

// ---------------------------------------------------------------------------
// DeleteDirectory
// ---------------------------------------------------------------------------

/// Remove a directory tree. Not reversible.
pub struct DeleteDirectory {
    description: String,
    path: PathBuf,
    ignore_errors: bool,
}

impl DeleteDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            description: format!("delete directory {}", path.display()),
            path,
            ignore_errors: false,
        }
    }

    /// Log a failed delete instead of failing the operation.
    pub fn ignore_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Command for DeleteDirectory {
    fn description(&self) -> &str {
        &self.description
    }

    fn requires_rollback(&self) -> bool {
        false
    }

    fn execute(&mut self, _broker: &Broker<'_>) -> Result<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if self.ignore_errors => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to delete directory");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn undo(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn create_directory_undo_only_removes_what_it_made() {
        let storage = Storage::in_memory().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let existing = tmp.path().join("existing");
        fs::create_dir(&existing).unwrap();

        let mut keep = CreateDirectory::new(&existing);
        keep.execute(&storage.broker()).unwrap();
        keep.undo();
        assert!(existing.is_dir());

        let fresh = tmp.path().join("fresh");
        let mut make = CreateDirectory::new(&fresh);
        make.execute(&storage.broker()).unwrap();
        assert!(fresh.is_dir());
        make.undo();
        assert!(!fresh.exists());
    }

    #[test]
    fn copy_preserves_layout_and_reports_each_file() {
        let storage = Storage::in_memory().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        write(&src.join("series1/a.dcm"), "aaaa");
        write(&src.join("series1/b.dcm"), "bb");
        write(&src.join("study.xml"), "<x/>");

        let dst = tmp.path().join("dst");
        let mut seen = Vec::new();
        {
            let mut copy = CopyDirectory::new(&src, &dst).on_progress(|f| seen.push((f.bytes, f.is_dicom())));
            copy.execute(&storage.broker()).unwrap();
        }

        assert_eq!(fs::read_to_string(dst.join("series1/a.dcm")).unwrap(), "aaaa");
        assert!(dst.join("study.xml").is_file());
        assert_eq!(seen.len(), 3);
        assert_eq!(seen.iter().map(|(b, _)| b).sum::<u64>(), 10);
        assert_eq!(seen.iter().filter(|(_, dicom)| *dicom).count(), 2);
    }

    #[test]
    fn copy_undo_removes_created_destination() {
        let storage = Storage::in_memory().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        write(&src.join("a.dcm"), "a");
        let dst = tmp.path().join("dst");

        let mut copy = CopyDirectory::new(&src, &dst);
        copy.execute(&storage.broker()).unwrap();
        copy.undo();

        assert!(!dst.exists());
        assert!(src.join("a.dcm").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn failed_copy_into_existing_destination_removes_its_own_work() {
        let storage = Storage::in_memory().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        write(&src.join("a/one.dcm"), "1");
        fs::create_dir_all(src.join("b")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("gone"), src.join("b/two.dcm")).unwrap();

        // Left behind by an earlier, interrupted copy.
        let dst = tmp.path().join("dst");
        write(&dst.join("keep.txt"), "mine");
        write(&dst.join("b/two.dcm"), "partial");

        let mut copy = CopyDirectory::new(&src, &dst);
        assert!(copy.execute(&storage.broker()).is_err());
        copy.undo();

        assert!(dst.join("keep.txt").is_file());
        assert!(!dst.join("a").exists());
        assert!(!dst.join("b/two.dcm").exists());
        assert!(dst.join("b").is_dir());
    }

    #[test]
    fn copy_of_missing_source_fails() {
        let storage = Storage::in_memory().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let mut copy = CopyDirectory::new(tmp.path().join("nope"), tmp.path().join("dst"));
        assert!(copy.execute(&storage.broker()).is_err());
        assert!(!tmp.path().join("dst").exists());
    }

    #[test]
    fn delete_can_tolerate_failure() {
        let storage = Storage::in_memory().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("missing");

        assert!(DeleteDirectory::new(&missing).execute(&storage.broker()).is_err());
        assert!(
            DeleteDirectory::new(&missing)
                .ignore_errors()
                .execute(&storage.broker())
                .is_ok()
        );
        assert!(!DeleteDirectory::new(&missing).requires_rollback());
    }
}
