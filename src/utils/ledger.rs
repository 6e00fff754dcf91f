use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use log::{error, info, warn};
use tempfile::Builder;
use crate::config::defs::ARCHIVE_DIR_PREFIX;

#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    Temporary,
    Final(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub path: PathBuf,
    pub lifecycle: Lifecycle,
}

/// What `finalize` did with each artifact.
#[derive(Debug, Default)]
pub struct LedgerReport {
    pub deleted: Vec<PathBuf>,
    pub archived: Vec<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub published: Vec<PathBuf>,
    pub failures: usize,
}

/// Registry of every file a run produced. The run owns exactly one ledger and
/// consumes it in [`Ledger::finalize`].
#[derive(Debug)]
pub struct Ledger {
    out_dir: PathBuf,
    artifacts: Vec<Artifact>,
}

impl Ledger {
    pub fn new(out_dir: &Path) -> Self {
        Ledger {
            out_dir: out_dir.to_path_buf(),
            artifacts: Vec::new(),
        }
    }

    /// Registers a temporary artifact. Registering a path twice is a no-op.
    pub fn track(&mut self, path: &Path) {
        if self.artifacts.iter().any(|a| a.path == path) {
            return;
        }
        self.artifacts.push(Artifact {
            path: path.to_path_buf(),
            lifecycle: Lifecycle::Temporary,
        });
    }

    /// Marks an artifact final under `name`. A tracked artifact is promoted in
    /// place so it is renamed, never deleted.
    pub fn publish(&mut self, path: &Path, name: &str) {
        match self.artifacts.iter_mut().find(|a| a.path == path) {
            Some(artifact) => artifact.lifecycle = Lifecycle::Final(name.to_string()),
            None => self.artifacts.push(Artifact {
                path: path.to_path_buf(),
                lifecycle: Lifecycle::Final(name.to_string()),
            }),
        }
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn published(&self) -> impl Iterator<Item = (&Path, &str)> {
        self.artifacts.iter().filter_map(|a| match &a.lifecycle {
            Lifecycle::Final(name) => Some((a.path.as_path(), name.as_str())),
            Lifecycle::Temporary => None,
        })
    }

    /// Resolves every artifact. Temporaries are deleted, or moved into a fresh
    /// `tmp*` directory when `keep` is set; finals are renamed beside their
    /// current location. Individual failures are logged and skipped.
    ///
    /// # Arguments
    ///
    /// * `keep` - Archive temporaries instead of deleting them.
    ///
    /// # Returns
    /// LedgerReport
    pub fn finalize(self, keep: bool) -> LedgerReport {
        let mut report = LedgerReport::default();
        let (temporaries, finals): (Vec<Artifact>, Vec<Artifact>) = self
            .artifacts
            .into_iter()
            .partition(|a| a.lifecycle == Lifecycle::Temporary);

        if keep {
            match Builder::new().prefix(ARCHIVE_DIR_PREFIX).tempdir_in(&self.out_dir) {
                Ok(dir) => {
                    let archive_dir = dir.keep();
                    info!("Moving temporary files into {}", archive_dir.display());
                    for artifact in &temporaries {
                        match archive(&artifact.path, &archive_dir) {
                            Ok(Some(target)) => report.archived.push(target),
                            Ok(None) => {}
                            Err(e) => {
                                error!("Cannot move temporary file {}: {}", artifact.path.display(), e);
                                report.failures += 1;
                            }
                        }
                    }
                    report.archive_dir = Some(archive_dir);
                }
                Err(e) => {
                    error!("Cannot create temporary directory in {}: {}", self.out_dir.display(), e);
                    report.failures += 1;
                }
            }
        } else {
            info!("Removing temporary files");
            for artifact in &temporaries {
                match fs::remove_file(&artifact.path) {
                    Ok(()) => report.deleted.push(artifact.path.clone()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        error!("Cannot delete temporary file {}: {}", artifact.path.display(), e);
                        report.failures += 1;
                    }
                }
            }
        }

        for artifact in finals {
            let Lifecycle::Final(name) = &artifact.lifecycle else { continue };
            match rename_published(&artifact.path, name) {
                Ok(target) => report.published.push(target),
                Err(e) => {
                    warn!(
                        "Cannot rename {} to {}, using old name: {}",
                        artifact.path.display(),
                        name,
                        e
                    );
                    report.published.push(artifact.path.clone());
                    report.failures += 1;
                }
            }
        }

        report
    }
}


/// Moves `path` into `archive_dir`, replacing a same-named file there.
/// A file that no longer exists is skipped.
fn archive(path: &Path, archive_dir: &Path) -> io::Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "artifact has no file name"))?;
    let target = archive_dir.join(file_name);
    match fs::rename(path, &target) {
        Ok(()) => {}
        // Different filesystem: copy then remove.
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(path, &target)?;
            fs::remove_file(path)?;
        }
        Err(e) => return Err(e),
    }
    Ok(Some(target))
}


/// Renames `path` to `name` in the same directory. An existing file under the
/// published name is never overwritten.
fn rename_published(path: &Path, name: &str) -> io::Result<PathBuf> {
    let target = path.with_file_name(name);
    if target == path {
        return Ok(target);
    }
    if target.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", target.display()),
        ));
    }
    fs::rename(path, &target)?;
    Ok(target)
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, name).unwrap();
        path
    }

    #[test]
    fn test_finalize_deletes_temporaries_and_publishes() {
        let dir = tempdir().unwrap();
        let a = touch(dir.path(), "view_1.bam");
        let b = touch(dir.path(), "paired_1.sam");
        let sorted = touch(dir.path(), "sorted_1.bam");

        let mut ledger = Ledger::new(dir.path());
        ledger.track(&a);
        ledger.track(&b);
        ledger.track(&sorted);
        ledger.publish(&sorted, "clean_alignment.bam");

        let report = ledger.finalize(false);
        assert!(!a.exists() && !b.exists());
        assert!(!sorted.exists());
        assert!(dir.path().join("clean_alignment.bam").exists());
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(report.failures, 0);
    }

    #[test]
    fn test_finalize_keep_archives_temporaries() {
        let dir = tempdir().unwrap();
        let a = touch(dir.path(), "view_1.bam");
        let metrics = touch(dir.path(), "markduplicates_1.metrics");

        let mut ledger = Ledger::new(dir.path());
        ledger.track(&a);
        ledger.publish(&metrics, "remove_duplicates.metrics");

        let report = ledger.finalize(true);
        let archive_dir = report.archive_dir.expect("archive directory");
        assert!(archive_dir.starts_with(dir.path()));
        assert!(archive_dir.file_name().unwrap().to_string_lossy().starts_with("tmp"));
        assert!(!a.exists());
        assert!(archive_dir.join("view_1.bam").exists());
        assert!(dir.path().join("remove_duplicates.metrics").exists());
    }

    #[test]
    fn test_missing_temporaries_are_not_failures() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::new(dir.path());
        ledger.track(&dir.path().join("never_written.sam"));
        ledger.track(&dir.path().join("never_written.sam"));
        assert_eq!(ledger.artifacts().len(), 1);

        let report = ledger.finalize(false);
        assert_eq!(report.failures, 0);
        assert!(report.deleted.is_empty());
    }

    #[test]
    fn test_publish_does_not_clobber_existing_name() {
        let dir = tempdir().unwrap();
        let existing = touch(dir.path(), "mean.coverage");
        let fresh = touch(dir.path(), "mean_2.coverage");

        let mut ledger = Ledger::new(dir.path());
        ledger.publish(&fresh, "mean.coverage");
        let report = ledger.finalize(false);

        assert_eq!(report.failures, 1);
        assert!(fresh.exists(), "artifact keeps its original name");
        assert_eq!(fs::read_to_string(&existing).unwrap(), "mean.coverage");
    }

    #[test]
    fn test_publish_untracked_and_listing() {
        let dir = tempdir().unwrap();
        let gc = touch(dir.path(), "gc_1.metrics");
        let mut ledger = Ledger::new(dir.path());
        ledger.publish(&gc, "gc_reference.tsv");

        let published: Vec<_> = ledger.published().collect();
        assert_eq!(published, vec![(gc.as_path(), "gc_reference.tsv")]);
    }
}
