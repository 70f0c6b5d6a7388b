use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::error::StorageError;
use crate::job::{validate_job_id, SourceFormat};

/// Extension of every conversion output.
pub const OUTPUT_EXTENSION: &str = "step";

/// Move a file from `src` to `dst`. Uses `rename` first (atomic on the same
/// filesystem) and falls back to copy + delete for cross-device moves.
fn move_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    std::fs::copy(src, dst).map_err(|e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })?;
    std::fs::remove_file(src).map_err(|e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// Removes a file, treating "already gone" as success. Returns whether a
/// file was actually removed.
fn remove_if_present(path: &Path) -> Result<bool, StorageError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::RemoveFile {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Ids that could escape the artifact directories never reach the filesystem.
fn checked_id(job_id: &str) -> Result<(), StorageError> {
    validate_job_id(job_id).map_err(|_| StorageError::InvalidJobId(job_id.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Input,
    Output,
}

/// A file found on disk by [`ArtifactStore::list_artifacts`].
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub path: PathBuf,
    /// File stem, which is the owning job id.
    pub job_id: String,
    pub kind: ArtifactKind,
    pub modified: SystemTime,
}

/// Job files addressed by job id: `uploads/<id>.<source ext>` and
/// `outputs/<id>.step`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    uploads_dir: PathBuf,
    outputs_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(uploads_dir: P, outputs_dir: Q) -> Self {
        Self {
            uploads_dir: uploads_dir.as_ref().to_path_buf(),
            outputs_dir: outputs_dir.as_ref().to_path_buf(),
        }
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    pub fn outputs_dir(&self) -> &Path {
        &self.outputs_dir
    }

    pub fn ensure_dirs(&self) -> Result<(), StorageError> {
        for dir in [&self.uploads_dir, &self.outputs_dir] {
            std::fs::create_dir_all(dir).map_err(|e| StorageError::CreateDirectory {
                path: dir.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Path builders do not check `job_id`; pass only ids accepted by
    /// [`validate_job_id`].
    pub fn input_path(&self, job_id: &str, format: SourceFormat) -> PathBuf {
        self.uploads_dir
            .join(format!("{}.{}", job_id, format.extension()))
    }

    pub fn output_path(&self, job_id: &str) -> PathBuf {
        self.outputs_dir
            .join(format!("{}.{}", job_id, OUTPUT_EXTENSION))
    }

    /// Moves a staged upload to its canonical input location.
    pub fn adopt_input(
        &self,
        staged: &Path,
        job_id: &str,
        format: SourceFormat,
    ) -> Result<PathBuf, StorageError> {
        checked_id(job_id)?;
        self.ensure_dirs()?;
        let target = self.input_path(job_id, format);
        move_file(staged, &target)?;
        Ok(target)
    }

    /// Deletes every input and output file of a job. Returns how many files
    /// were removed; missing files are not an error.
    pub fn remove_job_artifacts(&self, job_id: &str) -> Result<usize, StorageError> {
        checked_id(job_id)?;
        let mut removed = 0;
        for format in SourceFormat::ALL {
            if remove_if_present(&self.input_path(job_id, format))? {
                removed += 1;
            }
        }
        if remove_if_present(&self.output_path(job_id))? {
            removed += 1;
        }
        Ok(removed)
    }

    pub fn remove_artifact(&self, artifact: &Artifact) -> Result<bool, StorageError> {
        remove_if_present(&artifact.path)
    }

    /// All regular files directly under the uploads and outputs directories.
    /// A missing directory contributes nothing.
    pub fn list_artifacts(&self) -> Result<Vec<Artifact>, StorageError> {
        let mut artifacts = Vec::new();
        for (dir, kind) in [
            (&self.uploads_dir, ArtifactKind::Input),
            (&self.outputs_dir, ArtifactKind::Output),
        ] {
            if !dir.exists() {
                continue;
            }
            for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
                let entry = entry.map_err(|e| StorageError::ScanFailed {
                    path: dir.clone(),
                    source: e,
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(job_id) = entry.path().file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                // Files can vanish between listing and stat.
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                artifacts.push(Artifact {
                    job_id: job_id.to_string(),
                    path: entry.path().to_path_buf(),
                    kind,
                    modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }
        Ok(artifacts)
    }
}
