use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Creates and sweeps per-submission workspace files under one scratch directory
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    scratch_dir: PathBuf,
    extension: String,
}

/// The on-disk copy of a submission's source code
///
/// Owned by exactly one grading run. The file is removed by [`Workspace::release`]
/// or, on any other exit path, when the value is dropped.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    scratch_dir: PathBuf,
    released: bool,
}

impl WorkspaceManager {
    pub fn new(scratch_dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            extension: extension.into(),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Workspace file path for a submission
    pub fn path_for(&self, submission_id: &str) -> PathBuf {
        self.scratch_dir
            .join(format!("{submission_id}.{}", self.extension))
    }

    /// Writes `source_code` verbatim into a fresh workspace file
    ///
    /// Fails if the scratch directory cannot be created, the file cannot be
    /// written, or a file for the same submission already exists.
    pub fn acquire(&self, submission_id: &str, source_code: &str) -> Result<Workspace> {
        fs::create_dir_all(&self.scratch_dir).with_context(|| {
            format!(
                "Failed to create scratch directory {}",
                self.scratch_dir.display()
            )
        })?;
        let scratch_dir = fs::canonicalize(&self.scratch_dir).with_context(|| {
            format!(
                "Failed to resolve scratch directory {}",
                self.scratch_dir.display()
            )
        })?;
        let path = scratch_dir.join(format!("{submission_id}.{}", self.extension));

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("Failed to create workspace {}", path.display()))?;

        // From here on the guard owns the file and removes it on failure
        let workspace = Workspace {
            path,
            scratch_dir,
            released: false,
        };
        file.write_all(source_code.as_bytes())
            .and_then(|_| file.sync_all())
            .with_context(|| format!("Failed to write workspace {}", workspace.path.display()))?;

        log::debug!("Acquired workspace {}", workspace.path.display());
        Ok(workspace)
    }

    /// Deletes workspace files left behind by a host that died mid-run
    ///
    /// Must only be called before any grading run has started.
    pub fn sweep(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.scratch_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            let matches_extension = path
                .extension()
                .is_some_and(|ext| ext == self.extension.as_str());
            if path.is_file() && matches_extension {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }

        if removed > 0 {
            log::warn!(
                "Removed {removed} stale workspace file(s) from {}",
                self.scratch_dir.display()
            );
        }
        Ok(removed)
    }
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Canonical form of the scratch directory holding this workspace
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Deletes the workspace file
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        fs::remove_file(&self.path)
            .with_context(|| format!("Failed to remove workspace {}", self.path.display()))?;
        log::debug!("Released workspace {}", self.path.display());
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Released workspace {} on drop", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::error!("Failed to remove workspace {}: {e}", self.path.display()),
        }
    }
}
