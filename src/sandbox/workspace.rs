//! Ephemeral workspace directories for test execution.
//!
//! Each execution attempt gets a fresh directory named by a new UUID under
//! the configured workspaces root. A workspace is released explicitly by the
//! orchestrator once its result has been consumed; if it is dropped without
//! being released (early return, panic) the directory is removed
//! synchronously instead. Removal is always best-effort.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::FileSet;

/// A single-use directory tree for one execution attempt
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    released: bool,
}

impl Workspace {
    /// Pick a fresh location under `base`. Nothing is created on disk yet.
    pub fn new(base: &Path) -> Self {
        Self {
            root: base.join(Uuid::new_v4().to_string()),
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Create the workspace root
    pub async fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create workspace: {}", self.root.display()))
    }

    /// Write every file to its relative path, creating parent directories
    pub async fn write_files(&self, files: &FileSet) -> Result<()> {
        for (rel_path, content) in files {
            let rel = safe_relative(rel_path)?;
            let full_path = self.root.join(rel);

            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }

            fs::write(&full_path, content)
                .await
                .with_context(|| format!("Failed to write file: {}", full_path.display()))?;
        }

        Ok(())
    }

    /// Create package marker files the harness needs to resolve local imports.
    ///
    /// A marker goes into the workspace root, the test directory, and every
    /// directory holding a file with the marker's extension. Existing files
    /// are left untouched.
    pub async fn ensure_markers(
        &self,
        marker: &str,
        test_dir: &str,
        files: &[&FileSet],
    ) -> Result<Vec<PathBuf>> {
        if marker.is_empty() {
            return Ok(Vec::new());
        }

        let mut dirs: BTreeSet<PathBuf> = BTreeSet::new();
        dirs.insert(PathBuf::new());
        dirs.insert(safe_relative(test_dir)?);

        if let Some(ext) = Path::new(marker).extension() {
            for set in files {
                for rel_path in set.keys() {
                    let rel = safe_relative(rel_path)?;
                    if rel.extension() == Some(ext) {
                        if let Some(parent) = rel.parent() {
                            dirs.insert(parent.to_path_buf());
                        }
                    }
                }
            }
        }

        let mut created = Vec::new();
        for dir in dirs {
            let dir_path = self.root.join(&dir);
            fs::create_dir_all(&dir_path)
                .await
                .with_context(|| format!("Failed to create directory: {}", dir_path.display()))?;

            let marker_path = dir_path.join(marker);
            if !fs::try_exists(&marker_path).await.unwrap_or(false) {
                fs::write(&marker_path, "")
                    .await
                    .with_context(|| format!("Failed to write marker: {}", marker_path.display()))?;
                created.push(dir.join(marker));
            }
        }

        Ok(created)
    }

    /// Delete the workspace. Errors are logged and swallowed.
    pub async fn release(mut self) {
        self.released = true;
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!(workspace = %self.root.display(), "Workspace removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(workspace = %self.root.display(), error = %e, "Workspace cleanup failed"),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }
}

/// Validate a generated path, keeping it inside the workspace
pub fn safe_relative(path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    if path.trim().is_empty() {
        anyhow::bail!("Empty file path");
    }

    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                anyhow::bail!("File path escapes the workspace: {}", path)
            }
        }
    }

    Ok(clean)
}
