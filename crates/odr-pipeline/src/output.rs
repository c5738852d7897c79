//! On-disk layout of a pipeline's outputs
//!
//! A files pipeline mirrors record files into category directories under
//! `output_root`; a data pipeline builds static files there. Both keep a
//! marker file whose mtime is the watermark for incremental runs, and a data
//! pipeline writes each run into temporary files named `{path}.{extension}`
//! until the Finisher moves them into place.

use crate::config::{CategoryConfig, OutputConfig, PipelineConfig};
use crate::error::{PipelineError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Name of the single-flight lock file inside `output_root`
pub const RUN_LOCK_FILE: &str = ".odr-run.lock";

#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
    archive_root: PathBuf,
    marker: PathBuf,
    categories: Vec<CategoryConfig>,
    outputs: Vec<OutputConfig>,
}

impl OutputLayout {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            root: config.output_root.clone(),
            archive_root: config.archive_root().to_path_buf(),
            marker: config.output_root.join(&config.marker_file),
            categories: config.categories.clone(),
            outputs: config.outputs.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    pub fn categories(&self) -> &[CategoryConfig] {
        &self.categories
    }

    pub fn outputs(&self) -> &[OutputConfig] {
        &self.outputs
    }

    pub fn category_dir(&self, category: &CategoryConfig) -> PathBuf {
        self.root.join(&category.directory)
    }

    pub fn archive_path(&self, category: &CategoryConfig) -> PathBuf {
        self.archive_root.join(&category.archive)
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// `{path}.{extension}`, the per-run temporary copy of an output
    pub fn temp_path(&self, output: &OutputConfig, extension: &str) -> PathBuf {
        let mut name = self.resolve(&output.path).into_os_string();
        name.push(".");
        name.push(extension);
        PathBuf::from(name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputConfig> {
        self.outputs.iter().find(|o| o.name == name)
    }

    // ========================================================================
    // Watermark
    // ========================================================================

    /// Marker mtime in epoch milliseconds; `None` when there is no marker yet
    pub async fn watermark_millis(&self) -> Result<Option<i64>> {
        match tokio::fs::metadata(&self.marker).await {
            Ok(meta) => {
                let modified = meta.modified().map_err(|e| PipelineError::file_io(&self.marker, e))?;
                Ok(Some(DateTime::<Utc>::from(modified).timestamp_millis()))
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::file_io(&self.marker, e)),
        }
    }

    /// Create the marker if needed and set its mtime to now
    pub async fn touch_marker(&self) -> Result<()> {
        if let Some(parent) = self.marker.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::file_io(parent, e))?;
        }

        let marker = self.marker.clone();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&marker)
                .map_err(|e| PipelineError::file_io(&marker, e))?;
            file.set_modified(SystemTime::now())
                .map_err(|e| PipelineError::file_io(&marker, e))
        })
        .await
        .map_err(|e| PipelineError::Io(std::io::Error::other(e)))??;

        debug!(marker = %self.marker.display(), "Touched watermark marker");
        Ok(())
    }

    // ========================================================================
    // Category directories
    // ========================================================================

    /// Delete every file below every category directory, keeping the
    /// directories themselves. Returns the number of files removed.
    pub async fn clear_categories(&self) -> Result<usize> {
        let dirs: Vec<PathBuf> = self.categories.iter().map(|c| self.category_dir(c)).collect();

        tokio::task::spawn_blocking(move || {
            let mut removed = 0;
            for dir in dirs {
                if !dir.is_dir() {
                    continue;
                }
                for entry in WalkDir::new(&dir).min_depth(1) {
                    let entry = match entry {
                        Ok(entry) => entry,
                        Err(e) => {
                            warn!(dir = %dir.display(), error = %e, "Cannot walk category directory");
                            continue;
                        },
                    };
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    match std::fs::remove_file(entry.path()) {
                        Ok(()) => removed += 1,
                        Err(e) => warn!(path = %entry.path().display(), error = %e, "Cannot delete file"),
                    }
                }
            }
            removed
        })
        .await
        .map_err(|e| PipelineError::Io(std::io::Error::other(e)))
    }

    /// For each name, delete the first copy found across the category
    /// directories. Returns the number of files removed.
    pub async fn delete_modified(&self, names: &[String]) -> usize {
        let mut removed = 0;
        for name in names {
            if name.is_empty() || name.contains('/') || name.contains("..") {
                warn!(name = %name, "Skipping unsafe modified file name");
                continue;
            }

            let mut found = false;
            for category in &self.categories {
                let path = self.category_dir(category).join(name);
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    found = true;
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {
                            debug!(path = %path.display(), "Deleted modified file");
                            removed += 1;
                        },
                        Err(e) => warn!(path = %path.display(), error = %e, "Cannot delete modified file"),
                    }
                    break;
                }
            }

            if !found {
                debug!(name = %name, "Modified file not present locally");
            }
        }
        removed
    }

    // ========================================================================
    // Data outputs
    // ========================================================================

    /// Create this run's temporary outputs: headers on a full rebuild, empty
    /// files on an incremental one
    pub async fn init_temp_outputs(&self, extension: &str, full_rebuild: bool) -> Result<()> {
        for output in &self.outputs {
            let path = self.temp_path(output, extension);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PipelineError::file_io(parent, e))?;
            }
            let content = if full_rebuild { output.header.as_str() } else { "" };
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| PipelineError::file_io(&path, e))?;
        }
        Ok(())
    }

    /// Append one rendered line to this run's copy of `output`
    pub async fn append(&self, output: &OutputConfig, extension: &str, line: &str) -> Result<()> {
        let path = self.temp_path(output, extension);
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| PipelineError::file_io(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| PipelineError::file_io(&path, e))?;
        file.flush().await.map_err(|e| PipelineError::file_io(&path, e))
    }

    /// Move this run's temporary outputs into place.
    ///
    /// Incremental runs land in each output's update file when it has one. A
    /// full rebuild replaces the canonical files and empties the update files.
    pub async fn promote_outputs(&self, extension: &str, incremental: bool) -> Result<()> {
        for output in &self.outputs {
            let temp = self.temp_path(output, extension);
            let target = match (&output.update_path, incremental) {
                (Some(update), true) => self.resolve(update),
                _ => self.resolve(&output.path),
            };

            match tokio::fs::rename(&temp, &target).await {
                Ok(()) => info!(from = %temp.display(), to = %target.display(), "Promoted output"),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!(path = %temp.display(), "Temporary output missing, leaving target untouched");
                },
                Err(e) => return Err(PipelineError::file_io(&temp, e)),
            }

            if !incremental {
                if let Some(update) = &output.update_path {
                    let update = self.resolve(update);
                    tokio::fs::write(&update, "")
                        .await
                        .map_err(|e| PipelineError::file_io(&update, e))?;
                }
            }
        }
        Ok(())
    }

    /// Best-effort removal of this run's temporary outputs
    pub async fn remove_temp_outputs(&self, extension: &str) -> usize {
        let mut removed = 0;
        for output in &self.outputs {
            let path = self.temp_path(output, extension);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {},
                Err(e) => warn!(path = %path.display(), error = %e, "Cannot delete temporary output"),
            }
        }
        removed
    }
}

// ============================================================================
// File mirroring helpers
// ============================================================================

/// Files in `dir` (not recursive) whose name starts with `stub`
pub async fn stub_matches(dir: &Path, stub: &str) -> Vec<PathBuf> {
    let mut matches = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return matches,
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_file && entry.file_name().to_string_lossy().starts_with(stub) {
            matches.push(entry.path());
        }
    }
    matches.sort();
    matches
}

/// Delete every candidate that is not in `valid`. Returns how many went.
pub async fn remove_stale(candidates: &[PathBuf], valid: &HashSet<PathBuf>) -> usize {
    let mut removed = 0;
    for path in candidates {
        if valid.contains(path) {
            continue;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!(path = %path.display(), "Removed stale file");
                removed += 1;
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot remove stale file"),
        }
    }
    removed
}

/// Parse an upload timestamp: RFC 3339 or `YYYY-MM-DD HH:MM:SS[.f]` (UTC)
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// A local copy is current when it exists and is not older than the remote
/// upload time. An unknown upload time always counts as stale.
pub async fn is_up_to_date(path: &Path, remote_created: Option<&str>) -> bool {
    let Some(remote) = remote_created.and_then(parse_timestamp) else {
        return false;
    };
    match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => DateTime::<Utc>::from(modified) >= remote,
        Err(_) => false,
    }
}

// ============================================================================
// Single-flight lock
// ============================================================================

/// Held for the lifetime of one pipeline run
#[derive(Debug)]
pub struct RunLock {
    path: Option<PathBuf>,
}

impl RunLock {
    pub fn path_in(root: &Path) -> PathBuf {
        root.join(RUN_LOCK_FILE)
    }

    /// Fails with `Busy` when another run holds the lock
    pub async fn acquire(root: &Path, owner: &str) -> Result<Self> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| PipelineError::file_io(root, e))?;

        let path = Self::path_in(root);
        let mut file = match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = tokio::fs::read_to_string(&path).await.unwrap_or_default();
                return Err(PipelineError::Busy(format!(
                    "run lock {} is held by run '{}'",
                    path.display(),
                    holder.trim()
                )));
            },
            Err(e) => return Err(PipelineError::file_io(&path, e)),
        };
        file.write_all(owner.as_bytes())
            .await
            .map_err(|e| PipelineError::file_io(&path, e))?;

        Ok(Self { path: Some(path) })
    }

    /// Keep the lock on disk after this guard is dropped; the Finisher
    /// releases it with [`RunLock::release_in`]
    pub fn persist(mut self) {
        self.path = None;
    }

    /// Remove the lock file if present
    pub async fn release_in(root: &Path) {
        let path = Self::path_in(root);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "Released run lock"),
            Err(e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot release run lock"),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Cannot release run lock");
            }
        }
    }
}
