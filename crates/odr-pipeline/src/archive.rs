//! Zip archives of category directories

use crate::error::{PipelineError, Result};
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Outcome of archiving one directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveResult {
    Written { path: PathBuf, entries: usize },
    /// Directory missing or without files; any previous archive is kept
    Skipped,
}

fn zip_error(path: &Path, err: zip::result::ZipError) -> PipelineError {
    PipelineError::file_io(path, std::io::Error::other(err))
}

/// Zip every file below `dir` into `archive`, with entry names relative to
/// `dir`. The archive is written next to its target and renamed into place.
pub fn archive_directory(dir: &Path, archive: &Path) -> Result<ArchiveResult> {
    if !dir.is_dir() {
        debug!(dir = %dir.display(), "Archive source missing, skipping");
        return Ok(ArchiveResult::Skipped);
    }

    let mut files: Vec<(PathBuf, String)> = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let err = e.into_io_error().unwrap_or_else(|| std::io::Error::from(ErrorKind::Other));
            PipelineError::file_io(dir, err)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.path().to_path_buf(), name));
    }

    if files.is_empty() {
        debug!(dir = %dir.display(), "Archive source empty, skipping");
        return Ok(ArchiveResult::Skipped);
    }

    if let Some(parent) = archive.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::file_io(parent, e))?;
    }

    let mut tmp_name = archive.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let written = write_archive(&tmp, &files);
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }

    std::fs::rename(&tmp, archive).map_err(|e| PipelineError::file_io(archive, e))?;
    info!(archive = %archive.display(), entries = files.len(), "Archive written");

    Ok(ArchiveResult::Written {
        path: archive.to_path_buf(),
        entries: files.len(),
    })
}

fn write_archive(tmp: &Path, files: &[(PathBuf, String)]) -> Result<()> {
    let out = File::create(tmp).map_err(|e| PipelineError::file_io(tmp, e))?;
    let mut writer = ZipWriter::new(BufWriter::new(out));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    for (path, name) in files {
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| zip_error(tmp, e))?;
        let mut input = File::open(path).map_err(|e| PipelineError::file_io(path, e))?;
        std::io::copy(&mut input, &mut writer).map_err(|e| PipelineError::file_io(path, e))?;
    }

    let mut out = writer.finish().map_err(|e| zip_error(tmp, e))?;
    out.flush().map_err(|e| PipelineError::file_io(tmp, e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_archive_relative_entries() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("raman/lr-raman");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("b.txt"), "bee").unwrap();
        std::fs::write(src.join("sub/a.txt"), "ay").unwrap();

        let archive = dir.path().join("zips/raman/LR-Raman.zip");
        let result = archive_directory(&src, &archive).unwrap();
        assert_eq!(
            result,
            ArchiveResult::Written {
                path: archive.clone(),
                entries: 2
            }
        );
        assert!(!dir.path().join("zips/raman/LR-Raman.zip.tmp").exists());

        let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let mut names: Vec<String> = zip.file_names().map(String::from).collect();
        names.sort();
        assert_eq!(names, vec!["b.txt", "sub/a.txt"]);

        let mut body = String::new();
        zip.by_name("sub/a.txt").unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "ay");
    }

    #[test]
    fn test_missing_or_empty_directory_is_skipped() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("out.zip");
        std::fs::write(&archive, "previous").unwrap();

        assert_eq!(
            archive_directory(&dir.path().join("missing"), &archive).unwrap(),
            ArchiveResult::Skipped
        );

        let empty = dir.path().join("empty");
        std::fs::create_dir_all(empty.join("nested")).unwrap();
        assert_eq!(archive_directory(&empty, &archive).unwrap(), ArchiveResult::Skipped);
        assert_eq!(std::fs::read_to_string(&archive).unwrap(), "previous");
    }
}
