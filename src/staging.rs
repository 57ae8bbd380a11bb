//! Ephemeral files backing a single request.
//!
//! Inputs are streamed from the connection straight into a file in the
//! staging directory, and processors write their outputs next to them. Every
//! file belonging to a request is tracked by one [`StagedFiles`] value, which
//! removes all of them exactly once when it is cleaned up or dropped.
use std::{
    fs::{self, File},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use log::{trace, warn};
use thiserror::Error;

/// Extension used when a media type tag is not a plain alphanumeric word.
const FALLBACK_EXTENSION: &str = "bin";
const MAX_EXTENSION_LENGTH: usize = 16;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging directory '{path}' unavailable: {source}")]
    Directory { path: PathBuf, source: io::Error },

    #[error("failed to stage file: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Opens the staging directory, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StagingError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StagingError::Directory {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates an empty, uniquely named input file whose extension is derived
    /// from `media_type`.
    pub fn stage_input(&self, media_type: &str) -> Result<(File, StagedFiles), StagingError> {
        let (file, path) = tempfile::Builder::new()
            .prefix("input_")
            .suffix(&format!(".{}", file_extension(media_type)))
            .tempfile_in(&self.dir)?
            .keep()
            .map_err(|e| StagingError::Io(e.error))?;

        trace!("staged input {path:?}");
        Ok((
            file,
            StagedFiles {
                input: path.clone(),
                files: vec![path],
            },
        ))
    }
}

/// Files owned by one request.
#[derive(Debug)]
pub struct StagedFiles {
    input: PathBuf,
    files: Vec<PathBuf>,
}

impl StagedFiles {
    pub fn input(&self) -> &Path {
        &self.input
    }

    /// Takes ownership of another file so it is removed with the rest.
    pub fn track(&mut self, path: PathBuf) {
        if !self.files.contains(&path) {
            self.files.push(path);
        }
    }

    /// Removes every tracked file. Failures are logged, not returned.
    pub fn cleanup(&mut self) {
        for path in self.files.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => trace!("removed {path:?}"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove staged file {path:?}: {e}"),
            }
        }
    }
}

impl Drop for StagedFiles {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Maps a media type tag onto a safe file extension.
pub fn file_extension(media_type: &str) -> &str {
    let valid = !media_type.is_empty()
        && media_type.len() <= MAX_EXTENSION_LENGTH
        && media_type.chars().all(|c| c.is_ascii_alphanumeric());

    if valid { media_type } else { FALLBACK_EXTENSION }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempdir::TempDir;

    use super::*;

    #[test]
    fn staging_creates_directory() {
        let temp = TempDir::new("staging").unwrap();
        let dir = temp.path().join("nested").join("tmp");

        let staging = StagingArea::new(&dir).unwrap();
        assert!(staging.dir().is_dir());
    }

    #[test]
    fn staged_input_named_by_media_type() {
        let temp = TempDir::new("staging").unwrap();
        let staging = StagingArea::new(temp.path()).unwrap();

        let (mut file, staged) = staging.stage_input("mov").unwrap();
        file.write_all(b"frames").unwrap();

        let input = staged.input();
        assert_eq!(input.extension().unwrap(), "mov");
        assert!(input.file_name().unwrap().to_string_lossy().starts_with("input_"));
        assert_eq!(fs::read(input).unwrap(), b"frames");
    }

    #[test]
    fn staged_files_removed_on_drop() {
        let temp = TempDir::new("staging").unwrap();
        let staging = StagingArea::new(temp.path()).unwrap();

        let (_, mut staged) = staging.stage_input("mp4").unwrap();
        let output = temp.path().join("output.mp3");
        fs::write(&output, b"audio").unwrap();
        staged.track(output.clone());
        let input = staged.input().to_path_buf();

        drop(staged);
        assert!(!input.exists());
        assert!(!output.exists());
    }

    #[test]
    fn staged_files_cleanup_tolerates_missing() {
        let temp = TempDir::new("staging").unwrap();
        let staging = StagingArea::new(temp.path()).unwrap();

        let (_, mut staged) = staging.stage_input("mp4").unwrap();
        staged.track(temp.path().join("never-written.gif"));
        staged.cleanup();
        staged.cleanup();

        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn extension_sanitised() {
        assert_eq!(file_extension("mp4"), "mp4");
        assert_eq!(file_extension("../../etc/passwd"), "bin");
        assert_eq!(file_extension(""), "bin");
        assert_eq!(file_extension("a.b"), "bin");
    }
}
