//! Size-based log rotation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::info;

/// Decides when a tailed file should be rotated and performs the rotation.
///
/// Tailers consult the rotator after a completed tail pass. After a successful rotation the
/// live file is expected to be empty, so the tailer resets its offset to 0.
pub trait Rotator: Send + Sync {
    fn check_size(&self, size: u64) -> bool;

    fn rotate(&self, path: &Path) -> Result<()>;
}

/// Rotation settings of one input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RotationConfig {
    /// Rotate once the file reaches this many bytes.
    pub max_size: u64,
    /// Number of rotated copies to keep.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

const DEFAULT_MAX_FILES: usize = 5;

fn default_max_files() -> usize {
    DEFAULT_MAX_FILES
}

/// Copy-truncate rotation: `app.log` is copied to `app.log.1` and truncated in place.
///
/// Existing copies shift up by one (`app.log.1` → `app.log.2`, …) and the copy past
/// `max_files` is removed. Truncating in place keeps the file's name and inode, so the
/// directory watcher keeps the same worker.
#[derive(Debug, Clone)]
pub struct SizeRotator {
    max_size: u64,
    max_files: usize,
}

impl SizeRotator {
    pub fn new(max_size: u64, max_files: usize) -> Self {
        Self {
            max_size,
            max_files: max_files.max(1),
        }
    }

    pub fn from_config(config: &RotationConfig) -> Self {
        Self::new(config.max_size, config.max_files)
    }
}

fn rotated_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

impl Rotator for SizeRotator {
    fn check_size(&self, size: u64) -> bool {
        self.max_size > 0 && size >= self.max_size
    }

    fn rotate(&self, path: &Path) -> Result<()> {
        let oldest = rotated_path(path, self.max_files);
        if oldest.exists() {
            fs::remove_file(&oldest)
                .with_context(|| format!("failed to remove {}", oldest.display()))?;
        }

        for index in (1..self.max_files).rev() {
            let from = rotated_path(path, index);
            if !from.exists() {
                continue;
            }
            let to = rotated_path(path, index + 1);
            fs::rename(&from, &to).with_context(|| {
                format!("failed to rename {} to {}", from.display(), to.display())
            })?;
        }

        let first = rotated_path(path, 1);
        fs::copy(path, &first)
            .with_context(|| format!("failed to copy {} to {}", path.display(), first.display()))?;

        OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|file| file.set_len(0))
            .with_context(|| format!("failed to truncate {}", path.display()))?;

        info!(path = %path.display(), rotated = %first.display(), "rotated log file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_size_uses_threshold() {
        let rotator = SizeRotator::new(100, 3);
        assert!(!rotator.check_size(99));
        assert!(rotator.check_size(100));
        assert!(!SizeRotator::new(0, 3).check_size(u64::MAX));
    }

    #[test]
    fn rotate_shifts_copies_and_truncates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("app.log");
        fs::write(&log, "third\n").expect("write log");
        fs::write(rotated_path(&log, 1), "second\n").expect("write .1");
        fs::write(rotated_path(&log, 2), "first\n").expect("write .2");

        SizeRotator::new(1, 2).rotate(&log).expect("rotate");

        assert_eq!(fs::read_to_string(&log).expect("read log"), "");
        assert_eq!(
            fs::read_to_string(rotated_path(&log, 1)).expect("read .1"),
            "third\n"
        );
        assert_eq!(
            fs::read_to_string(rotated_path(&log, 2)).expect("read .2"),
            "second\n"
        );
        assert!(!rotated_path(&log, 3).exists());
    }

    #[test]
    fn rotate_missing_file_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(SizeRotator::new(1, 2).rotate(&dir.path().join("gone.log")).is_err());
    }
}
