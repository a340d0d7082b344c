//! Frame discovery in a working directory

use crate::errors::{Result, StackError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Extensions recognised as frames, compared case-insensitively
pub const FRAME_EXTENSIONS: [&str; 5] = ["jpeg", "jpg", "png", "tif", "tiff"];

/// How a directory listing is turned into a frame sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSelection {
    pub reverse_order: bool,
    /// Keep every n-th frame
    pub resample: usize,
}

impl Default for FrameSelection {
    fn default() -> Self {
        Self {
            reverse_order: false,
            resample: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameDirectory {
    path: PathBuf,
    selection: FrameSelection,
}

impl FrameDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            selection: FrameSelection::default(),
        }
    }

    pub fn with_selection(mut self, selection: FrameSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sorted frame file names, then reversed and resampled as configured.
    pub fn list(&self) -> Result<Vec<String>> {
        if self.selection.resample == 0 {
            return Err(StackError::configuration("resample", 0));
        }
        let entries = fs::read_dir(&self.path).map_err(|e| StackError::Load {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_frame_name(&name) {
                names.push(name);
            }
        }
        names.sort();
        if self.selection.reverse_order {
            names.reverse();
        }
        let names: Vec<String> = names
            .into_iter()
            .step_by(self.selection.resample)
            .collect();
        log::debug!("{} frames in {:?}", names.len(), self.path);
        Ok(names)
    }
}

pub fn is_frame_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            FRAME_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            fs::write(dir.join(name), b"").unwrap();
        }
    }

    #[test]
    fn test_lists_sorted_frames_only() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["c.PNG", "a.jpg", "notes.txt", "b.tiff"]);
        fs::create_dir(dir.path().join("sub.png")).unwrap();

        let names = FrameDirectory::new(dir.path()).list().unwrap();
        assert_eq!(names, vec!["a.jpg", "b.tiff", "c.PNG"]);
    }

    #[test]
    fn test_reverse_and_resample() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["0.png", "1.png", "2.png", "3.png", "4.png"]);

        let names = FrameDirectory::new(dir.path())
            .with_selection(FrameSelection {
                reverse_order: true,
                resample: 2,
            })
            .list()
            .unwrap();
        assert_eq!(names, vec!["4.png", "2.png", "0.png"]);
    }

    #[test]
    fn test_missing_directory() {
        let err = FrameDirectory::new("/definitely/not/here").list().unwrap_err();
        assert!(matches!(err, StackError::Load { .. }));
    }

    #[test]
    fn test_zero_resample_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = FrameDirectory::new(dir.path())
            .with_selection(FrameSelection {
                reverse_order: false,
                resample: 0,
            })
            .list()
            .unwrap_err();
        assert!(matches!(err, StackError::Configuration { .. }));
    }
}
