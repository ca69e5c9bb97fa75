use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{PatchError, Result};
use crate::util;

/// Permission bits given to files when the caller has nothing better.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// One file's byte range inside a container's concatenated view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub mode: u32,
    pub offset: u64,
    pub size: u64,
}

/// An ordered set of files laid out back to back in one logical blob.
///
/// Diffing and patching address bytes through `(offset, size)` ranges, so the
/// engine never has to know where the files actually live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub size: u64,
    pub files: Vec<FileEntry>,
}

impl Container {
    /// A container holding exactly one file spanning `[0, size)`.
    pub fn single_file(path: impl Into<String>, size: u64) -> Self {
        Self {
            size,
            files: vec![FileEntry {
                path: path.into(),
                mode: DEFAULT_FILE_MODE,
                offset: 0,
                size,
            }],
        }
    }

    /// Pack `(path, mode, size)` triples contiguously, in the given order.
    pub fn pack<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = (S, u32, u64)>,
        S: Into<String>,
    {
        let mut offset = 0u64;
        let files: Vec<FileEntry> = files
            .into_iter()
            .map(|(path, mode, size)| {
                let entry = FileEntry {
                    path: path.into(),
                    mode,
                    offset,
                    size,
                };
                offset += size;
                entry
            })
            .collect();

        Self {
            size: offset,
            files,
        }
    }

    /// Check that files are packed back to back from offset zero and that
    /// their sizes add up to the container size.
    pub fn validate(&self) -> Result<()> {
        let mut expected_offset = 0u64;
        for (index, file) in self.files.iter().enumerate() {
            if file.offset != expected_offset {
                return Err(PatchError::InvalidContainer(format!(
                    "file {} ({}) starts at offset {}, expected {}",
                    index, file.path, file.offset, expected_offset
                )));
            }
            expected_offset = file.offset.checked_add(file.size).ok_or_else(|| {
                PatchError::InvalidContainer(format!("file {} ({}) overflows", index, file.path))
            })?;
        }

        if expected_offset != self.size {
            return Err(PatchError::InvalidContainer(format!(
                "files add up to {} bytes but container size is {}",
                expected_offset, self.size
            )));
        }

        Ok(())
    }

    /// Portable patches only carry relative paths.
    pub fn ensure_relative_paths(&self) -> Result<()> {
        for file in &self.files {
            if file.path.starts_with('/') || Path::new(&file.path).is_absolute() {
                return Err(PatchError::InvalidContainer(format!(
                    "{}: only relative paths are allowed",
                    file.path
                )));
            }
        }
        Ok(())
    }

    /// Slice out file `index` from the container's concatenated bytes.
    pub fn file_data<'a>(&self, blob: &'a [u8], index: usize) -> Result<&'a [u8]> {
        let file = self.files.get(index).ok_or_else(|| {
            PatchError::InvalidContainer(format!(
                "file index {} out of range ({} files)",
                index,
                self.files.len()
            ))
        })?;

        let start = usize::try_from(file.offset).ok();
        let end = file
            .offset
            .checked_add(file.size)
            .and_then(|end| usize::try_from(end).ok());

        match (start, end) {
            (Some(start), Some(end)) if end <= blob.len() => Ok(&blob[start..end]),
            _ => Err(PatchError::InvalidContainer(format!(
                "file {} ({}) spans [{}, +{}) outside of {} bytes of data",
                index,
                file.path,
                file.offset,
                file.size,
                blob.len()
            ))),
        }
    }

    pub fn find_by_path(&self, path: &str) -> Option<usize> {
        self.files.iter().position(|f| f.path == path)
    }

    /// Short human-readable summary, e.g. `"2 files, 1.5 KiB"`.
    pub fn stats(&self) -> String {
        let noun = if self.files.len() == 1 { "file" } else { "files" };
        format!(
            "{} {}, {}",
            self.files.len(),
            noun,
            util::format_bytes(self.size)
        )
    }
}
