//! Bundled demo image set.
//!
//! Exposes `count` numbered photos `sample:image_<n>`; photo `n` is backed by
//! the `n mod m`-th image file of the sample directory (sorted by name), so a
//! handful of files can stand in for a large library.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::{preprocess_image, PhotoId, PhotoSource, PreprocessedImage, Scheme, SourceError};

pub struct SampleSource {
    dir: PathBuf,
    count: usize,
}

impl SampleSource {
    pub fn new(dir: PathBuf, count: usize) -> Self {
        Self { dir, count }
    }

    fn sample_files(&self) -> Result<Vec<PathBuf>, SourceError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            SourceError::Enumeration(format!(
                "failed to read sample directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_image(path))
            .collect();
        files.sort();

        Ok(files)
    }

    fn number_of(id: &PhotoId) -> Option<usize> {
        if id.scheme() != Scheme::Sample {
            return None;
        }
        id.key().strip_prefix("image_")?.parse().ok()
    }

    fn file_for(&self, id: &PhotoId) -> Result<PathBuf, SourceError> {
        let number = Self::number_of(id)
            .filter(|n| *n < self.count)
            .ok_or_else(|| SourceError::NotFound(id.clone()))?;

        let files = self.sample_files()?;
        if files.is_empty() {
            return Err(SourceError::NotFound(id.clone()));
        }

        Ok(files[number % files.len()].clone())
    }
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
            .as_deref(),
        Some("jpg" | "jpeg" | "png")
    )
}

impl PhotoSource for SampleSource {
    fn list_identifiers(&self) -> Result<BTreeSet<PhotoId>, SourceError> {
        if self.sample_files()?.is_empty() {
            log::warn!("no sample images found in {}", self.dir.display());
            return Ok(BTreeSet::new());
        }

        Ok((0..self.count).map(PhotoId::sample).collect())
    }

    fn fetch_image(&self, id: &PhotoId, target_size: u32) -> Result<PreprocessedImage, SourceError> {
        let path = self.file_for(id)?;
        let data = std::fs::read(&path).map_err(|source| SourceError::Io {
            id: id.clone(),
            source,
        })?;

        preprocess_image(&data, target_size).map_err(|e| SourceError::Decode {
            id: id.clone(),
            message: e.to_string(),
        })
    }

    fn locate(&self, id: &PhotoId) -> Option<PathBuf> {
        self.file_for(id).ok()
    }
}
