//! Live photo library backed by a directory tree.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::{preprocess_image, Authorization, PhotoId, PhotoSource, PreprocessedImage, SourceError};

/// File extensions treated as photos (compared case-insensitively)
const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp",
];

/// Photos below `root`, identified by their `/`-separated relative path.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn is_image(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
    }

    fn path_of(&self, id: &PhotoId) -> Option<PathBuf> {
        if id.scheme() != super::Scheme::File {
            return None;
        }
        // refuse to step outside the root
        if id.key().split('/').any(|part| part == "..") {
            return None;
        }
        Some(self.root.join(id.key()))
    }
}

impl PhotoSource for DirectorySource {
    fn authorization(&self) -> Authorization {
        match std::fs::read_dir(&self.root) {
            Err(err) if err.kind() == ErrorKind::PermissionDenied => Authorization::Denied,
            // a missing root is reported by list_identifiers as an enumeration failure
            _ => Authorization::Authorized,
        }
    }

    fn list_identifiers(&self) -> Result<BTreeSet<PhotoId>, SourceError> {
        if !self.root.is_dir() {
            return Err(SourceError::Enumeration(format!(
                "library root {} is not a directory",
                self.root.display()
            )));
        }

        let mut ids = BTreeSet::new();
        for entry in WalkDir::new(&self.root).follow_links(true) {
            // an unreadable subtree would make the listing partial
            let entry = entry.map_err(|e| SourceError::Enumeration(e.to_string()))?;

            if !entry.file_type().is_file() || !Self::is_image(entry.path()) {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| SourceError::Enumeration(e.to_string()))?;

            let Some(relative) = relative.to_str() else {
                log::warn!("skipping non UTF-8 path {}", entry.path().display());
                continue;
            };

            ids.insert(PhotoId::file(relative));
        }

        Ok(ids)
    }

    fn fetch_image(&self, id: &PhotoId, target_size: u32) -> Result<PreprocessedImage, SourceError> {
        let path = self
            .path_of(id)
            .ok_or_else(|| SourceError::NotFound(id.clone()))?;

        let data = std::fs::read(&path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => SourceError::NotFound(id.clone()),
            _ => SourceError::Io {
                id: id.clone(),
                source,
            },
        })?;

        preprocess_image(&data, target_size).map_err(|e| SourceError::Decode {
            id: id.clone(),
            message: e.to_string(),
        })
    }

    fn locate(&self, id: &PhotoId) -> Option<PathBuf> {
        self.path_of(id)
    }
}
