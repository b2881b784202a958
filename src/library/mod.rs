//! Photo library collaborators.
//!
//! The search core only sees a [`PhotoSource`]: something that can say whether
//! it may be read, list the identifiers it currently holds and hand out a
//! preprocessed image for one of them.
//!
//! - `directory`: a live library rooted at a directory on disk
//! - `samples`: the bundled, numbered demo image set
//! - `preprocess`: decode + resize + center-crop into encoder input

mod directory;
mod photo_id;
mod preprocess;
mod samples;

use std::collections::BTreeSet;

pub use directory::DirectorySource;
pub use photo_id::{PhotoId, PhotoIdError, Scheme};
pub use preprocess::{preprocess_image, PreprocessedImage, DEFAULT_TARGET_SIZE};
pub use samples::SampleSource;

/// Access the host granted to the photo library.
///
/// Only `Authorized` lets the core see any identifiers; every other status is
/// treated as an empty library rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Authorization {
    Authorized,
    Denied,
    Restricted,
    NotDetermined,
    Limited,
}

impl Authorization {
    pub fn is_authorized(self) -> bool {
        matches!(self, Authorization::Authorized)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("photo not found: {0}")]
    NotFound(PhotoId),

    #[error("failed to read {id}: {source}")]
    Io {
        id: PhotoId,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {id}: {message}")]
    Decode { id: PhotoId, message: String },

    #[error("library enumeration failed: {0}")]
    Enumeration(String),
}

pub trait PhotoSource: Send + Sync {
    fn authorization(&self) -> Authorization {
        Authorization::Authorized
    }

    /// Every identifier currently present in the library.
    fn list_identifiers(&self) -> Result<BTreeSet<PhotoId>, SourceError>;

    /// Load `id` and prepare it as a `target_size` square encoder input.
    fn fetch_image(&self, id: &PhotoId, target_size: u32)
        -> Result<PreprocessedImage, SourceError>;

    /// Where the photo lives on disk, if it has a location worth showing.
    fn locate(&self, _id: &PhotoId) -> Option<std::path::PathBuf> {
        None
    }
}
