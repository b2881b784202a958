//! Stable photo identifiers.
//!
//! A `PhotoId` is the join key between the live library and the embedding
//! store. It is stored as `<scheme>:<key>`; equality, hashing and ordering all
//! operate on that full string, so identifiers from different schemes never
//! compare equal even when their keys do.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier scheme, i.e. where a photo came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Path relative to a library root directory.
    File,
    /// Numbered image of the bundled sample set.
    Sample,
}

impl Scheme {
    pub fn prefix(self) -> &'static str {
        match self {
            Scheme::File => "file",
            Scheme::Sample => "sample",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "file" => Some(Scheme::File),
            "sample" => Some(Scheme::Sample),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PhotoIdError {
    #[error("photo identifier is missing a scheme: {0:?}")]
    MissingScheme(String),

    #[error("unknown photo identifier scheme: {0:?}")]
    UnknownScheme(String),

    #[error("photo identifier has an empty key: {0:?}")]
    EmptyKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhotoId(String);

impl PhotoId {
    /// Identifier for a file below a library root. Path separators are
    /// normalized to `/` so the same file keeps its identity across platforms.
    pub fn file(relative_path: &str) -> Self {
        Self(format!(
            "{}:{}",
            Scheme::File.prefix(),
            relative_path.replace('\\', "/")
        ))
    }

    /// Identifier for the `number`-th bundled sample image.
    pub fn sample(number: usize) -> Self {
        Self(format!("{}:image_{number}", Scheme::Sample.prefix()))
    }

    pub fn scheme(&self) -> Scheme {
        let (prefix, _) = self
            .0
            .split_once(':')
            .expect("PhotoId always carries a scheme");
        Scheme::from_prefix(prefix).expect("PhotoId always carries a known scheme")
    }

    /// The part after the scheme.
    pub fn key(&self) -> &str {
        self.0.split_once(':').map(|(_, key)| key).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PhotoId {
    type Err = PhotoIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, key) = s
            .split_once(':')
            .ok_or_else(|| PhotoIdError::MissingScheme(s.to_string()))?;

        if Scheme::from_prefix(prefix).is_none() {
            return Err(PhotoIdError::UnknownScheme(prefix.to_string()));
        }
        if key.is_empty() {
            return Err(PhotoIdError::EmptyKey(s.to_string()));
        }

        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for PhotoId {
    type Error = PhotoIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PhotoId> for String {
    fn from(id: PhotoId) -> Self {
        id.0
    }
}

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
