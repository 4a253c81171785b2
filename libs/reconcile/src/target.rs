//! Removal work orders.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::image::ImageRecord;

/// Target entry meaning "also remove every other eligible non-running image".
pub const PRUNE_MARKER: &str = "*";

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("failed to read image list {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid image list {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Ordered list of ids, names or digests to remove, plus the prune flag.
///
/// Any number of prune markers collapse into one flag; explicit entries keep
/// their order and duplicates so every given string gets an outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSpec {
    explicit: Vec<String>,
    prune: bool,
}

impl TargetSpec {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = Self::default();
        for entry in entries {
            let entry = entry.into();
            if entry == PRUNE_MARKER {
                spec.prune = true;
            } else {
                spec.explicit.push(entry);
            }
        }
        spec
    }

    /// Prune everything eligible and nothing else.
    pub fn prune_all() -> Self {
        Self {
            explicit: Vec::new(),
            prune: true,
        }
    }

    /// Target each record by id, in order.
    pub fn from_images(images: &[ImageRecord]) -> Self {
        Self::new(images.iter().map(|image| image.id.clone()))
    }

    /// Read a JSON array of strings.
    pub fn from_file(path: &Path) -> Result<Self, TargetError> {
        let data = std::fs::read(path).map_err(|source| TargetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: Vec<String> =
            serde_json::from_slice(&data).map_err(|source| TargetError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::new(entries))
    }

    /// Explicit (non-wildcard) entries in the order given.
    pub fn explicit(&self) -> &[String] {
        &self.explicit
    }

    pub fn prune(&self) -> bool {
        self.prune
    }

    pub fn is_empty(&self) -> bool {
        self.explicit.is_empty() && !self.prune
    }
}
