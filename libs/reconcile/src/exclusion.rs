//! Exclusion patterns.
//!
//! Exclusions arrive as one or more mounted config documents of the form
//! `{"excluded": ["pattern", ...]}`. Each pattern is a glob where `*` also
//! crosses `/`, so `docker.io/library/*`, `nginx:*` and `*redis*` all behave
//! the way an operator expects.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resolve::AliasIndex;

/// Directory entries with this prefix hold exclusion documents.
const EXCLUDE_PREFIX: &str = "exclude-";

/// Errors from loading exclusion documents.
#[derive(Debug, Error)]
pub enum ExclusionError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid exclusion document {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ExclusionError {
    /// True when the exclusion directory (or a document in it) does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// On-disk exclusion document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionDocument {
    #[serde(default)]
    pub excluded: Vec<String>,
}

#[derive(Debug, Clone)]
struct Pattern {
    raw: String,
    /// `None` when the string is not a valid glob; it then only matches itself.
    glob: Option<glob::Pattern>,
}

impl Pattern {
    fn new(raw: String) -> Self {
        let glob = glob::Pattern::new(&raw).ok();
        Self { raw, glob }
    }

    fn matches(&self, candidate: &str) -> bool {
        self.raw == candidate
            || self
                .glob
                .as_ref()
                .is_some_and(|glob| glob.matches(candidate))
    }
}

/// Immutable set of exclusion patterns, loaded once per process.
#[derive(Debug, Clone, Default)]
pub struct ExclusionList {
    patterns: Vec<Pattern>,
}

impl ExclusionList {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::default();
        list.extend(patterns);
        list
    }

    /// Parse a single `{"excluded": [...]}` document.
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        let document: ExclusionDocument = serde_json::from_slice(data)?;
        Ok(Self::new(document.excluded))
    }

    /// Load every `exclude-*` document under `dir`.
    ///
    /// An `exclude-*` directory contributes the first `*.json` file inside it
    /// (a mounted ConfigMap); an `exclude-*.json` file contributes itself.
    /// Entries are visited in name order.
    pub fn load_dir(dir: &Path) -> Result<Self, ExclusionError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ExclusionError::Io { path, source }
        };

        let mut entries: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(io_err(dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(EXCLUDE_PREFIX))
            })
            .collect();
        entries.sort();

        let mut list = Self::default();
        for entry in entries {
            let document = if entry.is_dir() {
                match first_json_file(&entry).map_err(io_err(&entry))? {
                    Some(path) => path,
                    None => continue,
                }
            } else if is_json(&entry) {
                entry
            } else {
                continue;
            };

            let data = fs::read(&document).map_err(io_err(&document))?;
            let parsed: ExclusionDocument =
                serde_json::from_slice(&data).map_err(|source| ExclusionError::Parse {
                    path: document.clone(),
                    source,
                })?;
            list.extend(parsed.excluded);
        }

        Ok(list)
    }

    fn extend<I, S>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for raw in patterns {
            let raw = raw.into();
            if raw.is_empty() || self.patterns.iter().any(|p| p.raw == raw) {
                continue;
            }
            self.patterns.push(Pattern::new(raw));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// The raw pattern strings, in load order.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.raw.as_str())
    }

    /// True if any pattern matches `candidate` as-is.
    pub fn matches(&self, candidate: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(candidate))
    }

    /// True if `candidate`, or any name or digest of the image it resolves
    /// to, matches a pattern.
    ///
    /// This is what lets an operator exclude by tag and have that protect a
    /// target given by id or digest, and the other way around.
    pub fn is_excluded(&self, candidate: &str, index: &AliasIndex) -> bool {
        if self.is_empty() {
            return false;
        }
        if self.matches(candidate) {
            return true;
        }
        index
            .image_for(candidate)
            .is_some_and(|image| image.aliases().any(|alias| self.matches(alias)))
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

fn first_json_file(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| is_json(path) && path.is_file())
        .collect();
    files.sort();
    Ok(files.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageRecord;

    fn index() -> AliasIndex {
        AliasIndex::build(&[
            ImageRecord::new("sha256:aaa")
                .with_name("docker.io/library/nginx:latest")
                .with_digest("docker.io/library/nginx@sha256:111"),
            ImageRecord::new("sha256:bbb").with_name("redis:latest"),
        ])
    }

    #[test]
    fn test_empty_list_excludes_nothing() {
        let list = ExclusionList::default();
        assert!(!list.is_excluded("sha256:aaa", &index()));
    }

    #[test]
    fn test_exact_match() {
        let list = ExclusionList::new(["redis:latest"]);
        assert!(list.is_excluded("redis:latest", &index()));
        assert!(!list.is_excluded("nginx:latest", &index()));
    }

    #[test]
    fn test_id_is_excluded_by_name() {
        let list = ExclusionList::new(["redis:latest"]);
        assert!(list.is_excluded("sha256:bbb", &index()));
    }

    #[test]
    fn test_name_is_excluded_by_digest() {
        let list = ExclusionList::new(["docker.io/library/nginx@sha256:111"]);
        assert!(list.is_excluded("docker.io/library/nginx:latest", &index()));
        assert!(list.is_excluded("sha256:aaa", &index()));
    }

    #[test]
    fn test_repository_wildcard() {
        let list = ExclusionList::new(["docker.io/library/*"]);
        assert!(list.is_excluded("sha256:aaa", &index()));
        assert!(!list.is_excluded("sha256:bbb", &index()));
    }

    #[test]
    fn test_tag_wildcard() {
        let list = ExclusionList::new(["redis:*"]);
        assert!(list.is_excluded("sha256:bbb", &index()));
    }

    #[test]
    fn test_substring_wildcard() {
        let list = ExclusionList::new(["*redis*"]);
        assert!(list.is_excluded("redis:latest", &index()));
        assert!(!list.is_excluded("sha256:aaa", &index()));
    }

    #[test]
    fn test_invalid_glob_still_matches_literally() {
        let list = ExclusionList::new(["weird[image"]);
        assert!(list.matches("weird[image"));
        assert!(!list.matches("weirdximage"));
    }

    #[test]
    fn test_duplicates_and_empty_patterns_are_dropped() {
        let list = ExclusionList::new(["a", "", "a", "b"]);
        assert_eq!(list.patterns().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_from_json() {
        let list = ExclusionList::from_json(br#"{"excluded": ["nginx:*"]}"#).unwrap();
        assert_eq!(list.len(), 1);
        assert!(list.matches("nginx:1.25"));
    }

    #[test]
    fn test_load_dir_unions_documents() {
        let dir = tempfile::tempdir().unwrap();

        let configmap = dir.path().join("exclude-system");
        fs::create_dir(&configmap).unwrap();
        fs::write(
            configmap.join("excluded.json"),
            r#"{"excluded": ["docker.io/library/*"]}"#,
        )
        .unwrap();

        fs::write(
            dir.path().join("exclude-extra.json"),
            r#"{"excluded": ["redis:latest"]}"#,
        )
        .unwrap();

        // Not an exclusion source.
        fs::write(dir.path().join("other.json"), r#"{"excluded": ["caddy:*"]}"#).unwrap();

        let list = ExclusionList::load_dir(dir.path()).unwrap();
        assert_eq!(
            list.patterns().collect::<Vec<_>>(),
            vec!["redis:latest", "docker.io/library/*"]
        );
        assert!(!list.matches("caddy:latest"));
    }

    #[test]
    fn test_load_dir_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = ExclusionList::load_dir(&dir.path().join("absent")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_load_dir_rejects_malformed_document() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("exclude-bad.json"), "not json").unwrap();

        let err = ExclusionList::load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ExclusionError::Parse { .. }));
        assert!(!err.is_not_found());
    }
}
