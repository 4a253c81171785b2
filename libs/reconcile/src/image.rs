//! Version-agnostic runtime records.

use serde::{Deserialize, Serialize};

/// One physical image as known to the local runtime.
///
/// This is also the JSON shape exchanged between pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Content-addressed identifier, unique per node store.
    #[serde(alias = "image_id")]
    pub id: String,

    /// `repo:tag` references that currently resolve to `id`.
    #[serde(default)]
    pub names: Vec<String>,

    /// `repo@algorithm:hash` references that resolve to `id`.
    #[serde(default)]
    pub digests: Vec<String>,
}

impl ImageRecord {
    /// Create a record with no names or digests.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            names: Vec::new(),
            digests: Vec::new(),
        }
    }

    /// Add a `repo:tag` name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    /// Add a `repo@algorithm:hash` digest.
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digests.push(digest.into());
        self
    }

    /// Names followed by digests (the id itself is not included).
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.names
            .iter()
            .chain(self.digests.iter())
            .map(String::as_str)
    }

    /// Most human-friendly label: first name, else first digest, else the id.
    pub fn display_name(&self) -> &str {
        self.names
            .first()
            .or_else(|| self.digests.first())
            .map(String::as_str)
            .unwrap_or(&self.id)
    }
}

/// A running or stopped container as known to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Opaque container identifier.
    pub id: String,

    /// Whatever string the runtime reports for the container's image: an id,
    /// a name or a digest.
    pub image_ref: String,
}

impl ContainerRecord {
    pub fn new(id: impl Into<String>, image_ref: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image_ref: image_ref.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_preference() {
        let named = ImageRecord::new("sha256:a")
            .with_name("nginx:latest")
            .with_digest("nginx@sha256:d");
        assert_eq!(named.display_name(), "nginx:latest");

        let digest_only = ImageRecord::new("sha256:b").with_digest("redis@sha256:e");
        assert_eq!(digest_only.display_name(), "redis@sha256:e");

        let bare = ImageRecord::new("sha256:c");
        assert_eq!(bare.display_name(), "sha256:c");
    }

    #[test]
    fn test_json_shape() {
        let record = ImageRecord::new("sha256:a").with_name("nginx:latest");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "sha256:a", "names": ["nginx:latest"], "digests": []})
        );
    }

    #[test]
    fn test_json_accepts_image_id_and_missing_lists() {
        let record: ImageRecord = serde_json::from_str(r#"{"image_id": "sha256:a"}"#).unwrap();
        assert_eq!(record, ImageRecord::new("sha256:a"));
    }
}
