//! Scanner stage.
//!
//! Sits between collector and remover when enabled. It reads the collected
//! images, asks a [`Classifier`] which of them should go, and forwards only
//! those. The classifier is the pluggable part; the shipped one matches
//! image references against deny patterns.

use anyhow::Result;
use async_trait::async_trait;
use imgsweep_reconcile::{ExclusionList, ImageRecord};
use tracing::{info, warn};

use crate::config::Config;
use crate::handoff::{self, PipePaths};

/// Result of classifying a batch of images.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub non_compliant: Vec<ImageRecord>,
    /// Images the classifier could not judge.
    pub failed: Vec<ImageRecord>,
}

impl ScanOutcome {
    /// Images to hand to the remover.
    pub fn into_removals(self, include_failed: bool) -> Vec<ImageRecord> {
        let mut images = self.non_compliant;
        if include_failed {
            images.extend(self.failed);
        }
        images
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, images: &[ImageRecord]) -> ScanOutcome;
}

/// Marks images non-compliant when any of their references matches a deny
/// pattern.
///
/// An image with neither a name nor a digest has nothing to look up and is
/// reported as failed.
#[derive(Debug, Clone, Default)]
pub struct PatternClassifier {
    deny: ExclusionList,
}

impl PatternClassifier {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            deny: ExclusionList::new(patterns),
        }
    }
}

#[async_trait]
impl Classifier for PatternClassifier {
    async fn classify(&self, images: &[ImageRecord]) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();

        for image in images {
            if image.names.is_empty() && image.digests.is_empty() {
                warn!(image_id = %image.id, "Image has no reference to scan");
                outcome.failed.push(image.clone());
                continue;
            }

            let denied = self.deny.matches(&image.id)
                || image.aliases().any(|alias| self.deny.matches(alias));
            if denied {
                info!(image_id = %image.id, names = ?image.names, "Image is non-compliant");
                outcome.non_compliant.push(image.clone());
            }
        }

        outcome
    }
}

/// Run the scanner: read the collector's list, forward the images to remove,
/// and wait for the remover to acknowledge.
pub async fn run(config: &Config, classifier: &dyn Classifier) -> Result<usize> {
    let paths = PipePaths::new(&config.shared_dir);

    let images = handoff::read_images(&paths.collect_scan).await?;
    info!(count = images.len(), "Received images to scan");

    let outcome = classifier.classify(&images).await;
    info!(
        non_compliant = outcome.non_compliant.len(),
        failed = outcome.failed.len(),
        delete_failed = config.delete_scan_failed,
        "Scan finished"
    );
    let removals = outcome.into_removals(config.delete_scan_failed);

    handoff::create_completion_pipe(&paths.complete_scan)?;
    handoff::write_images(&paths.scan_remove, &removals).await?;
    handoff::wait_for_completion(&paths.complete_scan).await?;

    Ok(removals.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images() -> Vec<ImageRecord> {
        vec![
            ImageRecord::new("sha256:a").with_name("nginx:1.14"),
            ImageRecord::new("sha256:b").with_name("redis:latest"),
            ImageRecord::new("sha256:c")
                .with_digest("docker.io/library/alpine@sha256:333"),
            ImageRecord::new("sha256:d"),
        ]
    }

    #[tokio::test]
    async fn test_pattern_classifier() {
        let classifier = PatternClassifier::new(["nginx:1.*", "docker.io/library/alpine@*"]);
        let outcome = classifier.classify(&images()).await;

        let ids = |list: &[ImageRecord]| list.iter().map(|i| i.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&outcome.non_compliant), vec!["sha256:a", "sha256:c"]);
        assert_eq!(ids(&outcome.failed), vec!["sha256:d"]);
    }

    #[tokio::test]
    async fn test_empty_deny_list_removes_nothing_compliant() {
        let outcome = PatternClassifier::default().classify(&images()).await;
        assert!(outcome.non_compliant.is_empty());
        assert_eq!(outcome.failed.len(), 1);
    }

    #[test]
    fn test_into_removals() {
        let outcome = ScanOutcome {
            non_compliant: vec![ImageRecord::new("sha256:a")],
            failed: vec![ImageRecord::new("sha256:d")],
        };
        assert_eq!(outcome.clone().into_removals(true).len(), 2);
        assert_eq!(
            outcome.into_removals(false),
            vec![ImageRecord::new("sha256:a")]
        );
    }
}
