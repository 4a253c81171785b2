//! Removal and prune engine.
//!
//! Reconciles a [`TargetSpec`] against a fresh runtime snapshot. Each
//! explicit target is resolved to an image id and then deleted, skipped as
//! running, skipped as excluded, or reported as not on this node. A prune
//! marker additionally sweeps every remaining non-running, non-excluded
//! image. Per-image failures never stop the batch.

use std::collections::HashSet;
use std::fmt;

use anyhow::{Context, Result};
use imgsweep_reconcile::{ExclusionList, Resolution, TargetSpec};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::handoff::{self, PipePaths};
use crate::runtime::{ImageRuntime, RuntimeError};

/// What happened to one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Deleted,
    SkippedRunning,
    SkippedExcluded,
    NotFound,
    DeleteFailed,
    /// Another alias of the same id was already deleted in this batch.
    AlreadyDeleted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Deleted => "deleted",
            Outcome::SkippedRunning => "skipped-running",
            Outcome::SkippedExcluded => "skipped-excluded",
            Outcome::NotFound => "not-found",
            Outcome::DeleteFailed => "delete-failed",
            Outcome::AlreadyDeleted => "already-deleted",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOutcome {
    /// The target string as given, or the id for prune sweeps.
    pub given: String,
    /// Resolved id, if the target is on this node.
    pub image_id: Option<String>,
    pub outcome: Outcome,
    /// Produced by the prune sweep rather than an explicit target.
    pub pruned: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneSummary {
    pub removed: usize,
    pub failed: usize,
}

impl PruneSummary {
    /// True if every prune deletion succeeded.
    pub fn succeeded(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Default)]
pub struct RemovalReport {
    /// Images actually deleted, explicit and pruned.
    pub removed: usize,
    pub outcomes: Vec<ImageOutcome>,
    /// Present when the targets carried a prune marker.
    pub prune: Option<PruneSummary>,
    /// First delete failure that was not a runtime refusal.
    pub first_unexpected_error: Option<RuntimeError>,
}

impl RemovalReport {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.outcomes.iter().filter(|o| o.outcome == outcome).count()
    }

    fn record(&mut self, given: &str, image_id: Option<&str>, outcome: Outcome, pruned: bool) {
        self.outcomes.push(ImageOutcome {
            given: given.to_string(),
            image_id: image_id.map(str::to_string),
            outcome,
            pruned,
        });
    }

    fn record_failure(&mut self, err: RuntimeError) {
        if !err.is_runtime_refusal() && self.first_unexpected_error.is_none() {
            self.first_unexpected_error = Some(err);
        }
    }
}

/// Remove `targets` from the runtime, honoring `exclusions`.
///
/// The runtime is listed afresh; only listing failures are returned as
/// errors. Everything else lands in the report.
pub async fn remove_images(
    runtime: &dyn ImageRuntime,
    targets: &TargetSpec,
    exclusions: &ExclusionList,
) -> Result<RemovalReport, RuntimeError> {
    let images = runtime.list_images().await?;
    let containers = runtime.list_containers().await?;
    let resolution = Resolution::resolve(&images, &containers);

    debug!(running = ?resolution.running(), "Map of running images");
    debug!(non_running = ?resolution.non_running(), "Map of non-running images");

    let index = resolution.index();
    let name = |id: &str| {
        index
            .image(id)
            .map(|image| image.display_name().to_string())
            .unwrap_or_default()
    };

    let mut report = RemovalReport::default();
    let mut deleted: HashSet<String> = HashSet::new();

    for given in targets.explicit() {
        let given = given.as_str();

        if let Some(id) = resolution.non_running().get(given) {
            let id = id.as_str();

            if exclusions.is_excluded(given, index) {
                info!(given = %given, image_id = %id, name = %name(id), "Image is excluded");
                report.record(given, Some(id), Outcome::SkippedExcluded, false);
                continue;
            }

            if deleted.contains(id) {
                debug!(given = %given, image_id = %id, "Image already removed in this batch");
                report.record(given, Some(id), Outcome::AlreadyDeleted, false);
                continue;
            }

            match runtime.delete_image(id).await {
                Ok(()) => {
                    info!(given = %given, image_id = %id, name = %name(id), "Removed image");
                    deleted.insert(id.to_string());
                    report.removed += 1;
                    report.record(given, Some(id), Outcome::Deleted, false);
                }
                Err(err) => {
                    error!(
                        given = %given,
                        image_id = %id,
                        name = %name(id),
                        error = %err,
                        "Error removing image"
                    );
                    report.record(given, Some(id), Outcome::DeleteFailed, false);
                    report.record_failure(err);
                }
            }
            continue;
        }

        if let Some(id) = resolution.running().get(given) {
            info!(given = %given, image_id = %id, name = %name(id), "Image is running");
            report.record(given, Some(id), Outcome::SkippedRunning, false);
            continue;
        }

        info!(given = %given, "Image is not on node");
        report.record(given, None, Outcome::NotFound, false);
    }

    if targets.prune() {
        let mut summary = PruneSummary::default();

        for id in resolution.non_running_ids() {
            if deleted.contains(id) {
                continue;
            }

            if exclusions.is_excluded(id, index) {
                info!(image_id = %id, name = %name(id), "Image is excluded");
                report.record(id, Some(id), Outcome::SkippedExcluded, true);
                continue;
            }

            match runtime.delete_image(id).await {
                Ok(()) => {
                    info!(image_id = %id, name = %name(id), "Removed image");
                    deleted.insert(id.to_string());
                    report.removed += 1;
                    summary.removed += 1;
                    report.record(id, Some(id), Outcome::Deleted, true);
                }
                Err(err) => {
                    error!(image_id = %id, name = %name(id), error = %err, "Error removing image");
                    summary.failed += 1;
                    report.record(id, Some(id), Outcome::DeleteFailed, true);
                    report.record_failure(err);
                }
            }
        }

        if summary.succeeded() {
            info!(removed = summary.removed, "Prune successful");
        } else {
            warn!(
                removed = summary.removed,
                failed = summary.failed,
                "Error during prune"
            );
        }
        report.prune = Some(summary);
    }

    Ok(report)
}

/// Remover stage.
///
/// Reads its targets from `IMGSWEEP_IMAGE_LIST` when set; otherwise from
/// the scanner or collector pipe, acknowledging every upstream stage once
/// removal is done.
pub async fn run(
    config: &Config,
    runtime: &dyn ImageRuntime,
    exclusions: &ExclusionList,
) -> Result<RemovalReport> {
    let paths = PipePaths::new(&config.shared_dir);

    let (targets, handshake) = match &config.image_list {
        Some(path) => {
            let targets = TargetSpec::from_file(path).context("failed to parse image list file")?;
            info!(path = %path.display(), "Parsed image list file");
            (targets, false)
        }
        None => {
            let input = if config.scanner_enabled {
                &paths.scan_remove
            } else {
                &paths.collect_scan
            };
            let images = handoff::read_images(input)
                .await
                .context("failed to read images to remove")?;
            info!(
                pipe = %input.display(),
                count = images.len(),
                "Received images to remove"
            );
            (TargetSpec::from_images(&images), true)
        }
    };

    let report = remove_images(runtime, &targets, exclusions)
        .await
        .context("failed to remove images")?;

    info!(
        removed = report.removed,
        skipped_running = report.count(Outcome::SkippedRunning),
        skipped_excluded = report.count(Outcome::SkippedExcluded),
        not_found = report.count(Outcome::NotFound),
        failed = report.count(Outcome::DeleteFailed),
        "Removal finished"
    );

    if handshake {
        handoff::signal_completion(&paths.complete_collect)
            .await
            .context("failed to acknowledge collector")?;
        if config.scanner_enabled {
            handoff::signal_completion(&paths.complete_scan)
                .await
                .context("failed to acknowledge scanner")?;
        }
    }

    Ok(report)
}
