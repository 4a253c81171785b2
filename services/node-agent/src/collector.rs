//! Collector stage: find removable images and hand them downstream.

use anyhow::{Context, Result};
use imgsweep_reconcile::{ExclusionList, ImageRecord, Resolution};
use tracing::{debug, info};

use crate::config::Config;
use crate::handoff::{self, PipePaths};
use crate::runtime::ImageRuntime;

/// Non-running images that no exclusion pattern protects, in id order.
pub async fn collect(
    runtime: &dyn ImageRuntime,
    exclusions: &ExclusionList,
) -> Result<Vec<ImageRecord>> {
    let images = runtime.list_images().await.context("failed to list images")?;
    let containers = runtime
        .list_containers()
        .await
        .context("failed to list containers")?;

    let resolution = Resolution::resolve(&images, &containers);
    debug!(running = ?resolution.running(), "Map of running images");

    let index = resolution.index();
    let mut eligible = Vec::new();
    for image in resolution.non_running_images() {
        if exclusions.is_excluded(&image.id, index) {
            info!(image_id = %image.id, names = ?image.names, "Image is excluded");
            continue;
        }
        eligible.push(image.clone());
    }

    info!(
        total = index.len(),
        running = resolution.running_ids().count(),
        eligible = eligible.len(),
        "Collected non-running images"
    );
    Ok(eligible)
}

/// Run the collector: publish the eligible images and wait for the remover
/// to acknowledge.
pub async fn run(
    config: &Config,
    runtime: &dyn ImageRuntime,
    exclusions: &ExclusionList,
) -> Result<usize> {
    let paths = PipePaths::new(&config.shared_dir);
    let images = collect(runtime, exclusions).await?;

    // Must exist before anyone can finish reading the data pipe.
    handoff::create_completion_pipe(&paths.complete_collect)?;
    handoff::write_images(&paths.collect_scan, &images).await?;
    handoff::wait_for_completion(&paths.complete_collect).await?;

    Ok(images.len())
}

#[cfg(test)]
mod tests {
    use imgsweep_reconcile::ContainerRecord;

    use super::*;
    use crate::runtime::MockRuntime;

    #[tokio::test]
    async fn test_collect_skips_running_and_excluded() {
        let runtime = MockRuntime::new(
            vec![
                ImageRecord::new("sha256:a").with_name("nginx:latest"),
                ImageRecord::new("sha256:b").with_name("redis:latest"),
                ImageRecord::new("sha256:c").with_name("caddy:latest"),
            ],
            vec![ContainerRecord::new("web", "nginx:latest")],
        );
        let exclusions = ExclusionList::new(["*redis*"]);

        let images = collect(&runtime, &exclusions).await.unwrap();
        let ids: Vec<_> = images.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["sha256:c"]);
    }

    #[tokio::test]
    async fn test_collect_empty_node() {
        let runtime = MockRuntime::default();
        let images = collect(&runtime, &ExclusionList::default()).await.unwrap();
        assert!(images.is_empty());
    }
}
