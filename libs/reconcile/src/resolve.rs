//! Image identity resolution.
//!
//! One physical image is usually known by several strings: its id, any number
//! of `repo:tag` names and `repo@sha256:...` digests. Containers report
//! whichever of those the runtime felt like recording. Resolution maps all of
//! them back to ids and then splits the ids into running and non-running.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::image::{ContainerRecord, ImageRecord};

/// Mapping from every id, name and digest to its owning image id.
#[derive(Debug, Clone, Default)]
pub struct AliasIndex {
    /// alias -> id. Ids map to themselves.
    aliases: HashMap<String, String>,
    /// id -> record.
    images: BTreeMap<String, ImageRecord>,
}

impl AliasIndex {
    /// Build the index in one pass over the image records.
    ///
    /// Ids are registered before any name or digest, so an id can never be
    /// shadowed by another image's alias. If the runtime reports the same
    /// alias under two ids (a concurrent retag), the lowest id wins so the
    /// outcome does not depend on listing order.
    pub fn build(images: &[ImageRecord]) -> Self {
        let mut index = Self::default();

        for image in images {
            if image.id.is_empty() || index.images.contains_key(&image.id) {
                continue;
            }
            index.aliases.insert(image.id.clone(), image.id.clone());
            index.images.insert(image.id.clone(), image.clone());
        }

        for image in index.images.values() {
            for alias in image.aliases() {
                index
                    .aliases
                    .entry(alias.to_string())
                    .or_insert_with(|| image.id.clone());
            }
        }

        index
    }

    /// Resolve an id, name or digest to the owning image id.
    pub fn resolve(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(String::as_str)
    }

    /// Look up the record for an id.
    pub fn image(&self, id: &str) -> Option<&ImageRecord> {
        self.images.get(id)
    }

    /// Resolve any alias straight to its record.
    pub fn image_for(&self, alias: &str) -> Option<&ImageRecord> {
        self.resolve(alias).and_then(|id| self.image(id))
    }

    /// All known ids in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.images.keys().map(String::as_str)
    }

    /// Number of distinct images.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Every alias owned by `id`, including the id itself.
    ///
    /// Aliases the index attributes to a different id are left out.
    fn owned_aliases<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let image = self.images.get(id);
        std::iter::once(id)
            .chain(image.into_iter().flat_map(|image| image.aliases()))
            .filter(move |alias| self.resolve(alias) == Some(id))
    }
}

/// Running / non-running partition of a runtime snapshot.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    index: AliasIndex,
    running_ids: BTreeSet<String>,
    /// alias -> id for every alias of a running id.
    running: BTreeMap<String, String>,
    /// alias -> id for every alias of a non-running id.
    non_running: BTreeMap<String, String>,
}

impl Resolution {
    /// Partition images by whether any container references them.
    ///
    /// A container whose image reference does not resolve (stale, or an image
    /// deleted out from under it) is ignored.
    pub fn resolve(images: &[ImageRecord], containers: &[ContainerRecord]) -> Self {
        let index = AliasIndex::build(images);

        let running_ids: BTreeSet<String> = containers
            .iter()
            .filter_map(|container| index.resolve(&container.image_ref))
            .map(str::to_string)
            .collect();

        let mut running = BTreeMap::new();
        let mut non_running = BTreeMap::new();

        for id in index.ids() {
            let target = if running_ids.contains(id) {
                &mut running
            } else {
                &mut non_running
            };
            for alias in index.owned_aliases(id) {
                target.insert(alias.to_string(), id.to_string());
            }
        }

        Self {
            index,
            running_ids,
            running,
            non_running,
        }
    }

    pub fn index(&self) -> &AliasIndex {
        &self.index
    }

    /// alias -> id for every alias of a running image.
    pub fn running(&self) -> &BTreeMap<String, String> {
        &self.running
    }

    /// alias -> id for every alias of a non-running image.
    pub fn non_running(&self) -> &BTreeMap<String, String> {
        &self.non_running
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running_ids.contains(id)
    }

    /// Running ids in sorted order.
    pub fn running_ids(&self) -> impl Iterator<Item = &str> {
        self.running_ids.iter().map(String::as_str)
    }

    /// Non-running ids in sorted order, each exactly once.
    pub fn non_running_ids(&self) -> impl Iterator<Item = &str> {
        self.index.ids().filter(|id| !self.running_ids.contains(*id))
    }

    /// Records of every non-running image in id order.
    pub fn non_running_images(&self) -> impl Iterator<Item = &ImageRecord> {
        self.non_running_ids()
            .filter_map(|id| self.index.image(id))
    }
}
