//! Image reconciliation primitives.
//!
//! This library holds the I/O-free half of the image lifecycle pipeline:
//!
//! - **Records**: [`ImageRecord`] and [`ContainerRecord`], the runtime
//!   snapshot in version-agnostic form.
//! - **Resolution**: [`AliasIndex`] maps every id, name and digest to its
//!   owning image id; [`Resolution`] partitions all aliases into running
//!   and non-running sets.
//! - **Exclusions**: [`ExclusionList`] glob patterns that protect images by
//!   any of their aliases.
//! - **Targets**: [`TargetSpec`], the ordered work order with an optional
//!   prune marker.
//! - **Locking**: [`KeyedLocker`], a reference-counted per-key lock.
//!
//! # Invariants
//!
//! - Everything here is rebuilt from scratch per invocation; nothing is cached
//!   across runs.
//! - An alias belongs to exactly one id, so the running and non-running sets
//!   never share a key.
//! - Decisions are deterministic given the same snapshot (ordered maps).

mod exclusion;
mod image;
mod keyed_lock;
mod resolve;
mod target;

pub use exclusion::{ExclusionDocument, ExclusionError, ExclusionList};
pub use image::{ContainerRecord, ImageRecord};
pub use keyed_lock::{KeyedLocker, LockError};
pub use resolve::{AliasIndex, Resolution};
pub use target::{TargetError, TargetSpec, PRUNE_MARKER};
