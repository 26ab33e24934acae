//! Content package data model and lifecycle states

use crate::index::AssetId;
use crate::namespace::{ContentId, MountPath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// Where a package is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Pending,
    Validating,
    Mounting,
    Indexing,
    Active,
    /// Still recorded, but unmounted and out of the index
    Disabled,
    Swapping,
    Unmounting,
    Retired,
    Failed,
}

impl LifecycleState {
    /// States no operation is currently moving through
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            LifecycleState::Active
                | LifecycleState::Disabled
                | LifecycleState::Retired
                | LifecycleState::Failed
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Validating => "validating",
            LifecycleState::Mounting => "mounting",
            LifecycleState::Indexing => "indexing",
            LifecycleState::Active => "active",
            LifecycleState::Disabled => "disabled",
            LifecycleState::Swapping => "swapping",
            LifecycleState::Unmounting => "unmounting",
            LifecycleState::Retired => "retired",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The archive a mount was made from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveOrigin {
    pub archive_path: PathBuf,
    pub version: u64,
    pub checksum: String,
}

/// One unit of UGC as seen by an in-flight operation
///
/// Once mounted the package lives on as a [`MountRecord`](crate::MountRecord);
/// this value only exists while an operation is working on it.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentPackage {
    pub content_id: ContentId,
    pub origin: ArchiveOrigin,
    pub mount_path: Option<MountPath>,
    pub assets: BTreeSet<AssetId>,
    pub state: LifecycleState,
}

impl ContentPackage {
    pub fn pending(content_id: ContentId, origin: ArchiveOrigin) -> Self {
        Self {
            content_id,
            origin,
            mount_path: None,
            assets: BTreeSet::new(),
            state: LifecycleState::Pending,
        }
    }
}
