//! Authoritative record of mounted packages
//!
//! The table is sharded by content identifier, so mutations for distinct
//! identifiers never contend on a common lock. Each mount path is claimed by
//! at most one identifier; the claim map is always locked after the record
//! map, never the other way round.

use crate::index::AssetId;
use crate::namespace::{ContentId, MountPath};
use crate::package::ArchiveOrigin;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Binding of one mounted package to its mount path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountRecord {
    pub content_id: ContentId,
    pub mount_path: MountPath,
    pub origin: ArchiveOrigin,

    /// Assets this package currently owns in the index
    pub assets: BTreeSet<AssetId>,

    pub mounted_at: DateTime<Utc>,

    /// Disabled packages keep their record but are neither mounted nor indexed
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Mount order; `list_active` sorts on it
    #[serde(skip)]
    pub sequence: u64,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Default)]
pub struct MountTable {
    records: DashMap<ContentId, MountRecord>,
    paths: DashMap<MountPath, ContentId>,
    next_sequence: AtomicU64,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `id` is mounted at `mount_path`
    ///
    /// Fails with [`Error::AlreadyMounted`] if `id` already has a record and
    /// with [`Error::PathCollision`] if another identifier claims the path.
    pub fn bind(
        &self,
        id: &ContentId,
        mount_path: &MountPath,
        assets: BTreeSet<AssetId>,
        origin: ArchiveOrigin,
    ) -> Result<MountRecord> {
        self.insert(MountRecord {
            content_id: id.clone(),
            mount_path: mount_path.clone(),
            origin,
            assets,
            mounted_at: Utc::now(),
            enabled: true,
            sequence: 0,
        })
    }

    /// Re-register a record made by an earlier session, keeping its timestamp
    pub fn restore(&self, record: MountRecord) -> Result<MountRecord> {
        self.insert(record)
    }

    fn insert(&self, mut record: MountRecord) -> Result<MountRecord> {
        let id = record.content_id.clone();

        match self.records.entry(id.clone()) {
            Entry::Occupied(_) => Err(Error::AlreadyMounted(id)),
            Entry::Vacant(vacant) => {
                match self.paths.entry(record.mount_path.clone()) {
                    Entry::Occupied(claim) if claim.get() != &id => {
                        return Err(Error::PathCollision {
                            path: record.mount_path.clone(),
                            owner: claim.get().clone(),
                        });
                    }
                    Entry::Occupied(_) => {}
                    Entry::Vacant(claim) => {
                        claim.insert(id.clone());
                    }
                }

                record.sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
                vacant.insert(record.clone());
                Ok(record)
            }
        }
    }

    /// Remove the record for `id`, returning the assets it owned
    pub fn unbind(&self, id: &ContentId) -> Result<BTreeSet<AssetId>> {
        let (_, record) = self
            .records
            .remove(id)
            .ok_or_else(|| Error::NotMounted(id.clone()))?;

        self.paths
            .remove_if(&record.mount_path, |_, owner| owner == id);

        Ok(record.assets)
    }

    /// Point an existing record at a new archive, returning the previous record
    ///
    /// The asset set is left alone; the index synchronizer owns it.
    pub fn rebind(&self, id: &ContentId, origin: ArchiveOrigin) -> Result<MountRecord> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotMounted(id.clone()))?;

        let previous = record.clone();
        record.origin = origin;
        record.mounted_at = Utc::now();
        Ok(previous)
    }

    /// Flip the enabled flag of `id`, returning the previous value
    pub fn set_enabled(&self, id: &ContentId, enabled: bool) -> Result<bool> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotMounted(id.clone()))?;

        Ok(std::mem::replace(&mut record.enabled, enabled))
    }

    pub fn lookup(&self, id: &ContentId) -> Option<MountRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    pub fn is_bound(&self, id: &ContentId) -> bool {
        self.records.contains_key(id)
    }

    /// Identifier currently claiming `path`
    pub fn owner_of_path(&self, path: &MountPath) -> Option<ContentId> {
        self.paths.get(path).map(|owner| owner.value().clone())
    }

    /// Enabled records in mount order
    pub fn list_active(&self) -> Vec<MountRecord> {
        let mut records = self.list_all();
        records.retain(|r| r.enabled);
        records
    }

    /// Every record, disabled ones included, in mount order
    pub fn list_all(&self) -> Vec<MountRecord> {
        let mut records: Vec<MountRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.sequence);
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Replace the owned asset set of `id`; no-op when `id` is not mounted
    pub(crate) fn set_assets(&self, id: &ContentId, assets: BTreeSet<AssetId>) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.assets = assets;
        }
    }

    /// Drop superseded assets from `id`, returning how many were removed
    pub(crate) fn release_assets<'a, I>(&self, id: &ContentId, assets: I) -> usize
    where
        I: IntoIterator<Item = &'a AssetId>,
    {
        match self.records.get_mut(id) {
            Some(mut record) => assets
                .into_iter()
                .filter(|asset| record.assets.remove(*asset))
                .count(),
            None => 0,
        }
    }

    pub(crate) fn restore_assets<'a, I>(&self, id: &ContentId, assets: I)
    where
        I: IntoIterator<Item = &'a AssetId>,
    {
        if let Some(mut record) = self.records.get_mut(id) {
            record.assets.extend(assets.into_iter().cloned());
        }
    }
}
