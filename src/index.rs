//! Global asset index and the synchronizer that keeps it in step with mounts
//!
//! The index is a generation-stamped, copy-on-write map from asset identifier
//! to owning package. Readers load an immutable [`IndexSnapshot`] without
//! taking any lock and therefore never see half of a commit. Writers are
//! serialized on a short lock held only while the next snapshot is built and
//! swapped in.
//!
//! All changes go through [`IndexSynchronizer`], which also keeps the asset
//! sets of the [`MountTable`] records consistent with index ownership. Every
//! commit returns an [`IndexDelta`] that can be handed back to
//! [`IndexSynchronizer::revert`] to undo it.
//!
//! # Examples
//!
//! ```
//! use std::collections::BTreeSet;
//! use std::sync::Arc;
//! use ugcmount::{AssetId, AssetIndex, ContentId, IndexSynchronizer, MountTable};
//!
//! let index = Arc::new(AssetIndex::new());
//! let sync = IndexSynchronizer::new(Arc::clone(&index), Arc::new(MountTable::new()));
//!
//! let assets: BTreeSet<AssetId> = ["assetA", "assetB"].into_iter().map(AssetId::from).collect();
//! sync.publish(&ContentId::from("mod-42"), &assets).unwrap();
//!
//! let snapshot = index.snapshot();
//! assert_eq!(snapshot.owner_of(&AssetId::from("assetA")), Some(&ContentId::from("mod-42")));
//! ```

use crate::mount_table::MountTable;
use crate::namespace::ContentId;
use crate::Result;
use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Identifier of one asset contributed by a package
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AssetId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Ownership of one asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetEntry {
    pub asset_id: AssetId,
    pub owner: ContentId,

    /// Generation of the commit that last wrote this entry
    pub generation: u64,
}

/// Immutable view of the index at one generation
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    generation: u64,
    entries: HashMap<AssetId, AssetEntry>,
    by_owner: BTreeMap<ContentId, BTreeSet<AssetId>>,
}

impl IndexSnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, asset: &AssetId) -> Option<&AssetEntry> {
        self.entries.get(asset)
    }

    pub fn owner_of(&self, asset: &AssetId) -> Option<&ContentId> {
        self.entries.get(asset).map(|e| &e.owner)
    }

    /// Range query by owning package
    pub fn assets_owned_by(&self, owner: &ContentId) -> BTreeSet<AssetId> {
        self.by_owner.get(owner).cloned().unwrap_or_default()
    }

    pub fn owners(&self) -> impl Iterator<Item = &ContentId> {
        self.by_owner.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = &AssetEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn apply(&mut self, change: &Change, generation: u64) {
        if let Some(before) = &change.before {
            if let Some(owned) = self.by_owner.get_mut(before) {
                owned.remove(&change.asset);
                if owned.is_empty() {
                    self.by_owner.remove(before);
                }
            }
        }

        match &change.after {
            Some(after) => {
                self.entries.insert(
                    change.asset.clone(),
                    AssetEntry {
                        asset_id: change.asset.clone(),
                        owner: after.clone(),
                        generation,
                    },
                );
                self.by_owner
                    .entry(after.clone())
                    .or_default()
                    .insert(change.asset.clone());
            }
            None => {
                self.entries.remove(&change.asset);
            }
        }
    }
}

/// Ownership change of one asset within a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub asset: AssetId,
    pub before: Option<ContentId>,
    pub after: Option<ContentId>,
}

/// Everything one commit changed; the input to [`IndexSynchronizer::revert`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexDelta {
    pub generation: u64,
    pub changes: Vec<Change>,
}

/// An asset taken over from another package by a publish
///
/// Not an error: the previous owner keeps running with a reduced asset set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConflict {
    pub asset: AssetId,
    pub previous_owner: ContentId,
    pub new_owner: ContentId,
}

impl fmt::Display for PublishConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "asset '{}' superseded: '{}' replaces '{}'",
            self.asset, self.new_owner, self.previous_owner
        )
    }
}

/// Outcome of a publish or replace
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub delta: IndexDelta,
    pub conflicts: Vec<PublishConflict>,
}

/// Generation-stamped asset index with lock-free reads
pub struct AssetIndex {
    current: ArcSwap<IndexSnapshot>,
    writer: Mutex<()>,
    generation_tx: watch::Sender<u64>,
}

impl Default for AssetIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AssetIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("AssetIndex")
            .field("generation", &snapshot.generation)
            .field("entries", &snapshot.len())
            .finish()
    }
}

impl AssetIndex {
    pub fn new() -> Self {
        let (generation_tx, _) = watch::channel(0);
        Self {
            current: ArcSwap::from_pointee(IndexSnapshot::default()),
            writer: Mutex::new(()),
            generation_tx,
        }
    }

    /// Current snapshot; never blocks
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    /// Receiver notified with the new generation after every commit
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }

    /// Hold off every commit until the guard is dropped
    #[cfg(test)]
    pub(crate) fn pause_commits(&self) -> MutexGuard<'_, ()> {
        self.writer.lock()
    }

    fn write(&self) -> IndexWriter<'_> {
        IndexWriter {
            index: self,
            _guard: self.writer.lock(),
        }
    }
}

/// Exclusive right to commit the next generation
struct IndexWriter<'a> {
    index: &'a AssetIndex,
    _guard: MutexGuard<'a, ()>,
}

impl IndexWriter<'_> {
    fn current(&self) -> Arc<IndexSnapshot> {
        self.index.current.load_full()
    }

    fn commit(self, base: &IndexSnapshot, changes: Vec<Change>) -> IndexDelta {
        let generation = base.generation + 1;
        let mut next = base.clone();
        next.generation = generation;
        for change in &changes {
            next.apply(change, generation);
        }

        self.index.current.store(Arc::new(next));
        self.index.generation_tx.send_replace(generation);

        IndexDelta {
            generation,
            changes,
        }
    }
}

/// Proposes publish/retract changes against the index and mirrors asset
/// ownership into the mount table
#[derive(Debug, Clone)]
pub struct IndexSynchronizer {
    index: Arc<AssetIndex>,
    table: Arc<MountTable>,
}

impl IndexSynchronizer {
    pub fn new(index: Arc<AssetIndex>, table: Arc<MountTable>) -> Self {
        Self { index, table }
    }

    pub fn index(&self) -> &Arc<AssetIndex> {
        &self.index
    }

    /// Insert or take over entries for `assets`, owned by `id`
    ///
    /// Assets owned by another package are superseded one by one; the
    /// previous owner's record shrinks by exactly those assets and each
    /// takeover is reported as a [`PublishConflict`].
    pub fn publish(&self, id: &ContentId, assets: &BTreeSet<AssetId>) -> Result<PublishReport> {
        self.commit_ownership(id, assets, false)
    }

    /// Retract everything `id` owns and publish `assets` in a single commit
    pub fn replace(&self, id: &ContentId, assets: &BTreeSet<AssetId>) -> Result<PublishReport> {
        self.commit_ownership(id, assets, true)
    }

    /// Remove every entry owned by `id`
    ///
    /// The mount record keeps its asset set; it is handed back by
    /// [`MountTable::unbind`].
    pub fn retract(&self, id: &ContentId) -> Result<IndexDelta> {
        let writer = self.index.write();
        let base = writer.current();

        let changes = base
            .assets_owned_by(id)
            .into_iter()
            .map(|asset| Change {
                asset,
                before: Some(id.clone()),
                after: None,
            })
            .collect::<Vec<_>>();

        let delta = writer.commit(&base, changes);
        tracing::debug!(
            content_id = %id,
            generation = delta.generation,
            removed = delta.changes.len(),
            "Retracted asset entries"
        );
        Ok(delta)
    }

    /// Undo `delta`
    ///
    /// Changes that were overwritten by a later commit are left alone, and
    /// ownership is only handed back to packages that are still mounted.
    pub fn revert(&self, delta: &IndexDelta) -> Result<IndexDelta> {
        let writer = self.index.write();
        let base = writer.current();

        let mut changes = Vec::new();
        for change in delta.changes.iter().rev() {
            if base.owner_of(&change.asset) != change.after.as_ref() {
                tracing::debug!(
                    asset = %change.asset,
                    "Asset changed hands after the commit being reverted; leaving it"
                );
                continue;
            }

            let restored = change
                .before
                .clone()
                .filter(|owner| self.table.is_bound(owner));

            if restored == change.after {
                continue;
            }

            if let Some(after) = &change.after {
                self.table.release_assets(after, [&change.asset]);
            }
            if let Some(owner) = &restored {
                self.table.restore_assets(owner, [&change.asset]);
            }

            changes.push(Change {
                asset: change.asset.clone(),
                before: change.after.clone(),
                after: restored,
            });
        }

        let reverted = writer.commit(&base, changes);
        tracing::debug!(
            undone = delta.generation,
            generation = reverted.generation,
            "Reverted index commit"
        );
        Ok(reverted)
    }

    fn commit_ownership(
        &self,
        id: &ContentId,
        assets: &BTreeSet<AssetId>,
        retract_others: bool,
    ) -> Result<PublishReport> {
        let writer = self.index.write();
        let base = writer.current();

        let mut changes = Vec::new();
        let mut conflicts = Vec::new();

        if retract_others {
            for asset in base.assets_owned_by(id).difference(assets) {
                changes.push(Change {
                    asset: asset.clone(),
                    before: Some(id.clone()),
                    after: None,
                });
            }
        }

        for asset in assets {
            match base.owner_of(asset) {
                Some(owner) if owner == id => {}
                Some(owner) => {
                    changes.push(Change {
                        asset: asset.clone(),
                        before: Some(owner.clone()),
                        after: Some(id.clone()),
                    });
                    conflicts.push(PublishConflict {
                        asset: asset.clone(),
                        previous_owner: owner.clone(),
                        new_owner: id.clone(),
                    });
                }
                None => changes.push(Change {
                    asset: asset.clone(),
                    before: None,
                    after: Some(id.clone()),
                }),
            }
        }

        let mut superseded: BTreeMap<&ContentId, Vec<&AssetId>> = BTreeMap::new();
        for conflict in &conflicts {
            superseded
                .entry(&conflict.previous_owner)
                .or_default()
                .push(&conflict.asset);
        }
        for (owner, lost) in superseded {
            self.table.release_assets(owner, lost);
        }
        self.table.set_assets(id, assets.clone());

        let delta = writer.commit(&base, changes);

        for conflict in &conflicts {
            tracing::warn!(
                asset = %conflict.asset,
                previous_owner = %conflict.previous_owner,
                new_owner = %conflict.new_owner,
                "Asset superseded by a newer package"
            );
        }
        tracing::debug!(
            content_id = %id,
            generation = delta.generation,
            changes = delta.changes.len(),
            "Published asset entries"
        );

        Ok(PublishReport { delta, conflicts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::NamespaceAllocator;
    use crate::package::ArchiveOrigin;
    use std::path::PathBuf;

    fn assets(ids: &[&str]) -> BTreeSet<AssetId> {
        ids.iter().map(|a| AssetId::from(*a)).collect()
    }

    fn setup() -> (Arc<AssetIndex>, Arc<MountTable>, IndexSynchronizer) {
        let index = Arc::new(AssetIndex::new());
        let table = Arc::new(MountTable::new());
        let sync = IndexSynchronizer::new(Arc::clone(&index), Arc::clone(&table));
        (index, table, sync)
    }

    fn bind(table: &MountTable, id: &str, owned: &[&str]) {
        let path = NamespaceAllocator::new("/ugc")
            .unwrap()
            .allocate(&ContentId::from(id))
            .unwrap();
        table
            .bind(
                &ContentId::from(id),
                &path,
                assets(owned),
                ArchiveOrigin {
                    archive_path: PathBuf::from(format!("{}.ugc", id)),
                    version: 1,
                    checksum: String::new(),
                },
            )
            .unwrap();
    }

    #[test]
    fn test_publish_inserts_entries() {
        let (index, _, sync) = setup();
        let id = ContentId::from("mod-42");

        let report = sync.publish(&id, &assets(&["assetA", "assetB"])).unwrap();

        assert!(report.conflicts.is_empty());
        assert_eq!(report.delta.generation, 1);

        let snapshot = index.snapshot();
        assert_eq!(snapshot.generation(), 1);
        assert_eq!(snapshot.owner_of(&AssetId::from("assetA")), Some(&id));
        assert_eq!(snapshot.owner_of(&AssetId::from("assetB")), Some(&id));
        assert_eq!(snapshot.get(&AssetId::from("assetA")).unwrap().generation, 1);
        assert_eq!(snapshot.assets_owned_by(&id), assets(&["assetA", "assetB"]));
    }

    #[test]
    fn test_generation_is_monotonic() {
        let (index, _, sync) = setup();
        let a = ContentId::from("a");

        sync.publish(&a, &assets(&["x"])).unwrap();
        sync.retract(&a).unwrap();
        sync.retract(&a).unwrap();

        assert_eq!(index.generation(), 3);
        assert!(index.snapshot().is_empty());
    }

    #[test]
    fn test_publish_supersedes_other_owner() {
        let (index, table, sync) = setup();
        let a = ContentId::from("A");
        let b = ContentId::from("B");
        bind(&table, "A", &["shared", "onlyA"]);
        bind(&table, "B", &["shared"]);

        sync.publish(&a, &assets(&["shared", "onlyA"])).unwrap();
        let report = sync.publish(&b, &assets(&["shared"])).unwrap();

        assert_eq!(
            report.conflicts,
            vec![PublishConflict {
                asset: AssetId::from("shared"),
                previous_owner: a.clone(),
                new_owner: b.clone(),
            }]
        );

        let snapshot = index.snapshot();
        assert_eq!(snapshot.owner_of(&AssetId::from("shared")), Some(&b));
        assert_eq!(snapshot.assets_owned_by(&a), assets(&["onlyA"]));
        assert_eq!(table.lookup(&a).unwrap().assets, assets(&["onlyA"]));
        assert_eq!(table.lookup(&b).unwrap().assets, assets(&["shared"]));
    }

    #[test]
    fn test_retract_removes_only_own_entries() {
        let (index, _, sync) = setup();
        let a = ContentId::from("A");
        let b = ContentId::from("B");
        sync.publish(&a, &assets(&["a1", "a2"])).unwrap();
        sync.publish(&b, &assets(&["b1"])).unwrap();

        let delta = sync.retract(&a).unwrap();
        assert_eq!(delta.changes.len(), 2);

        let snapshot = index.snapshot();
        assert!(snapshot.assets_owned_by(&a).is_empty());
        assert_eq!(snapshot.assets_owned_by(&b), assets(&["b1"]));
        assert_eq!(snapshot.owners().collect::<Vec<_>>(), vec![&b]);
    }

    #[test]
    fn test_replace_swaps_asset_set_atomically() {
        let (index, table, sync) = setup();
        let a = ContentId::from("A");
        bind(&table, "A", &["old", "kept"]);
        sync.publish(&a, &assets(&["old", "kept"])).unwrap();
        let before = index.generation();

        let report = sync.replace(&a, &assets(&["kept", "new"])).unwrap();
        assert_eq!(report.delta.generation, before + 1);

        let snapshot = index.snapshot();
        assert_eq!(snapshot.assets_owned_by(&a), assets(&["kept", "new"]));
        assert!(snapshot.owner_of(&AssetId::from("old")).is_none());
        // Unchanged entries keep the generation they were written at
        assert_eq!(snapshot.get(&AssetId::from("kept")).unwrap().generation, before);
        assert_eq!(table.lookup(&a).unwrap().assets, assets(&["kept", "new"]));
    }

    #[test]
    fn test_revert_restores_superseded_owner() {
        let (index, table, sync) = setup();
        let a = ContentId::from("A");
        let b = ContentId::from("B");
        bind(&table, "A", &["shared"]);
        bind(&table, "B", &["shared", "b"]);
        sync.publish(&a, &assets(&["shared"])).unwrap();

        let report = sync.publish(&b, &assets(&["shared", "b"])).unwrap();
        sync.revert(&report.delta).unwrap();

        let snapshot = index.snapshot();
        assert_eq!(snapshot.owner_of(&AssetId::from("shared")), Some(&a));
        assert!(snapshot.owner_of(&AssetId::from("b")).is_none());
        assert_eq!(table.lookup(&a).unwrap().assets, assets(&["shared"]));
        assert!(table.lookup(&b).unwrap().assets.is_empty());
    }

    #[test]
    fn test_revert_of_retract_restores_entries() {
        let (index, table, sync) = setup();
        let a = ContentId::from("A");
        bind(&table, "A", &["x", "y"]);
        sync.publish(&a, &assets(&["x", "y"])).unwrap();

        let delta = sync.retract(&a).unwrap();
        assert!(index.snapshot().is_empty());

        sync.revert(&delta).unwrap();
        assert_eq!(index.snapshot().assets_owned_by(&a), assets(&["x", "y"]));
        assert_eq!(table.lookup(&a).unwrap().assets, assets(&["x", "y"]));
    }

    #[test]
    fn test_revert_skips_assets_that_moved_on() {
        let (index, table, sync) = setup();
        let a = ContentId::from("A");
        let b = ContentId::from("B");
        let c = ContentId::from("C");
        bind(&table, "A", &["x"]);
        bind(&table, "B", &["x"]);
        bind(&table, "C", &["x"]);

        sync.publish(&a, &assets(&["x"])).unwrap();
        let by_b = sync.publish(&b, &assets(&["x"])).unwrap();
        sync.publish(&c, &assets(&["x"])).unwrap();

        sync.revert(&by_b.delta).unwrap();
        assert_eq!(index.snapshot().owner_of(&AssetId::from("x")), Some(&c));
    }

    #[test]
    fn test_revert_does_not_resurrect_unmounted_owner() {
        let (index, table, sync) = setup();
        let a = ContentId::from("A");
        let b = ContentId::from("B");
        bind(&table, "B", &["x"]);

        // A was never bound in the table
        sync.publish(&a, &assets(&["x"])).unwrap();
        let by_b = sync.publish(&b, &assets(&["x"])).unwrap();

        sync.revert(&by_b.delta).unwrap();
        assert!(index.snapshot().owner_of(&AssetId::from("x")).is_none());
    }

    #[test]
    fn test_readers_see_whole_commits() {
        let (index, _, sync) = setup();
        let sync = Arc::new(sync);
        let batch: Vec<BTreeSet<AssetId>> = (0..200)
            .map(|i| (0..10).map(|j| AssetId::from(format!("asset-{}-{}", i, j))).collect())
            .collect();

        let writer = {
            let sync = Arc::clone(&sync);
            std::thread::spawn(move || {
                for (i, assets) in batch.iter().enumerate() {
                    sync.publish(&ContentId::from(format!("pkg-{}", i)), assets)
                        .unwrap();
                }
            })
        };

        while !writer.is_finished() {
            let snapshot = index.snapshot();
            for owner in snapshot.owners() {
                assert_eq!(snapshot.assets_owned_by(owner).len(), 10);
            }
            assert_eq!(snapshot.len() as u64, snapshot.generation() * 10);
        }
        writer.join().unwrap();
        assert_eq!(index.generation(), 200);
    }

    #[tokio::test]
    async fn test_subscribe_sees_new_generations() {
        let (index, _, sync) = setup();
        let mut rx = index.subscribe();

        sync.publish(&ContentId::from("A"), &assets(&["a"])).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
