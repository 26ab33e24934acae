//! Lifecycle orchestrator
//!
//! Drives packages through install, update, uninstall, enable and disable.
//! Operations for one
//! content identifier are queued and run strictly in submission order by a
//! single worker task; operations for different identifiers run in parallel
//! and only meet in the mount table and the asset index. A worker exits, and
//! its identifier is forgotten, once its queue is drained and nothing of the
//! package is left.
//!
//! Every forward step that changes shared state pushes a compensation.
//! When a later step fails the stack is unwound in reverse, so a failed
//! operation leaves behind exactly the state it started from.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use ugcmount::{LifecycleOrchestrator, MemoryMounter, NamespaceAllocator, PackageSource};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = LifecycleOrchestrator::builder(
//!     NamespaceAllocator::new("/ugc")?,
//!     Arc::new(MemoryMounter::new()),
//! )
//! .build();
//!
//! let outcome = orchestrator
//!     .install(PackageSource::new("mod-42", "downloads/mod-42.ugc"))
//!     .await;
//! println!("{}", outcome);
//! # Ok(())
//! # }
//! ```

use crate::archive::{self, PackageSource, ValidatedArchive, ValidationPolicy};
use crate::config::TimeoutConfig;
use crate::error::Step;
use crate::index::{AssetId, AssetIndex, IndexDelta, IndexSynchronizer, PublishConflict};
use crate::mount_table::{MountRecord, MountTable};
use crate::namespace::{ContentId, MountPath, NamespaceAllocator};
use crate::package::{ArchiveOrigin, ContentPackage, LifecycleState};
use crate::vfs::PakMounter;
use crate::{Error, Result};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Work submitted for one content identifier
#[derive(Debug, Clone)]
pub enum Operation {
    Install(PackageSource),
    Update(PackageSource),
    Uninstall(ContentId),
    /// Mount and index a disabled package again
    Enable(ContentId),
    /// Unmount and unindex a package but keep its record
    Disable(ContentId),
}

impl Operation {
    pub fn content_id(&self) -> &ContentId {
        match self {
            Operation::Install(source) | Operation::Update(source) => &source.content_id,
            Operation::Uninstall(id) | Operation::Enable(id) | Operation::Disable(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Install(_) => "install",
            Operation::Update(_) => "update",
            Operation::Uninstall(_) => "uninstall",
            Operation::Enable(_) => "enable",
            Operation::Disable(_) => "disable",
        }
    }
}

/// How an operation ended
#[derive(Debug)]
pub enum OperationOutcome {
    Succeeded {
        state: LifecycleState,
        warnings: Vec<PublishConflict>,
    },
    Failed(Error),
    Cancelled,
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Succeeded { .. })
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            OperationOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn warnings(&self) -> &[PublishConflict] {
        match self {
            OperationOutcome::Succeeded { warnings, .. } => warnings,
            _ => &[],
        }
    }

    fn succeeded(state: LifecycleState) -> Self {
        OperationOutcome::Succeeded {
            state,
            warnings: Vec::new(),
        }
    }
}

impl fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationOutcome::Succeeded { state, warnings } if warnings.is_empty() => {
                write!(f, "succeeded ({})", state)
            }
            OperationOutcome::Succeeded { state, warnings } => {
                write!(f, "succeeded ({}, {} warning(s))", state, warnings.len())
            }
            OperationOutcome::Failed(e) => write!(f, "failed: {}", e),
            OperationOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Caller's end of a submitted operation
#[derive(Debug)]
pub struct OperationHandle {
    content_id: ContentId,
    cancel: CancellationToken,
    outcome: oneshot::Receiver<OperationOutcome>,
}

impl OperationHandle {
    pub fn content_id(&self) -> &ContentId {
        &self.content_id
    }

    /// Request cancellation
    ///
    /// Takes effect immediately while the operation is queued or validating.
    /// Once mounting has begun the operation runs to a stable state first; a
    /// package that ends up active is then uninstalled again.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn outcome(self) -> OperationOutcome {
        self.outcome.await.unwrap_or_else(|_| {
            OperationOutcome::Failed(Error::Other(format!(
                "operation for '{}' was dropped before it finished",
                self.content_id
            )))
        })
    }
}

/// Per-step timeouts; `None` waits forever
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepTimeouts {
    pub validate: Option<Duration>,
    pub mount: Option<Duration>,
    pub index: Option<Duration>,
}

impl StepTimeouts {
    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self {
            validate: config.validate(),
            mount: config.mount(),
            index: config.index(),
        }
    }

    fn for_step(&self, step: Step) -> Option<Duration> {
        match step {
            Step::Validate => self.validate,
            Step::Mount => self.mount,
            Step::Index => self.index,
        }
    }
}

/// Undo action for one completed forward step
#[derive(Debug)]
enum Compensation {
    Unbind(ContentId),
    Unmount(MountPath),
    /// Move a parked mount back to the path it was serving from
    Restore { from: MountPath, to: MountPath },
    RevertIndex(IndexDelta),
}

/// Result of a blocking step that may have overrun its timeout
enum StepOutcome<T> {
    Completed(Result<T>),
    /// `late` holds the value if the call eventually succeeded anyway
    TimedOut { after: Duration, late: Option<T> },
}

impl<T> StepOutcome<T> {
    /// Collapse into a result; `on_late` sees a value that arrived after the timeout
    fn settle(self, step: Step, on_late: impl FnOnce(T)) -> Result<T> {
        match self {
            StepOutcome::Completed(result) => result,
            StepOutcome::TimedOut { after, late } => {
                if let Some(value) = late {
                    on_late(value);
                }
                Err(Error::Timeout { step, after })
            }
        }
    }
}

struct Job {
    operation: Operation,
    cancel: CancellationToken,
    reply: oneshot::Sender<OperationOutcome>,
}

/// Queue and lifecycle state of one content identifier
struct Slot {
    queue: mpsc::UnboundedSender<Job>,
    state: RwLock<LifecycleState>,
    halted: AtomicBool,
}

impl Slot {
    fn state(&self) -> LifecycleState {
        *self.state.read()
    }
}

/// Builder for [`LifecycleOrchestrator`]
pub struct OrchestratorBuilder {
    allocator: NamespaceAllocator,
    mounter: Arc<dyn PakMounter>,
    policy: ValidationPolicy,
    timeouts: StepTimeouts,
    table: Option<Arc<MountTable>>,
    index: Option<Arc<AssetIndex>>,
}

impl OrchestratorBuilder {
    pub fn policy(mut self, policy: ValidationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn timeouts(mut self, timeouts: StepTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Share an existing mount table, e.g. one the host also reads
    pub fn table(mut self, table: Arc<MountTable>) -> Self {
        self.table = Some(table);
        self
    }

    pub fn index(mut self, index: Arc<AssetIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn build(self) -> LifecycleOrchestrator {
        let table = self.table.unwrap_or_default();
        let index = self.index.unwrap_or_default();
        let sync = IndexSynchronizer::new(Arc::clone(&index), Arc::clone(&table));

        LifecycleOrchestrator {
            inner: Arc::new(Inner {
                allocator: self.allocator,
                table,
                index,
                sync,
                mounter: self.mounter,
                policy: self.policy,
                timeouts: self.timeouts,
                slots: DashMap::new(),
            }),
        }
    }
}

/// Serializes operations per identifier and keeps every subsystem consistent
#[derive(Clone)]
pub struct LifecycleOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    allocator: NamespaceAllocator,
    table: Arc<MountTable>,
    index: Arc<AssetIndex>,
    sync: IndexSynchronizer,
    mounter: Arc<dyn PakMounter>,
    policy: ValidationPolicy,
    timeouts: StepTimeouts,
    slots: DashMap<ContentId, Arc<Slot>>,
}

impl fmt::Debug for LifecycleOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleOrchestrator")
            .field("root", &self.inner.allocator.root())
            .field("mounted", &self.inner.table.len())
            .field("generation", &self.inner.index.generation())
            .finish()
    }
}

impl LifecycleOrchestrator {
    pub fn builder(allocator: NamespaceAllocator, mounter: Arc<dyn PakMounter>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            allocator,
            mounter,
            policy: ValidationPolicy::default(),
            timeouts: StepTimeouts::default(),
            table: None,
            index: None,
        }
    }

    /// Queue `operation` behind any earlier work for the same identifier
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, operation: Operation) -> OperationHandle {
        let content_id = operation.content_id().clone();
        let cancel = CancellationToken::new();
        let (reply, outcome) = oneshot::channel();

        tracing::debug!(content_id = %content_id, operation = operation.kind(), "Operation queued");

        let job = Job {
            operation,
            cancel: cancel.clone(),
            reply,
        };
        // The entry guard keeps the worker from retiring the slot mid-send
        let sent = self.slot_entry(&content_id).queue.send(job);
        if let Err(mpsc::error::SendError(job)) = sent {
            let _ = job.reply.send(OperationOutcome::Failed(Error::Other(format!(
                "worker for '{}' has stopped",
                content_id
            ))));
        }

        OperationHandle {
            content_id,
            cancel,
            outcome,
        }
    }

    pub async fn install(&self, source: PackageSource) -> OperationOutcome {
        self.submit(Operation::Install(source)).outcome().await
    }

    pub async fn update(&self, source: PackageSource) -> OperationOutcome {
        self.submit(Operation::Update(source)).outcome().await
    }

    pub async fn uninstall(&self, id: &ContentId) -> OperationOutcome {
        self.submit(Operation::Uninstall(id.clone())).outcome().await
    }

    pub async fn enable(&self, id: &ContentId) -> OperationOutcome {
        self.submit(Operation::Enable(id.clone())).outcome().await
    }

    pub async fn disable(&self, id: &ContentId) -> OperationOutcome {
        self.submit(Operation::Disable(id.clone())).outcome().await
    }

    /// Uninstall every recorded package, disabled ones included
    ///
    /// The uninstalls are queued together and run in parallel across
    /// identifiers. Outcomes come back in mount order.
    pub async fn unload_all(&self) -> Vec<(ContentId, OperationOutcome)> {
        let handles: Vec<OperationHandle> = self
            .inner
            .table
            .list_all()
            .into_iter()
            .map(|record| self.submit(Operation::Uninstall(record.content_id)))
            .collect();

        tracing::info!(packages = handles.len(), "Unloading all content");

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            let id = handle.content_id().clone();
            outcomes.push((id, handle.outcome().await));
        }
        outcomes
    }

    /// Lifecycle state of `id`
    ///
    /// `None` once nothing is known about the identifier: either nothing was
    /// submitted for it, or its last operation left it unmounted and its
    /// queue has been retired.
    pub fn state(&self, id: &ContentId) -> Option<LifecycleState> {
        self.inner.slots.get(id).map(|slot| slot.state())
    }

    /// Identifiers that currently have a worker queue
    pub fn tracked(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn lookup(&self, id: &ContentId) -> Option<MountRecord> {
        self.inner.table.lookup(id)
    }

    pub fn list_active(&self) -> Vec<MountRecord> {
        self.inner.table.list_active()
    }

    pub fn list_all(&self) -> Vec<MountRecord> {
        self.inner.table.list_all()
    }

    pub fn index(&self) -> &Arc<AssetIndex> {
        &self.inner.index
    }

    pub fn table(&self) -> &Arc<MountTable> {
        &self.inner.table
    }

    pub fn allocator(&self) -> &NamespaceAllocator {
        &self.inner.allocator
    }

    pub fn is_halted(&self, id: &ContentId) -> bool {
        self.inner
            .slots
            .get(id)
            .map(|slot| slot.halted.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Let operations run again for an identifier halted by a fault
    ///
    /// Returns whether the identifier was halted.
    pub fn clear_fault(&self, id: &ContentId) -> bool {
        let Some(slot) = self.inner.slots.get(id).map(|s| Arc::clone(&s)) else {
            return false;
        };
        let was_halted = slot.halted.swap(false, Ordering::SeqCst);
        if was_halted {
            tracing::info!(content_id = %id, "Fault cleared");
        }
        was_halted
    }

    /// Re-register packages that are already mounted on the host
    ///
    /// Used at start-up with the records persisted by the previous session.
    /// The host VFS is not touched. Records are restored in the order given,
    /// so later records win any asset they share with earlier ones. Disabled
    /// records are restored without publishing anything.
    pub async fn adopt(&self, records: Vec<MountRecord>) -> Result<Vec<PublishConflict>> {
        let mut conflicts = Vec::new();

        for record in records {
            let id = record.content_id.clone();
            let assets = record.assets.clone();
            let expected = self.inner.allocator.allocate(&id)?;
            if record.mount_path != expected {
                tracing::warn!(
                    content_id = %id,
                    recorded = %record.mount_path,
                    expected = %expected,
                    "Adopting a mount recorded under a different namespace root"
                );
            }

            let enabled = record.enabled;
            self.inner.table.restore(record)?;
            let state = if enabled {
                let report = self.inner.sync.publish(&id, &assets)?;
                conflicts.extend(report.conflicts);
                LifecycleState::Active
            } else {
                LifecycleState::Disabled
            };

            *self.slot_entry(&id).state.write() = state;
            tracing::debug!(content_id = %id, assets = assets.len(), state = %state, "Adopted mount");
        }

        Ok(conflicts)
    }

    /// Slot of `id`, starting a worker if there is none
    ///
    /// The returned guard locks the slot's shard; drop it promptly.
    fn slot_entry(&self, id: &ContentId) -> RefMut<'_, ContentId, Arc<Slot>> {
        self.inner.slots.entry(id.clone()).or_insert_with(|| {
            let (queue, jobs) = mpsc::unbounded_channel();
            tokio::spawn(drain(Arc::downgrade(&self.inner), id.clone(), jobs));
            Arc::new(Slot {
                queue,
                state: RwLock::new(LifecycleState::Pending),
                halted: AtomicBool::new(false),
            })
        })
    }
}

/// Worker loop for one identifier
async fn drain(inner: Weak<Inner>, id: ContentId, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        let Some(inner) = inner.upgrade() else {
            let _ = job.reply.send(OperationOutcome::Failed(Error::Other(
                "orchestrator shut down".to_string(),
            )));
            break;
        };
        let Some(slot) = inner.slots.get(&id).map(|s| Arc::clone(&s)) else {
            break;
        };

        let outcome = inner.run(&slot, job.operation, &job.cancel).await;

        let retired = inner.retire(&id, &slot, &jobs);
        let _ = job.reply.send(outcome);
        if retired {
            break;
        }
    }
    tracing::trace!(content_id = %id, "Worker stopped");
}

impl Inner {
    async fn run(
        &self,
        slot: &Slot,
        operation: Operation,
        cancel: &CancellationToken,
    ) -> OperationOutcome {
        let id = operation.content_id().clone();

        if slot.halted.load(Ordering::SeqCst) {
            return OperationOutcome::Failed(Error::Halted(id));
        }
        if cancel.is_cancelled() {
            tracing::debug!(content_id = %id, "Cancelled while queued");
            return OperationOutcome::Cancelled;
        }

        let kind = operation.kind();
        let cancellable = matches!(operation, Operation::Install(_) | Operation::Update(_));
        let outcome = match operation {
            Operation::Install(source) => self.install(slot, source, cancel).await,
            Operation::Update(source) => self.update(slot, source, cancel).await,
            Operation::Uninstall(id) => self.uninstall(slot, &id).await,
            Operation::Enable(id) => self.enable(slot, &id, cancel).await,
            Operation::Disable(id) => self.disable(slot, &id).await,
        };

        let outcome = match outcome {
            OperationOutcome::Succeeded { state, .. }
                if cancellable && state == LifecycleState::Active && cancel.is_cancelled() =>
            {
                // Cancellation deferred until the package was stable
                tracing::info!(content_id = %id, "Operation cancelled after mounting; uninstalling");
                match self.uninstall(slot, &id).await {
                    OperationOutcome::Succeeded { .. } => OperationOutcome::Cancelled,
                    other => other,
                }
            }
            other => other,
        };

        match &outcome {
            OperationOutcome::Succeeded { state, warnings } => {
                tracing::info!(
                    content_id = %id,
                    operation = kind,
                    state = %state,
                    warnings = warnings.len(),
                    "Operation succeeded"
                );
            }
            OperationOutcome::Failed(e) if e.is_fault() => {
                slot.halted.store(true, Ordering::SeqCst);
                self.transition(&id, slot, LifecycleState::Failed);
                tracing::error!(content_id = %id, operation = kind, error = %e, "Consistency fault; identifier halted");
            }
            OperationOutcome::Failed(e) => {
                tracing::info!(content_id = %id, operation = kind, error = %e, "Operation failed");
            }
            OperationOutcome::Cancelled => {
                tracing::info!(content_id = %id, operation = kind, "Operation cancelled");
            }
        }

        outcome
    }

    /// Forget `id` once its queue is drained and nothing of it is left
    ///
    /// Halted identifiers and identifiers with a record are kept. Returns
    /// whether the slot was removed; the worker must then stop.
    fn retire(&self, id: &ContentId, slot: &Arc<Slot>, jobs: &mpsc::UnboundedReceiver<Job>) -> bool {
        if slot.halted.load(Ordering::SeqCst) || self.table.is_bound(id) {
            return false;
        }

        // Submitters send while holding the shard lock, so an empty queue
        // seen under `remove_if` stays empty
        let removed = self
            .slots
            .remove_if(id, |_, current| Arc::ptr_eq(current, slot) && jobs.is_empty())
            .is_some();
        if removed {
            tracing::trace!(content_id = %id, state = %slot.state(), "Retired worker");
        }
        removed
    }

    fn transition(&self, id: &ContentId, slot: &Slot, to: LifecycleState) {
        let mut state = slot.state.write();
        tracing::debug!(content_id = %id, from = %*state, to = %to, "State transition");
        *state = to;
    }

    async fn install(
        &self,
        slot: &Slot,
        source: PackageSource,
        cancel: &CancellationToken,
    ) -> OperationOutcome {
        let id = source.content_id.clone();
        if self.table.is_bound(&id) {
            return OperationOutcome::Failed(Error::AlreadyMounted(id));
        }

        let prior = slot.state();
        self.transition(&id, slot, LifecycleState::Validating);

        let validated = match self.validate(&source, cancel).await {
            None => {
                self.transition(&id, slot, prior);
                return OperationOutcome::Cancelled;
            }
            Some(Err(e)) => {
                self.transition(&id, slot, LifecycleState::Failed);
                return OperationOutcome::Failed(e);
            }
            Some(Ok(validated)) => validated,
        };
        if cancel.is_cancelled() {
            self.transition(&id, slot, prior);
            return OperationOutcome::Cancelled;
        }

        let mut package = ContentPackage::pending(id.clone(), origin_of(&validated));
        package.assets = validated.assets.iter().cloned().collect();

        self.transition(&id, slot, LifecycleState::Mounting);
        let mut undo = Vec::new();
        match self.install_steps(slot, &mut package, &mut undo).await {
            Ok(warnings) => {
                self.transition(&id, slot, LifecycleState::Active);
                OperationOutcome::Succeeded {
                    state: LifecycleState::Active,
                    warnings,
                }
            }
            Err(e) => {
                let e = self.unwind(&id, undo, e).await;
                self.transition(&id, slot, LifecycleState::Failed);
                OperationOutcome::Failed(e)
            }
        }
    }

    async fn install_steps(
        &self,
        slot: &Slot,
        package: &mut ContentPackage,
        undo: &mut Vec<Compensation>,
    ) -> Result<Vec<PublishConflict>> {
        let id = package.content_id.clone();
        let mount_path = self.allocator.allocate(&id)?;
        package.mount_path = Some(mount_path.clone());

        self.table
            .bind(&id, &mount_path, BTreeSet::new(), package.origin.clone())?;
        undo.push(Compensation::Unbind(id.clone()));

        self.mount(&package.origin.archive_path, &mount_path, undo)
            .await?;

        self.transition(&id, slot, LifecycleState::Indexing);
        let warnings = self.publish(&id, &package.assets, false, undo).await?;
        package.state = LifecycleState::Active;
        Ok(warnings)
    }

    async fn update(
        &self,
        slot: &Slot,
        source: PackageSource,
        cancel: &CancellationToken,
    ) -> OperationOutcome {
        let id = source.content_id.clone();
        let Some(current) = self.table.lookup(&id) else {
            return OperationOutcome::Failed(Error::NotMounted(id));
        };
        if !current.enabled {
            return OperationOutcome::Failed(Error::Disabled(id));
        }

        self.transition(&id, slot, LifecycleState::Validating);
        let validated = match self.validate(&source, cancel).await {
            None => {
                self.transition(&id, slot, LifecycleState::Active);
                return OperationOutcome::Cancelled;
            }
            Some(Err(e)) => {
                // The original archive never stopped serving
                self.transition(&id, slot, LifecycleState::Active);
                return OperationOutcome::Failed(e);
            }
            Some(Ok(validated)) => validated,
        };
        if cancel.is_cancelled() {
            self.transition(&id, slot, LifecycleState::Active);
            return OperationOutcome::Cancelled;
        }

        self.transition(&id, slot, LifecycleState::Swapping);
        let mut undo = Vec::new();
        let result = self.swap(&current, &validated, &mut undo).await;

        match result {
            Ok(warnings) => {
                self.transition(&id, slot, LifecycleState::Active);
                OperationOutcome::Succeeded {
                    state: LifecycleState::Active,
                    warnings,
                }
            }
            Err(e) => {
                let e = self.unwind(&id, undo, e).await;
                self.settle_failure(&id, slot, &e, LifecycleState::Active);
                OperationOutcome::Failed(e)
            }
        }
    }

    /// Mount the new archive beside the old one, move the index over, then
    /// park the old mount and promote the new one into its place
    ///
    /// The parked mount is dropped only once the record points at the new
    /// archive, so rolling back never reads the old archive again.
    async fn swap(
        &self,
        current: &MountRecord,
        validated: &ValidatedArchive,
        undo: &mut Vec<Compensation>,
    ) -> Result<Vec<PublishConflict>> {
        let id = &current.content_id;
        let canonical = current.mount_path.clone();
        let staging = self.allocator.allocate_staging(id, validated.version())?;
        let backup = self.allocator.allocate_backup(id, current.origin.version)?;
        let assets: BTreeSet<AssetId> = validated.assets.iter().cloned().collect();

        self.mount(&validated.path, &staging, undo).await?;
        let warnings = self.publish(id, &assets, true, undo).await?;

        self.relocate(&canonical, &backup, undo).await?;
        self.relocate(&staging, &canonical, undo).await?;

        self.table
            .rebind(id, origin_of(validated))
            .map_err(|e| Error::InternalConsistencyFault {
                id: id.clone(),
                reason: format!("record vanished during update: {}", e),
            })?;

        if let Err(e) = self.unmount(&backup).await {
            tracing::warn!(content_id = %id, backup = %backup, error = %e, "Failed to drop the replaced mount");
        }
        Ok(warnings)
    }

    async fn uninstall(&self, slot: &Slot, id: &ContentId) -> OperationOutcome {
        let Some(record) = self.table.lookup(id) else {
            return OperationOutcome::Failed(Error::NotMounted(id.clone()));
        };
        let fallback = if record.enabled {
            LifecycleState::Active
        } else {
            LifecycleState::Disabled
        };

        self.transition(id, slot, LifecycleState::Unmounting);
        let mut undo = Vec::new();

        let result = async {
            if record.enabled {
                self.retract(id, &mut undo).await?;
                self.unmount(&record.mount_path).await?;
            }

            self.table
                .unbind(id)
                .map_err(|e| Error::InternalConsistencyFault {
                    id: id.clone(),
                    reason: format!("record vanished during uninstall: {}", e),
                })
        }
        .await;

        match result {
            Ok(_) => {
                self.transition(id, slot, LifecycleState::Retired);
                OperationOutcome::succeeded(LifecycleState::Retired)
            }
            Err(e) => {
                let e = self.unwind(id, undo, e).await;
                self.settle_failure(id, slot, &e, fallback);
                OperationOutcome::Failed(e)
            }
        }
    }

    /// Take a package out of the index and off the host, keeping its record
    async fn disable(&self, slot: &Slot, id: &ContentId) -> OperationOutcome {
        let Some(record) = self.table.lookup(id) else {
            return OperationOutcome::Failed(Error::NotMounted(id.clone()));
        };
        if !record.enabled {
            return OperationOutcome::succeeded(LifecycleState::Disabled);
        }

        self.transition(id, slot, LifecycleState::Unmounting);
        let mut undo = Vec::new();

        let result = async {
            self.retract(id, &mut undo).await?;
            self.unmount(&record.mount_path).await?;

            self.table
                .set_enabled(id, false)
                .map_err(|e| Error::InternalConsistencyFault {
                    id: id.clone(),
                    reason: format!("record vanished while disabling: {}", e),
                })
        }
        .await;

        match result {
            Ok(_) => {
                self.transition(id, slot, LifecycleState::Disabled);
                OperationOutcome::succeeded(LifecycleState::Disabled)
            }
            Err(e) => {
                let e = self.unwind(id, undo, e).await;
                self.settle_failure(id, slot, &e, LifecycleState::Active);
                OperationOutcome::Failed(e)
            }
        }
    }

    /// Mount and index a disabled package again from its recorded archive
    ///
    /// The archive is validated against the recorded version and checksum
    /// first, so a file replaced while the package was disabled is refused.
    async fn enable(
        &self,
        slot: &Slot,
        id: &ContentId,
        cancel: &CancellationToken,
    ) -> OperationOutcome {
        let Some(record) = self.table.lookup(id) else {
            return OperationOutcome::Failed(Error::NotMounted(id.clone()));
        };
        if record.enabled {
            return OperationOutcome::succeeded(LifecycleState::Active);
        }

        let mut source = PackageSource::new(id.clone(), record.origin.archive_path.clone())
            .with_declared_version(record.origin.version);
        if !record.origin.checksum.is_empty() {
            source = source.with_checksum(record.origin.checksum.clone());
        }

        self.transition(id, slot, LifecycleState::Validating);
        let validated = match self.validate(&source, cancel).await {
            None => {
                self.transition(id, slot, LifecycleState::Disabled);
                return OperationOutcome::Cancelled;
            }
            Some(Err(e)) => {
                self.transition(id, slot, LifecycleState::Disabled);
                return OperationOutcome::Failed(e);
            }
            Some(Ok(validated)) => validated,
        };
        if cancel.is_cancelled() {
            self.transition(id, slot, LifecycleState::Disabled);
            return OperationOutcome::Cancelled;
        }

        let assets: BTreeSet<AssetId> = validated.assets.iter().cloned().collect();
        self.transition(id, slot, LifecycleState::Mounting);
        let mut undo = Vec::new();

        let result = async {
            self.mount(&validated.path, &record.mount_path, &mut undo)
                .await?;

            self.transition(id, slot, LifecycleState::Indexing);
            let warnings = self.publish(id, &assets, false, &mut undo).await?;

            self.table
                .set_enabled(id, true)
                .map_err(|e| Error::InternalConsistencyFault {
                    id: id.clone(),
                    reason: format!("record vanished while enabling: {}", e),
                })?;
            Ok::<_, Error>(warnings)
        }
        .await;

        match result {
            Ok(warnings) => {
                self.transition(id, slot, LifecycleState::Active);
                OperationOutcome::Succeeded {
                    state: LifecycleState::Active,
                    warnings,
                }
            }
            Err(e) => {
                let e = self.unwind(id, undo, e).await;
                self.settle_failure(id, slot, &e, LifecycleState::Disabled);
                OperationOutcome::Failed(e)
            }
        }
    }

    /// State after a rolled-back operation: `fallback`, unless rollback itself failed
    fn settle_failure(&self, id: &ContentId, slot: &Slot, error: &Error, fallback: LifecycleState) {
        let state = if error.is_fault() {
            LifecycleState::Failed
        } else {
            fallback
        };
        self.transition(id, slot, state);
    }

    /// Validate off the async runtime; `None` means cancelled
    async fn validate(
        &self,
        source: &PackageSource,
        cancel: &CancellationToken,
    ) -> Option<Result<ValidatedArchive>> {
        let source = source.clone();
        let policy = self.policy.clone();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = self.blocking(Step::Validate, move || archive::validate(&source, &policy)) => {
                Some(outcome.settle(Step::Validate, |_| {}))
            }
        }
    }

    async fn mount(
        &self,
        archive: &std::path::Path,
        mount_point: &MountPath,
        undo: &mut Vec<Compensation>,
    ) -> Result<()> {
        let mounter = Arc::clone(&self.mounter);
        let (archive, target) = (archive.to_path_buf(), mount_point.clone());

        self.blocking(Step::Mount, move || mounter.mount(&archive, &target))
            .await
            .settle(Step::Mount, |()| {
                undo.push(Compensation::Unmount(mount_point.clone()))
            })?;
        undo.push(Compensation::Unmount(mount_point.clone()));
        Ok(())
    }

    /// Unmount as the last host step of an operation
    ///
    /// Nothing can put the mount back afterwards, so a call that succeeds
    /// after its timeout still counts as done.
    async fn unmount(&self, mount_point: &MountPath) -> Result<()> {
        let mounter = Arc::clone(&self.mounter);
        let target = mount_point.clone();

        match self
            .blocking(Step::Mount, move || mounter.unmount(&target))
            .await
        {
            StepOutcome::Completed(result) => result,
            StepOutcome::TimedOut { after, late: Some(()) } => {
                tracing::warn!(mount_point = %mount_point, ?after, "Unmount finished after its timeout");
                Ok(())
            }
            StepOutcome::TimedOut { after, late: None } => Err(Error::Timeout {
                step: Step::Mount,
                after,
            }),
        }
    }

    /// Move the mount at `from` to `to`
    async fn relocate(
        &self,
        from: &MountPath,
        to: &MountPath,
        undo: &mut Vec<Compensation>,
    ) -> Result<()> {
        let mounter = Arc::clone(&self.mounter);
        let (source, target) = (from.clone(), to.clone());

        self.blocking(Step::Mount, move || mounter.promote(&source, &target))
            .await
            .settle(Step::Mount, |()| relocated(undo, from, to))?;
        relocated(undo, from, to);
        Ok(())
    }

    async fn retract(&self, id: &ContentId, undo: &mut Vec<Compensation>) -> Result<()> {
        let sync = self.sync.clone();
        let owner = id.clone();

        let delta = self
            .blocking(Step::Index, move || sync.retract(&owner))
            .await
            .settle(Step::Index, |delta| {
                undo.push(Compensation::RevertIndex(delta))
            })?;
        undo.push(Compensation::RevertIndex(delta));
        Ok(())
    }

    async fn publish(
        &self,
        id: &ContentId,
        assets: &BTreeSet<AssetId>,
        replace: bool,
        undo: &mut Vec<Compensation>,
    ) -> Result<Vec<PublishConflict>> {
        let sync = self.sync.clone();
        let (owner, owned) = (id.clone(), assets.clone());

        let report = self
            .blocking(Step::Index, move || {
                if replace {
                    sync.replace(&owner, &owned)
                } else {
                    sync.publish(&owner, &owned)
                }
            })
            .await
            .settle(Step::Index, |report| {
                undo.push(Compensation::RevertIndex(report.delta))
            })?;
        undo.push(Compensation::RevertIndex(report.delta));
        Ok(report.conflicts)
    }

    /// Run `f` on the blocking pool under the timeout for `step`
    ///
    /// Host calls that overrun are still awaited so nothing is compensated
    /// while the call is in flight. Validation has no side effects and is
    /// abandoned instead.
    async fn blocking<T, F>(&self, step: Step, f: F) -> StepOutcome<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut handle = tokio::task::spawn_blocking(f);

        let joined = match self.timeouts.for_step(step) {
            None => handle.await,
            Some(after) => match tokio::time::timeout(after, &mut handle).await {
                Ok(joined) => joined,
                Err(_) if step == Step::Validate => {
                    return StepOutcome::TimedOut { after, late: None };
                }
                Err(_) => {
                    tracing::warn!(%step, ?after, "Step timed out; waiting for the host call to return");
                    let late = handle.await.ok().and_then(|result| result.ok());
                    return StepOutcome::TimedOut { after, late };
                }
            },
        };

        StepOutcome::Completed(joined.unwrap_or_else(|e| {
            Err(Error::Other(format!("{} step aborted: {}", step, e)))
        }))
    }

    /// Run compensations in reverse; returns the error to report
    async fn unwind(&self, id: &ContentId, undo: Vec<Compensation>, cause: Error) -> Error {
        tracing::debug!(content_id = %id, steps = undo.len(), error = %cause, "Rolling back");

        let mut failures = Vec::new();
        for compensation in undo.into_iter().rev() {
            if let Err(e) = self.compensate(&compensation).await {
                tracing::error!(content_id = %id, ?compensation, error = %e, "Compensation failed");
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            cause
        } else {
            Error::InternalConsistencyFault {
                id: id.clone(),
                reason: format!(
                    "rollback after '{}' incomplete: {}",
                    cause,
                    failures.join("; ")
                ),
            }
        }
    }

    async fn compensate(&self, compensation: &Compensation) -> Result<()> {
        match compensation {
            Compensation::Unbind(id) => self.table.unbind(id).map(|_| ()),
            Compensation::RevertIndex(delta) => self.sync.revert(delta).map(|_| ()),
            Compensation::Unmount(mount_point) => {
                let mounter = Arc::clone(&self.mounter);
                let target = mount_point.clone();
                join_blocking(move || mounter.unmount(&target)).await
            }
            Compensation::Restore { from, to } => {
                let mounter = Arc::clone(&self.mounter);
                let (source, target) = (from.clone(), to.clone());
                join_blocking(move || mounter.promote(&source, &target)).await
            }
        }
    }
}

/// Record a completed move from `from` to `to`
///
/// A mount this operation created is now torn down at `to`, and that must
/// happen before anything parked is moved back, so the entry goes to the
/// top of the stack. A mount that predates the operation was parked and is
/// moved back instead.
fn relocated(undo: &mut Vec<Compensation>, from: &MountPath, to: &MountPath) {
    let ours = undo
        .iter()
        .any(|c| matches!(c, Compensation::Unmount(p) if p == from));

    if ours {
        undo.retain(|c| !matches!(c, Compensation::Unmount(p) if p == from));
        undo.push(Compensation::Unmount(to.clone()));
    } else {
        undo.push(Compensation::Restore {
            from: to.clone(),
            to: from.clone(),
        });
    }
}

async fn join_blocking<F>(f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(format!("compensation aborted: {}", e)))?
}

fn origin_of(validated: &ValidatedArchive) -> ArchiveOrigin {
    ArchiveOrigin {
        archive_path: validated.path.clone(),
        version: validated.version(),
        checksum: validated.checksum.clone(),
    }
}
