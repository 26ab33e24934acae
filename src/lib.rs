//! ugcmount - Lifecycle manager for mountable user-generated content
//!
//! ugcmount takes downloaded UGC archives and makes them usable by a running
//! host: it validates each archive, mounts it at a deterministic path in a
//! virtual namespace and publishes the assets it contains to a global asset
//! index. Updates swap archives without a window where neither version is
//! visible, and every failure rolls back to the state before the operation.
//!
//! - Per-content FIFO queues; different packages are handled concurrently
//! - Lock-free index snapshots for readers
//! - Compensating rollback for every partial install, update or uninstall
//! - Packages can be disabled without forgetting them, and enabled again
//! - Side-loaded folders kept in sync with what is mounted
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use ugcmount::{
//!     AssetId, LifecycleOrchestrator, MemoryMounter, NamespaceAllocator, PackageSource,
//! };
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
//! assert!(outcome.is_success());
//!
//! let snapshot = orchestrator.index().snapshot();
//! println!("assetA owned by {:?}", snapshot.owner_of(&AssetId::from("assetA")));
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`archive`] - Archive format and validation
//! - [`namespace`] - Content identifiers and mount path allocation
//! - [`mount_table`] - Record of mounted packages
//! - [`index`] - Asset index and its synchronizer
//! - [`orchestrator`] - Install, update, uninstall, enable and disable state machine
//! - [`vfs`] - Host virtual filesystem mounters
//! - [`sideload`] - Side-loaded content folders
//! - [`statefile`] - Mount state persisted between runs
//! - [`config`] - User configuration
//! - [`platform`] - Platform detection and engine versions
//! - [`error`] - Error types and result handling

pub mod archive;
pub mod config;
pub mod error;
pub mod index;
pub mod logging;
pub mod mount_table;
pub mod namespace;
pub mod orchestrator;
pub mod package;
pub mod platform;
pub mod sideload;
pub mod statefile;
pub mod vfs;

pub use archive::{
    read_manifest, validate, ArchiveManifest, PackageSource, ValidatedArchive, ValidationPolicy,
};
pub use config::Config;
pub use error::{Error, Result, Step};
pub use index::{
    AssetEntry, AssetId, AssetIndex, IndexDelta, IndexSnapshot, IndexSynchronizer,
    PublishConflict, PublishReport,
};
pub use logging::init_logging;
pub use mount_table::{MountRecord, MountTable};
pub use namespace::{ContentId, MountPath, NamespaceAllocator};
pub use orchestrator::{
    LifecycleOrchestrator, Operation, OperationHandle, OperationOutcome, OrchestratorBuilder,
    StepTimeouts,
};
pub use package::{ArchiveOrigin, ContentPackage, LifecycleState};
pub use platform::{detect_platform, parse_engine_version};
pub use sideload::{refresh, scan, RefreshReport};
pub use statefile::StateFile;
pub use vfs::{ExtractingMounter, MemoryMounter, PakMounter};
