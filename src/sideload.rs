//! Side-loaded content folder
//!
//! Archives dropped into a folder are treated as if the content service had
//! delivered them. [`refresh`] brings the mounted set in line with the
//! folder: new archives are installed, archives whose version changed are
//! updated, and packages whose archive was removed are uninstalled.

use crate::archive::{read_manifest, ArchiveManifest, PackageSource};
use crate::index::PublishConflict;
use crate::namespace::ContentId;
use crate::orchestrator::{LifecycleOrchestrator, Operation, OperationHandle, OperationOutcome};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File name suffixes recognised as archives
pub const ARCHIVE_SUFFIXES: &[&str] = &[".ugc", ".tar.gz"];

/// Archives found in a side-load folder
#[derive(Debug, Default)]
pub struct Scan {
    /// One source per content identifier, newest version first on duplicates
    pub sources: Vec<PackageSource>,

    /// Archives whose manifest could not be read
    pub unreadable: Vec<(PathBuf, String)>,
}

/// What a [`refresh`] changed
#[derive(Debug, Default)]
pub struct RefreshReport {
    pub installed: Vec<ContentId>,
    pub updated: Vec<ContentId>,
    pub removed: Vec<ContentId>,
    pub failed: Vec<(ContentId, String)>,
    pub warnings: Vec<PublishConflict>,
}

impl RefreshReport {
    pub fn is_noop(&self) -> bool {
        self.installed.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.failed.is_empty()
    }
}

/// Strip the archive suffix from a file name
fn archive_stem(file_name: &str) -> Option<&str> {
    ARCHIVE_SUFFIXES
        .iter()
        .find_map(|suffix| file_name.strip_suffix(suffix))
        .filter(|stem| !stem.is_empty())
}

/// Content identifier of an archive: the manifest's, else the file stem
pub fn content_id_for(path: &Path, manifest: &ArchiveManifest) -> Option<ContentId> {
    manifest.content_id.clone().or_else(|| {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(archive_stem)
            .map(ContentId::from)
    })
}

/// Find archives below `dir`
///
/// The content identifier comes from the manifest's `content_id`, falling
/// back to the file name without its suffix. When two archives claim the same
/// identifier the higher version wins.
pub fn scan<P: AsRef<Path>>(dir: P) -> Result<Scan> {
    let dir = dir.as_ref();
    let mut newest: BTreeMap<ContentId, PackageSource> = BTreeMap::new();
    let mut scan = Scan::default();

    if !dir.is_dir() {
        tracing::debug!(directory = %dir.display(), "Side-load folder does not exist");
        return Ok(scan);
    }

    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = entry
            .map_err(|e| Error::Other(format!("Failed to scan {}: {}", dir.display(), e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_str().and_then(archive_stem).is_none() {
            continue;
        }

        let path = entry.path().to_path_buf();
        let manifest = match read_manifest(&path) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(archive = %path.display(), error = %e, "Skipping unreadable archive");
                scan.unreadable.push((path, e.to_string()));
                continue;
            }
        };

        let Some(content_id) = content_id_for(&path, &manifest) else {
            continue;
        };
        let source = PackageSource::new(content_id.clone(), path)
            .with_declared_version(manifest.version);

        match newest.get(&content_id) {
            Some(existing) if existing.declared_version >= source.declared_version => {
                tracing::warn!(
                    content_id = %content_id,
                    kept = %existing.archive_path.display(),
                    ignored = %source.archive_path.display(),
                    "Two side-loaded archives share a content id"
                );
            }
            _ => {
                newest.insert(content_id, source);
            }
        }
    }

    scan.sources = newest.into_values().collect();
    Ok(scan)
}

/// Bring mounted packages in line with the archives in `dir`
///
/// Only packages mounted from inside `dir` are candidates for removal.
/// Disabled packages are left at the version they were disabled at, but
/// are still removed once their archive is gone.
pub async fn refresh<P: AsRef<Path>>(
    orchestrator: &LifecycleOrchestrator,
    dir: P,
) -> Result<RefreshReport> {
    let dir = dir.as_ref();
    let scan = scan(dir)?;
    let mut report = RefreshReport::default();

    let mut pending: Vec<(ContentId, Kind, OperationHandle)> = Vec::new();
    let mut present = BTreeSet::new();

    for source in scan.sources {
        let id = source.content_id.clone();
        present.insert(id.clone());

        let kind = match orchestrator.lookup(&id) {
            None => Kind::Install,
            Some(record) if !record.enabled => continue,
            Some(record) if Some(record.origin.version) != source.declared_version => Kind::Update,
            Some(_) => continue,
        };
        let operation = match kind {
            Kind::Install => Operation::Install(source),
            _ => Operation::Update(source),
        };
        pending.push((id, kind, orchestrator.submit(operation)));
    }

    for record in orchestrator.list_all() {
        if record.origin.archive_path.starts_with(dir) && !present.contains(&record.content_id) {
            let id = record.content_id;
            let handle = orchestrator.submit(Operation::Uninstall(id.clone()));
            pending.push((id, Kind::Remove, handle));
        }
    }

    for (path, reason) in scan.unreadable {
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(archive_stem)
            .map(ContentId::from)
            .unwrap_or_else(|| ContentId::from(path.display().to_string()));
        report.failed.push((id, reason));
    }

    for (id, kind, handle) in pending {
        match handle.outcome().await {
            OperationOutcome::Succeeded { warnings, .. } => {
                report.warnings.extend(warnings);
                match kind {
                    Kind::Install => report.installed.push(id),
                    Kind::Update => report.updated.push(id),
                    Kind::Remove => report.removed.push(id),
                }
            }
            OperationOutcome::Failed(e) => report.failed.push((id, e.to_string())),
            OperationOutcome::Cancelled => report.failed.push((id, "cancelled".to_string())),
        }
    }

    tracing::info!(
        directory = %dir.display(),
        installed = report.installed.len(),
        updated = report.updated.len(),
        removed = report.removed.len(),
        failed = report.failed.len(),
        "Side-load refresh finished"
    );

    Ok(report)
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Install,
    Update,
    Remove,
}
