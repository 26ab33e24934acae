//! Host virtual filesystem mounters
//!
//! The orchestrator talks to the host VFS only through [`PakMounter`]. Two
//! implementations ship with the crate:
//!
//! - [`ExtractingMounter`] materializes each mount as a directory tree under
//!   a root folder, one directory per mount path segment. This is what the
//!   CLI uses.
//! - [`MemoryMounter`] only records which archive sits at which path. Hosts
//!   that own the real pak mount embed it, and tests use it.
//!
//! Mount calls are blocking and may be slow; the orchestrator runs them on
//! the blocking pool.

use crate::namespace::MountPath;
use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::Archive;

/// Host VFS operations needed by the lifecycle orchestrator
pub trait PakMounter: Send + Sync {
    /// Make the contents of `archive` visible at `mount_point`
    fn mount(&self, archive: &Path, mount_point: &MountPath) -> Result<()>;

    /// Remove whatever is mounted at `mount_point`
    fn unmount(&self, mount_point: &MountPath) -> Result<()>;

    /// Move the mount at `from` to `to`, which must be free
    ///
    /// Used both to promote a staging mount and to park the mount it replaces.
    fn promote(&self, from: &MountPath, to: &MountPath) -> Result<()>;
}

fn mount_error(path: &MountPath, reason: impl Into<String>) -> Error {
    Error::Mount {
        path: path.clone(),
        reason: reason.into(),
    }
}

/// Mounts archives by extracting them below a root directory
#[derive(Debug, Clone)]
pub struct ExtractingMounter {
    root: PathBuf,
}

impl ExtractingMounter {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory backing `mount_point`
    pub fn directory_for(&self, mount_point: &MountPath) -> PathBuf {
        mount_point
            .segments()
            .fold(self.root.clone(), |dir, segment| dir.join(segment))
    }

    /// Scratch directory a mount is extracted into before it becomes visible
    fn partial_for(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        // '~' never appears in an identifier segment
        target.with_file_name(format!("~{}.partial", name))
    }

    /// Remove empty directories left between `dir` and the root
    fn prune_parents(&self, dir: &Path) {
        let mut current = dir.parent();
        while let Some(parent) = current {
            if parent == self.root || !parent.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(parent).is_err() {
                break;
            }
            current = parent.parent();
        }
    }
}

impl PakMounter for ExtractingMounter {
    fn mount(&self, archive: &Path, mount_point: &MountPath) -> Result<()> {
        let target = self.directory_for(mount_point);
        if target.exists() {
            return Err(mount_error(
                mount_point,
                format!("{} already exists", target.display()),
            ));
        }

        let partial = Self::partial_for(&target);
        if partial.exists() {
            // Left over from an interrupted mount
            fs::remove_dir_all(&partial)?;
        }
        fs::create_dir_all(&partial)?;

        let unpacked = File::open(archive)
            .map_err(Error::from)
            .and_then(|file| {
                Archive::new(GzDecoder::new(file))
                    .unpack(&partial)
                    .map_err(|e| mount_error(mount_point, format!("extraction failed: {}", e)))
            })
            .and_then(|()| fs::rename(&partial, &target).map_err(Error::from));

        if let Err(e) = unpacked {
            let _ = fs::remove_dir_all(&partial);
            self.prune_parents(&partial);
            return Err(e);
        }

        tracing::debug!(
            archive = %archive.display(),
            directory = %target.display(),
            "Extracted archive"
        );
        Ok(())
    }

    fn unmount(&self, mount_point: &MountPath) -> Result<()> {
        let target = self.directory_for(mount_point);
        if !target.is_dir() {
            return Err(mount_error(mount_point, "nothing is mounted here"));
        }

        fs::remove_dir_all(&target).map_err(|e| {
            mount_error(
                mount_point,
                format!("failed to remove {}: {}", target.display(), e),
            )
        })?;
        self.prune_parents(&target);
        Ok(())
    }

    fn promote(&self, from: &MountPath, to: &MountPath) -> Result<()> {
        let source = self.directory_for(from);
        let target = self.directory_for(to);

        if !source.is_dir() {
            return Err(mount_error(from, "nothing is mounted here"));
        }
        if target.exists() {
            return Err(mount_error(
                to,
                format!("{} is still occupied", target.display()),
            ));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&source, &target).map_err(|e| {
            mount_error(
                to,
                format!(
                    "failed to move '{}' to '{}': {}",
                    source.display(),
                    target.display(),
                    e
                ),
            )
        })?;
        self.prune_parents(&source);
        Ok(())
    }
}

/// Bookkeeping-only mounter
#[derive(Debug, Default)]
pub struct MemoryMounter {
    mounts: DashMap<MountPath, PathBuf>,
}

impl MemoryMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_mounted(&self, mount_point: &MountPath) -> bool {
        self.mounts.contains_key(mount_point)
    }

    /// Archive currently mounted at `mount_point`
    pub fn archive_at(&self, mount_point: &MountPath) -> Option<PathBuf> {
        self.mounts.get(mount_point).map(|a| a.value().clone())
    }

    pub fn mount_points(&self) -> Vec<MountPath> {
        let mut points: Vec<MountPath> = self.mounts.iter().map(|m| m.key().clone()).collect();
        points.sort();
        points
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

impl PakMounter for MemoryMounter {
    fn mount(&self, archive: &Path, mount_point: &MountPath) -> Result<()> {
        match self.mounts.entry(mount_point.clone()) {
            Entry::Occupied(_) => Err(mount_error(mount_point, "already mounted")),
            Entry::Vacant(slot) => {
                slot.insert(archive.to_path_buf());
                Ok(())
            }
        }
    }

    fn unmount(&self, mount_point: &MountPath) -> Result<()> {
        self.mounts
            .remove(mount_point)
            .map(|_| ())
            .ok_or_else(|| mount_error(mount_point, "nothing is mounted here"))
    }

    fn promote(&self, from: &MountPath, to: &MountPath) -> Result<()> {
        if self.mounts.contains_key(to) {
            return Err(mount_error(to, "still occupied"));
        }
        let (_, archive) = self
            .mounts
            .remove(from)
            .ok_or_else(|| mount_error(from, "nothing is mounted here"))?;

        match self.mounts.entry(to.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(archive);
                Ok(())
            }
            Entry::Occupied(_) => {
                self.mounts.insert(from.clone(), archive);
                Err(mount_error(to, "still occupied"))
            }
        }
    }
}
