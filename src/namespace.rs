//! Content identifiers and mount path allocation
//!
//! Every package is mounted at `<root>/<content-id>`. The identifier is used
//! verbatim as a single path segment, so the mapping is injective: two
//! different identifiers can never produce the same mount path. Identifiers
//! that cannot be represented as a path segment are rejected instead of being
//! escaped or rewritten.
//!
//! Updates mount the incoming archive at a staging path under
//! `<root>/~staging/`. `~` is never legal in an identifier, so staging paths
//! cannot collide with canonical ones.
//!
//! # Examples
//!
//! ```
//! use ugcmount::{ContentId, NamespaceAllocator};
//!
//! let allocator = NamespaceAllocator::new("/ugc").unwrap();
//! let path = allocator.allocate(&ContentId::from("mod-42")).unwrap();
//! assert_eq!(path.as_str(), "/ugc/mod-42");
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest identifier accepted as a path segment
pub const MAX_IDENTIFIER_LEN: usize = 128;

const STAGING_SEGMENT: &str = "~staging";
const BACKUP_SEGMENT: &str = "~backup";

/// Stable, service-assigned identifier of one UGC package
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ContentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// mod.io style numeric mod IDs
impl From<i64> for ContentId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for ContentId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Location in the virtual content namespace, always `/`-separated and absolute
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountPath(String);

impl MountPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments without the leading root separator
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    pub fn is_staging(&self) -> bool {
        self.segments().any(|s| s == STAGING_SEGMENT)
    }

    pub fn is_backup(&self) -> bool {
        self.segments().any(|s| s == BACKUP_SEGMENT)
    }
}

impl fmt::Display for MountPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives mount paths from content identifiers
#[derive(Debug, Clone)]
pub struct NamespaceAllocator {
    root: String,
}

impl NamespaceAllocator {
    /// Create an allocator rooted at `root` (e.g. `/ugc`)
    ///
    /// Every segment of the root must itself be a legal path segment.
    pub fn new(root: &str) -> Result<Self> {
        let mut normalized = String::new();
        for segment in root.split('/').filter(|s| !s.is_empty()) {
            check_segment(segment).map_err(|reason| {
                Error::Other(format!("Invalid namespace root '{}': {}", root, reason))
            })?;
            normalized.push('/');
            normalized.push_str(segment);
        }

        Ok(Self { root: normalized })
    }

    pub fn root(&self) -> &str {
        if self.root.is_empty() {
            "/"
        } else {
            &self.root
        }
    }

    /// Canonical mount path for `id`
    pub fn allocate(&self, id: &ContentId) -> Result<MountPath> {
        check_segment(id.as_str()).map_err(|reason| Error::InvalidIdentifier {
            id: id.to_string(),
            reason,
        })?;

        Ok(MountPath(format!("{}/{}", self.root, id)))
    }

    /// Staging mount path used while `id` is swapped to `version`
    pub fn allocate_staging(&self, id: &ContentId, version: u64) -> Result<MountPath> {
        self.allocate_aside(STAGING_SEGMENT, id, version)
    }

    /// Path the mount of `id` at `version` is parked at while its successor
    /// takes over the canonical path
    pub fn allocate_backup(&self, id: &ContentId, version: u64) -> Result<MountPath> {
        self.allocate_aside(BACKUP_SEGMENT, id, version)
    }

    fn allocate_aside(&self, area: &str, id: &ContentId, version: u64) -> Result<MountPath> {
        check_segment(id.as_str()).map_err(|reason| Error::InvalidIdentifier {
            id: id.to_string(),
            reason,
        })?;

        Ok(MountPath(format!("{}/{}/{}/v{}", self.root, area, id, version)))
    }
}

fn check_segment(segment: &str) -> std::result::Result<(), String> {
    if segment.is_empty() {
        return Err("identifier is empty".to_string());
    }
    if segment.len() > MAX_IDENTIFIER_LEN {
        return Err(format!(
            "identifier is {} bytes long (max {})",
            segment.len(),
            MAX_IDENTIFIER_LEN
        ));
    }
    if segment == "." || segment == ".." {
        return Err("identifier is a relative path component".to_string());
    }
    if let Some(bad) = segment
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(format!("character {:?} is not allowed", bad));
    }
    Ok(())
}
