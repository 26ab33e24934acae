use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::namespace::{ContentId, MountPath};

pub type Result<T> = std::result::Result<T, Error>;

/// Step of an operation that can carry a timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Validate,
    Mount,
    Index,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Validate => write!(f, "validate"),
            Step::Mount => write!(f, "mount"),
            Step::Index => write!(f, "index"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Version parsing error: {0}")]
    SemVer(#[from] semver::Error),

    #[error("Corrupt archive {}: {reason}", .path.display())]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("Unsupported archive version {}: {reason}", .path.display())]
    UnsupportedVersion { path: PathBuf, reason: String },

    #[error("Archive {} declares no assets", .0.display())]
    EmptyPackage(PathBuf),

    #[error("Invalid content identifier '{id}': {reason}\n\n\
             Hint: content identifiers become a single mount path segment.\n\
             Allowed characters are A-Z, a-z, 0-9, '.', '_' and '-'.")]
    InvalidIdentifier { id: String, reason: String },

    #[error("Mount path {path} is already claimed by '{owner}'")]
    PathCollision { path: MountPath, owner: ContentId },

    #[error("Content '{0}' is already mounted")]
    AlreadyMounted(ContentId),

    #[error("Content '{0}' is not mounted")]
    NotMounted(ContentId),

    #[error("Content '{0}' is disabled\n\n\
             Hint: enable it before updating.")]
    Disabled(ContentId),

    #[error("Host mount failure at {path}: {reason}")]
    Mount { path: MountPath, reason: String },

    #[error("Step '{step}' timed out after {:?}", .after)]
    Timeout { step: Step, after: Duration },

    #[error("Internal consistency fault for '{id}': {reason}")]
    InternalConsistencyFault { id: ContentId, reason: String },

    #[error("Content '{0}' is halted after a consistency fault\n\n\
             Hint: inspect the logs, then clear the fault before retrying.")]
    Halted(ContentId),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptArchive {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::UnsupportedVersion {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Faults that must stop all further work on an identifier
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            Error::InternalConsistencyFault { .. } | Error::PathCollision { .. }
        )
    }
}
