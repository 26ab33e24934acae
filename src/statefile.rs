//! Persisted mount state
//!
//! The CLI runs one process per command, so what is mounted has to survive
//! between invocations. `state.toml` holds one entry per mounted package,
//! disabled ones included;
//! on start-up the records are handed to
//! [`LifecycleOrchestrator::adopt`](crate::LifecycleOrchestrator::adopt),
//! and after every command the table is written back.
//!
//! # Examples
//!
//! ```no_run
//! use ugcmount::StateFile;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! if let Some(state) = StateFile::load_from("state.toml")? {
//!     println!("{} packages mounted", state.mounts.len());
//! }
//! # Ok(())
//! # }
//! ```

use crate::mount_table::MountRecord;
use crate::namespace::ContentId;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    pub metadata: StateMetadata,

    #[serde(rename = "mount", default)]
    pub mounts: Vec<MountRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMetadata {
    /// Version of ugcmount that wrote the file
    pub ugcmount_version: String,

    /// Namespace root the mount paths were allocated under
    pub namespace_root: String,

    pub generated_at: DateTime<Utc>,
}

impl StateFile {
    pub fn new(namespace_root: &str, mounts: Vec<MountRecord>) -> Self {
        Self {
            metadata: StateMetadata {
                ugcmount_version: env!("CARGO_PKG_VERSION").to_string(),
                namespace_root: namespace_root.to_string(),
                generated_at: Utc::now(),
            },
            mounts,
        }
    }

    /// Load the state file, or `None` if nothing has been mounted yet
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(path)?;
        let state: StateFile = toml::from_str(&contents).map_err(|e| {
            Error::Other(format!(
                "Failed to parse state file {}: {}",
                path.display(),
                e
            ))
        })?;

        Ok(Some(state))
    }

    /// Write the state file, replacing the previous one atomically
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| Error::Other(format!("Failed to serialize state file: {}", e)))?;

        let scratch = path.with_extension("toml.tmp");
        fs::write(&scratch, toml_string)?;
        fs::rename(&scratch, path)?;
        Ok(())
    }

    pub fn get(&self, id: &ContentId) -> Option<&MountRecord> {
        self.mounts.iter().find(|m| &m.content_id == id)
    }
}
