pub mod config;
pub mod enable;
pub mod install;
pub mod list;
pub mod sync;
pub mod uninstall;
pub mod unload;
pub mod update;
pub mod validate;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use ugcmount::sideload::content_id_for;
use ugcmount::{
    read_manifest, Config, ContentId, ExtractingMounter, LifecycleOrchestrator,
    NamespaceAllocator, OperationOutcome, PackageSource, StateFile, StepTimeouts,
    ValidationPolicy,
};

/// Orchestrator wired to the user's config, with previously mounted
/// packages adopted from the state file
pub struct Session {
    pub config: Config,
    pub orchestrator: LifecycleOrchestrator,
    state_path: PathBuf,
}

impl Session {
    pub async fn open() -> Result<Self> {
        let config = Config::load()?;
        let allocator = NamespaceAllocator::new(&config.namespace.root)?;
        let policy = ValidationPolicy::from_config(&config.validation)?;
        let mounter = ExtractingMounter::new(config.mount_root()?);

        let orchestrator = LifecycleOrchestrator::builder(allocator, Arc::new(mounter))
            .policy(policy)
            .timeouts(StepTimeouts::from_config(&config.timeouts))
            .build();

        let state_path = config.state_file()?;
        if let Some(state) = StateFile::load_from(&state_path)? {
            if state.metadata.namespace_root != orchestrator.allocator().root() {
                tracing::warn!(
                    recorded = %state.metadata.namespace_root,
                    configured = %orchestrator.allocator().root(),
                    "Namespace root changed since the state file was written"
                );
            }
            orchestrator
                .adopt(state.mounts)
                .await
                .with_context(|| format!("Failed to restore {}", state_path.display()))?;
        }

        Ok(Self {
            config,
            orchestrator,
            state_path,
        })
    }

    /// Persist the current mount table, disabled packages included
    pub fn save(&self) -> Result<()> {
        let state = StateFile::new(
            self.orchestrator.allocator().root(),
            self.orchestrator.list_all(),
        );
        state
            .save_to(&self.state_path)
            .with_context(|| format!("Failed to write {}", self.state_path.display()))?;
        Ok(())
    }
}

/// Build a package source for an archive on disk
///
/// Without an explicit id, the archive's manifest or file name supplies it.
pub fn package_source(
    archive: &Path,
    id: Option<String>,
    checksum: Option<String>,
) -> Result<PackageSource> {
    let content_id = match id {
        Some(id) => ContentId::from(id),
        None => {
            let manifest = read_manifest(archive)?;
            content_id_for(archive, &manifest).ok_or_else(|| {
                anyhow::anyhow!(
                    "Cannot tell which content '{}' belongs to\n\nPass it explicitly with --id",
                    archive.display()
                )
            })?
        }
    };

    let mut source = PackageSource::new(content_id, archive);
    if let Some(checksum) = checksum {
        source = source.with_checksum(checksum);
    }
    Ok(source)
}

pub fn spinner(message: String) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
    );
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    spinner.set_message(message);
    spinner
}

/// Print an operation outcome; failures become the command's error
pub fn report(
    spinner: ProgressBar,
    id: &ContentId,
    done: &str,
    outcome: OperationOutcome,
) -> Result<()> {
    // Spinners are hidden when stdout is not a terminal; the result line is not
    spinner.finish_and_clear();

    match outcome {
        OperationOutcome::Succeeded { state, warnings } => {
            println!("✓ {} {} ({})", done, id, state);
            for warning in &warnings {
                println!("  ⚠ {}", warning);
            }
            Ok(())
        }
        OperationOutcome::Cancelled => {
            println!("✗ Operation on {} was cancelled", id);
            Ok(())
        }
        OperationOutcome::Failed(e) => anyhow::bail!("Operation on '{}' failed: {}", id, e),
    }
}
