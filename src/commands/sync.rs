use anyhow::Result;
use std::path::PathBuf;

use super::{spinner, Session};

pub async fn run(dir: Option<PathBuf>) -> Result<()> {
    let session = Session::open().await?;

    let dir = match dir.or_else(|| session.config.sideload.directory.clone()) {
        Some(dir) => dir,
        None => anyhow::bail!(
            "No side-load directory given\n\n\
             Pass one with --dir or set it with: ugcmount config set sideload.directory <path>"
        ),
    };

    let progress = spinner(format!("Syncing {}...", dir.display()));
    let result = ugcmount::refresh(&session.orchestrator, &dir).await;
    session.save()?;
    progress.finish_and_clear();
    let report = result?;

    if report.is_noop() {
        println!("✓ {} is up to date", dir.display());
        return Ok(());
    }

    for id in &report.installed {
        println!("  + {}", id);
    }
    for id in &report.updated {
        println!("  ~ {}", id);
    }
    for id in &report.removed {
        println!("  - {}", id);
    }
    for warning in &report.warnings {
        println!("  ⚠ {}", warning);
    }
    for (id, reason) in &report.failed {
        println!("  ✗ {}: {}", id, reason);
    }
    println!();
    println!(
        "Installed {}, updated {}, removed {}, failed {}",
        report.installed.len(),
        report.updated.len(),
        report.removed.len(),
        report.failed.len()
    );

    if !report.failed.is_empty() {
        anyhow::bail!("{} archive(s) could not be synced", report.failed.len());
    }
    Ok(())
}
