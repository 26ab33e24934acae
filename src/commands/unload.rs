use anyhow::Result;

use super::{spinner, Session};

pub async fn run() -> Result<()> {
    let session = Session::open().await?;

    let progress = spinner("Unloading all content...".to_string());
    let outcomes = session.orchestrator.unload_all().await;
    session.save()?;
    progress.finish_and_clear();

    if outcomes.is_empty() {
        println!("No content mounted.");
        return Ok(());
    }

    let mut failed = 0;
    for (id, outcome) in &outcomes {
        match outcome.error() {
            None => println!("  - {}", id),
            Some(e) => {
                failed += 1;
                println!("  ✗ {}: {}", id, e);
            }
        }
    }
    println!();

    if failed > 0 {
        anyhow::bail!("{} of {} package(s) could not be unloaded", failed, outcomes.len());
    }
    println!("✓ Unloaded {} package(s)", outcomes.len());
    Ok(())
}
