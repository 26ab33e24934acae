use anyhow::Result;
use std::path::PathBuf;

use super::{package_source, report, spinner, Session};

pub async fn run(archive: PathBuf, id: Option<String>, checksum: Option<String>) -> Result<()> {
    let source = package_source(&archive, id, checksum)?;
    let content_id = source.content_id.clone();

    let session = Session::open().await?;
    let previous = session.orchestrator.lookup(&content_id).map(|r| r.origin.version);

    let progress = spinner(format!("Updating {}...", content_id));
    let outcome = session.orchestrator.update(source).await;
    session.save()?;
    report(progress, &content_id, "Updated", outcome)?;

    if let (Some(from), Some(record)) = (previous, session.orchestrator.lookup(&content_id)) {
        println!("  Version: {} → {}", from, record.origin.version);
        println!("  Assets:  {}", record.assets.len());
    }
    Ok(())
}
