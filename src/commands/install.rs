use anyhow::Result;
use std::path::PathBuf;

use super::{package_source, report, spinner, Session};

pub async fn run(archive: PathBuf, id: Option<String>, checksum: Option<String>) -> Result<()> {
    let source = package_source(&archive, id, checksum)?;
    let content_id = source.content_id.clone();

    let session = Session::open().await?;

    let progress = spinner(format!("Installing {}...", content_id));
    let outcome = session.orchestrator.install(source).await;
    session.save()?;
    report(progress, &content_id, "Installed", outcome)?;

    if let Some(record) = session.orchestrator.lookup(&content_id) {
        println!("  Mount path: {}", record.mount_path);
        println!("  Version:    {}", record.origin.version);
        println!("  Assets:     {}", record.assets.len());
    }
    Ok(())
}
