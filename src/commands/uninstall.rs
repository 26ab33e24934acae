use anyhow::Result;
use ugcmount::ContentId;

use super::{report, spinner, Session};

pub async fn run(id: String) -> Result<()> {
    let content_id = ContentId::from(id);
    let session = Session::open().await?;

    let progress = spinner(format!("Uninstalling {}...", content_id));
    let outcome = session.orchestrator.uninstall(&content_id).await;
    session.save()?;
    report(progress, &content_id, "Uninstalled", outcome)
}
