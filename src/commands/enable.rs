use anyhow::Result;
use ugcmount::ContentId;

use super::{report, spinner, Session};

/// Enable or disable a recorded package
pub async fn run(id: String, enable: bool) -> Result<()> {
    let content_id = ContentId::from(id);
    let session = Session::open().await?;

    let (progress, outcome, done) = if enable {
        let progress = spinner(format!("Enabling {}...", content_id));
        (progress, session.orchestrator.enable(&content_id).await, "Enabled")
    } else {
        let progress = spinner(format!("Disabling {}...", content_id));
        (progress, session.orchestrator.disable(&content_id).await, "Disabled")
    };

    session.save()?;
    report(progress, &content_id, done, outcome)
}
