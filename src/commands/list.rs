use anyhow::Result;

use super::Session;

pub async fn run(show_assets: bool) -> Result<()> {
    let session = Session::open().await?;
    let records = session.orchestrator.list_all();

    if records.is_empty() {
        println!("No content mounted.");
        println!();
        println!("Mount an archive with: ugcmount install <archive>");
        return Ok(());
    }

    println!("Mounted content:");
    for record in &records {
        if !record.enabled {
            println!(
                "  {} v{} at {} (disabled)",
                record.content_id, record.origin.version, record.mount_path
            );
            continue;
        }
        println!(
            "  {} v{} at {} ({} asset{}, since {})",
            record.content_id,
            record.origin.version,
            record.mount_path,
            record.assets.len(),
            if record.assets.len() == 1 { "" } else { "s" },
            record.mounted_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if show_assets {
            for asset in &record.assets {
                println!("    - {}", asset);
            }
        }
    }
    println!();

    let snapshot = session.orchestrator.index().snapshot();
    let disabled = records.iter().filter(|r| !r.enabled).count();
    print!(
        "Total: {} package{}, {} indexed asset{}",
        records.len(),
        if records.len() == 1 { "" } else { "s" },
        snapshot.len(),
        if snapshot.len() == 1 { "" } else { "s" }
    );
    if disabled > 0 {
        print!(", {} disabled", disabled);
    }
    println!();

    Ok(())
}
