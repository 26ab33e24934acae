use anyhow::Result;
use std::path::PathBuf;
use ugcmount::{validate, Config, ValidationPolicy};

use super::package_source;

pub fn run(archive: PathBuf, id: Option<String>, checksum: Option<String>) -> Result<()> {
    let config = Config::load()?;
    let policy = ValidationPolicy::from_config(&config.validation)?;
    let source = package_source(&archive, id, checksum)?;

    println!("Validating {}...", archive.display());
    let validated = validate(&source, &policy)?;
    let manifest = &validated.manifest;

    println!("✓ Archive is valid");
    println!();
    println!("  Content id:     {}", source.content_id);
    if let Some(name) = &manifest.friendly_name {
        println!("  Name:           {}", name);
    }
    if let Some(author) = &manifest.author {
        println!("  Author:         {}", author);
    }
    println!("  Version:        {}", manifest.version);
    println!("  Format version: {}", manifest.format_version);
    if let Some(engine) = &manifest.engine_version {
        println!("  Engine:         {}", engine);
    }
    if !manifest.platforms.is_empty() {
        println!("  Platforms:      {}", manifest.platforms.join(", "));
    }
    println!("  Checksum:       sha256:{}", validated.checksum);
    println!("  Assets ({}):", validated.assets.len());
    for asset in &validated.assets {
        println!("    - {}", asset);
    }

    Ok(())
}
