use anyhow::Result;
use ugcmount::config::CONFIG_KEYS;
use ugcmount::Config;

pub fn run(action: &crate::ConfigAction) -> Result<()> {
    use crate::ConfigAction;

    match action {
        ConfigAction::Show => show_config(),
        ConfigAction::Get { key } => get_config(key),
        ConfigAction::Set { key, value } => set_config(key, value),
        ConfigAction::Path => {
            println!("{}", Config::default_path()?.display());
            Ok(())
        }
    }
}

fn show_config() -> Result<()> {
    let config = Config::load()?;
    let config_path = Config::default_path()?;

    println!("Config file: {}", config_path.display());
    println!();

    let mut section = "";
    for key in CONFIG_KEYS {
        let (head, _) = key.split_once('.').unwrap_or((key, ""));
        if head != section {
            if !section.is_empty() {
                println!();
            }
            println!("[{}]", head);
            section = head;
        }
        let value = config.get(key)?;
        if value.is_empty() {
            println!("  {:<32} (unset)", key);
        } else {
            println!("  {:<32} {}", key, value);
        }
    }
    println!();
    println!("Modify settings with: ugcmount config set <key> <value>");

    Ok(())
}

fn get_config(key: &str) -> Result<()> {
    let config = Config::load()?;
    println!("{}", config.get(key)?);
    Ok(())
}

fn set_config(key: &str, value: &str) -> Result<()> {
    let mut config = Config::load()?;
    config.set(key, value)?;
    config.save()?;

    if value.is_empty() {
        println!("✓ {} = <cleared>", key);
    } else {
        println!("✓ {} = \"{}\"", key, value);
    }
    Ok(())
}
