use anyhow::Result;

use pageocr::{config_path, Settings};

pub fn cmd_config() -> Result<()> {
    let path = config_path();
    let settings = Settings::load_from(&path)?;

    println!("📄 Config file: {}", path.display());
    if !path.exists() {
        println!("   (not found, using defaults)");
    }
    println!();
    print!("{}", toml::to_string_pretty(&settings)?);
    Ok(())
}
