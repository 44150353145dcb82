pub mod config;
pub mod fetch;
pub mod health;
pub mod run;

use anyhow::Result;
use pageocr::Settings;

/// Settings from the config file with command-line overrides applied.
pub fn effective_settings(lang: Option<String>, endpoint: Option<String>) -> Result<Settings> {
    let mut settings = Settings::load()?;
    if let Some(lang) = lang {
        settings.target_lang = lang;
    }
    if let Some(endpoint) = endpoint {
        settings.endpoint = endpoint;
    }
    Ok(settings)
}
