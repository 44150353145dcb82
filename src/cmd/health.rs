use anyhow::{bail, Result};

use pageocr::OcrClient;

use super::effective_settings;

pub async fn cmd_health(endpoint: Option<String>) -> Result<()> {
    let settings = effective_settings(None, endpoint)?;
    let client = OcrClient::new(&settings.endpoint)?;

    println!("🩺 Checking {}", client.endpoint());
    let status = client.health().await?;
    if !status.is_ok() {
        bail!("OCR server reported status {:?}", status.status);
    }
    println!("✅ OCR server is up");
    Ok(())
}
