use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;

use pageocr::fetch::is_hostile_asset;
use pageocr::{CrossOriginFetcher, ImagePayload};

pub async fn cmd_fetch(url: &str, referer: Option<&str>, out: Option<PathBuf>) -> Result<()> {
    let fetcher = CrossOriginFetcher::new()?;

    println!("🌐 Fetching: {url}");
    let start = Instant::now();
    let bytes = if is_hostile_asset(url) {
        fetcher.fetch_with_fallback(url, referer).await?
    } else {
        fetcher.fetch(url, referer).await?
    };
    let elapsed = start.elapsed();

    let mime = ImagePayload::sniffed(&bytes).mime().to_string();
    println!("📦 {} bytes ({mime}) in {:.0}ms", bytes.len(), elapsed.as_secs_f64() * 1000.0);

    if let Some(path) = out {
        tokio::fs::write(&path, &bytes).await?;
        println!("💾 Saved to {}", path.display());
    }
    Ok(())
}
