use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use pageocr::{
    Background, BoxOverlay, CrossOriginFetcher, HtmlPage, ImageAcquirer, ImageElement, OcrClient,
    Page, ProtocolRouter, RasterDecoder, RelayHost, Session, SessionDeps, SettingsStore,
};

use super::effective_settings;

pub async fn cmd_run(
    url: &str,
    lang: Option<String>,
    out: &Path,
    endpoint: Option<String>,
) -> Result<()> {
    let settings = effective_settings(lang, endpoint)?;
    let store = SettingsStore::new(settings.clone());

    let relay = Arc::new(
        RelayHost::new(Arc::new(RasterDecoder)).with_decode_timeout(settings.decode_timeout()),
    );
    let bridge = Arc::new(Background::new(CrossOriginFetcher::new()?, relay)).spawn();
    let deps = SessionDeps {
        acquirer: Arc::new(ImageAcquirer::new(Arc::new(bridge))),
        ocr: Arc::new(OcrClient::new(&settings.endpoint)?),
        overlay: Arc::new(BoxOverlay::default()),
        settings: store.subscribe(),
    };

    println!("🌐 Loading: {url}");
    println!("🈂️  Target language: {}", settings.target_lang);
    let start = Instant::now();
    let page = HtmlPage::fetch(url, reqwest::Client::new()).await?;
    println!("🖼️  {} images on page", page.html_images().len());

    let session = Session::start(Arc::clone(&page) as Arc<dyn Page>, deps, &ProtocolRouter::new()).await;
    session.wait_idle().await;
    let stats = session.stats();

    tokio::fs::create_dir_all(out)
        .await
        .with_context(|| format!("creating {}", out.display()))?;
    let mut saved = 0;
    for (index, image) in page.html_images().iter().enumerate() {
        let Some(annotation) = image.annotation() else {
            continue;
        };
        let path = out.join(format!("image-{index:03}.png"));
        tokio::fs::write(&path, annotation.translated.to_bytes()?).await?;
        println!("💾 {}", path.display());
        saved += 1;
    }

    println!(
        "\n✅ {} qualified, {} processed, {} failed, {saved} overlays saved ({:.1}s)",
        stats.observed,
        stats.processed,
        stats.failed,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
