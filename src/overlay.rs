//! Overlay rendering: blank out recognized text regions on a copy of the image.
//!
//! Text layout is left to whatever displays the result; this step only
//! produces the translated payload with each block's box filled so the
//! source text no longer shows through.

use std::io::Cursor;

use async_trait::async_trait;
use image::{DynamicImage, Rgba, RgbaImage};
use thiserror::Error;

use crate::ocr::TextBlock;
use crate::payload::{ImagePayload, PayloadError};

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("bad payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("render task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Draws text blocks over an image.
#[async_trait]
pub trait Overlay: Send + Sync {
    async fn render(
        &self,
        original: &ImagePayload,
        blocks: &[TextBlock],
    ) -> Result<ImagePayload, OverlayError>;
}

/// Fills each block's bounding box with a solid colour.
#[derive(Debug, Clone, Copy)]
pub struct BoxOverlay {
    fill: Rgba<u8>,
}

impl BoxOverlay {
    #[must_use]
    pub fn new(fill: Rgba<u8>) -> Self {
        Self { fill }
    }
}

impl Default for BoxOverlay {
    fn default() -> Self {
        Self::new(Rgba([255, 255, 255, 255]))
    }
}

#[async_trait]
impl Overlay for BoxOverlay {
    async fn render(
        &self,
        original: &ImagePayload,
        blocks: &[TextBlock],
    ) -> Result<ImagePayload, OverlayError> {
        let bytes = original.to_bytes()?;
        let blocks = blocks.to_vec();
        let fill = self.fill;

        tokio::task::spawn_blocking(move || -> Result<ImagePayload, OverlayError> {
            let mut canvas = image::load_from_memory(&bytes)?.to_rgba8();
            for block in &blocks {
                fill_block(&mut canvas, block, fill);
            }
            let mut png = Vec::new();
            DynamicImage::ImageRgba8(canvas)
                .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
            Ok(ImagePayload::png(&png))
        })
        .await?
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn fill_block(canvas: &mut RgbaImage, block: &TextBlock, fill: Rgba<u8>) {
    let (width, height) = canvas.dimensions();
    let clamp = |v: f64, max: u32| v.round().clamp(0.0, f64::from(max)) as u32;

    let b = &block.bbox;
    let (x0, x1) = (clamp(b.x0.min(b.x1), width), clamp(b.x0.max(b.x1), width));
    let (y0, y1) = (clamp(b.y0.min(b.y1), height), clamp(b.y0.max(b.y1), height));

    for y in y0..y1 {
        for x in x0..x1 {
            canvas.put_pixel(x, y, fill);
        }
    }
}
