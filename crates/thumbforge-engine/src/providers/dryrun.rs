use std::io::Cursor;

use anyhow::Context;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::json;
use sha2::{Digest, Sha256};

use super::{AttemptRequest, AttemptResult, AttemptSuccess, ImagePayload, ImageProvider};
use crate::http::map_object;

const DRYRUN_WIDTH: u32 = 1280;
const DRYRUN_HEIGHT: u32 = 720;

/// Offline provider: a solid 16:9 PNG whose color is derived from the prompt.
#[derive(Debug, Clone, Default)]
pub struct DryrunProvider;

impl DryrunProvider {
    pub fn new() -> Self {
        Self
    }
}

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn missing_configuration(&self) -> Option<String> {
        None
    }

    fn attempt(&self, request: &AttemptRequest<'_>) -> AttemptResult {
        let seed = u64::from(request.reference.is_some());
        let bytes = render_dryrun_png(DRYRUN_WIDTH, DRYRUN_HEIGHT, request.prompt, seed)?;
        Ok(AttemptSuccess {
            payload: ImagePayload::Bytes {
                bytes,
                mime_type: Some("image/png".to_string()),
            },
            provider_response: map_object(json!({
                "status": "ok",
                "model": request.candidate.model,
                "width": DRYRUN_WIDTH,
                "height": DRYRUN_HEIGHT,
                "with_reference": request.reference.is_some(),
            })),
        })
    }
}

fn render_dryrun_png(width: u32, height: u32, prompt: &str, seed: u64) -> anyhow::Result<Vec<u8>> {
    let (r, g, b) = color_from_prompt(prompt, seed);
    let image = RgbImage::from_pixel(width, height, Rgb([r, g, b]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .context("failed to encode dryrun image")?;
    Ok(out.into_inner())
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
