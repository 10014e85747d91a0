use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageReader};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

pub fn http_client(timeout: Duration) -> HttpClient {
    HttpClient::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "falling back to default http client");
            HttpClient::new()
        })
}

pub fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

pub fn download_image(http: &HttpClient, url: &str) -> Result<ImageBytes> {
    let response = http
        .get(url)
        .send()
        .with_context(|| format!("failed downloading image ({url})"))?;
    if !response.status().is_success() {
        let code = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        bail!(
            "image download failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = response
        .bytes()
        .context("failed reading image bytes")?
        .to_vec();
    if bytes.is_empty() {
        bail!("image download returned an empty body ({url})");
    }
    Ok(ImageBytes { bytes, mime_type })
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Decodes by content, falling back to the extension when the header is not
/// recognized.
pub fn decode_image(path: &Path) -> Result<DynamicImage> {
    let reader = ImageReader::open(path)
        .with_context(|| format!("failed reading {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("failed reading {}", path.display()))?;
    reader
        .decode()
        .with_context(|| format!("failed to decode image {}", path.display()))
}

/// Decodes the image and re-encodes it as JPEG so every upstream API sees the
/// same format; unreadable files fail here rather than at the provider.
pub fn jpeg_bytes_for_path(path: &Path) -> Result<Vec<u8>> {
    let rgb = decode_image(path)?.to_rgb8();
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, 90);
    encoder
        .encode_image(&rgb)
        .with_context(|| format!("failed to encode {} as jpeg", path.display()))?;
    Ok(bytes)
}

/// Base64 of the file as JPEG; falls back to the raw bytes when the image
/// cannot be decoded locally.
pub fn jpeg_base64_for_path(path: &Path) -> Result<String> {
    match jpeg_bytes_for_path(path) {
        Ok(bytes) => Ok(BASE64.encode(bytes)),
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "sending reference bytes unmodified");
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed reading {}", path.display()))?;
            Ok(BASE64.encode(bytes))
        }
    }
}

pub fn jpeg_data_url_for_path(path: &Path) -> Result<String> {
    Ok(format!(
        "data:image/jpeg;base64,{}",
        jpeg_base64_for_path(path)?
    ))
}

pub fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use image::{Rgb, RgbImage};

    use super::*;

    #[test]
    fn error_chain_text_preserves_nested_contexts() {
        let err = anyhow::anyhow!("socket closed")
            .context("gemini request failed (https://example.test)")
            .context("candidate gemini-2.5-flash-image failed");
        let rendered = error_chain_text(&err, 400);
        assert!(rendered.contains("candidate gemini-2.5-flash-image failed"));
        assert!(rendered.contains("gemini request failed"));
        assert!(rendered.contains("socket closed"));
    }

    #[test]
    fn truncate_text_marks_cut() {
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(truncate_text("abc", 3), "abc");
    }

    #[test]
    fn mime_lookup_is_case_insensitive() {
        assert_eq!(mime_for_path(Path::new("a/B.JPEG")), Some("image/jpeg"));
        assert_eq!(mime_for_path(Path::new("a/b.gif")), None);
    }

    #[test]
    fn png_reference_is_reencoded_as_jpeg() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("ref.png");
        RgbImage::from_pixel(8, 8, Rgb([200, 10, 10])).save(&path)?;
        let bytes = jpeg_bytes_for_path(&path)?;
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert!(jpeg_data_url_for_path(&path)?.starts_with("data:image/jpeg;base64,"));
        Ok(())
    }

    #[test]
    fn download_rejects_error_status() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _ok = server
            .mock("GET", "/img.png")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_body(vec![1u8, 2, 3])
            .create();
        let _missing = server.mock("GET", "/gone.png").with_status(404).create();
        let http = HttpClient::new();

        let image = download_image(&http, &format!("{}/img.png", server.url()))?;
        assert_eq!(image.bytes, vec![1, 2, 3]);
        assert_eq!(image.mime_type.as_deref(), Some("image/png"));
        assert!(download_image(&http, &format!("{}/gone.png", server.url())).is_err());
        Ok(())
    }
}
