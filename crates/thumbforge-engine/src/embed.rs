use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thumbforge_contracts::config::Settings;

use crate::http::{decode_image, http_client, jpeg_bytes_for_path, response_json_or_error};

pub const DEFAULT_JINA_MODEL: &str = "jina-clip-v2";
pub const DRYRUN_EMBEDDING_MODEL: &str = "dryrun-sha256";
pub const DRYRUN_DIMENSION: usize = 64;

/// Maps images and text into one vector space.
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;
    fn embed_image(&self, path: &Path) -> Result<Vec<f32>>;
    fn embed_text(&self, text: &str) -> Result<Vec<f32>>;
}

impl<E: Embedder + ?Sized> Embedder for Box<E> {
    fn model(&self) -> &str {
        (**self).model()
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>> {
        (**self).embed_image(path)
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed_text(text)
    }
}

pub struct JinaClipEmbedder {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http: HttpClient,
}

impl JinaClipEmbedder {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            api_base: settings.api_base("JINA_API_BASE", "https://api.jina.ai/v1"),
            api_key: settings.get("JINA_API_KEY"),
            model: settings
                .get("THUMBFORGE_EMBEDDING_MODEL")
                .unwrap_or_else(|| DEFAULT_JINA_MODEL.to_string()),
            http: http_client(settings.request_timeout()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn embeddings_endpoint(&self) -> String {
        format!("{}/embeddings", self.api_base)
    }

    fn request_embedding(&self, input: Value) -> Result<Vec<f32>> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("JINA_API_KEY not set");
        };
        let payload = json!({
            "model": self.model,
            "input": [input],
        });
        let response = self
            .http
            .post(self.embeddings_endpoint())
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("Jina request failed ({})", self.embeddings_endpoint()))?;
        let parsed = response_json_or_error("Jina", response)?;
        extract_embedding(&parsed)
    }
}

impl Embedder for JinaClipEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>> {
        // Undecodable files must fail here so `build` skips them.
        let encoded = BASE64.encode(jpeg_bytes_for_path(path)?);
        self.request_embedding(json!({ "image": encoded }))
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.request_embedding(json!({ "text": text }))
    }
}

fn extract_embedding(payload: &Value) -> Result<Vec<f32>> {
    let rows = payload
        .get("data")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|row| row.get("embedding"))
        .and_then(Value::as_array)
        .context("embedding response has no data[0].embedding")?;
    let mut out = Vec::with_capacity(rows.len());
    for value in rows {
        let Some(number) = value.as_f64() else {
            bail!("embedding contains a non-numeric value");
        };
        out.push(number as f32);
    }
    if out.is_empty() {
        bail!("embedding response was empty");
    }
    Ok(out)
}

/// Offline embedder: sha256-seeded unit vectors. Images must still decode so
/// unreadable files behave as they would against a real model.
#[derive(Debug, Clone)]
pub struct DryrunEmbedder {
    dimension: usize,
}

impl DryrunEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl Default for DryrunEmbedder {
    fn default() -> Self {
        Self::new(DRYRUN_DIMENSION)
    }
}

impl Embedder for DryrunEmbedder {
    fn model(&self) -> &str {
        DRYRUN_EMBEDDING_MODEL
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>> {
        let decoded = decode_image(path)?;
        Ok(seeded_vector(decoded.to_rgb8().as_raw(), self.dimension))
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        Ok(seeded_vector(text.as_bytes(), self.dimension))
    }
}

fn seeded_vector(seed: &[u8], dimension: usize) -> Vec<f32> {
    let mut values = Vec::with_capacity(dimension);
    let mut block: u64 = 0;
    while values.len() < dimension {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(block.to_be_bytes());
        for byte in hasher.finalize() {
            if values.len() == dimension {
                break;
            }
            values.push(f32::from(byte) / 127.5 - 1.0);
        }
        block += 1;
    }
    l2_normalize(values)
}

pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Cosine similarity clamped to [-1, 1]; zero-norm or mismatched inputs
/// score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        0.0
    } else {
        (dot_product / (magnitude_a * magnitude_b)).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};
    use thumbforge_contracts::config::Settings;

    use super::*;

    #[test]
    fn cosine_handles_orthogonal_parallel_and_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert!((cosine_similarity(&[2.0, 0.0], &[5.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 1.0], &[-1.0, -1.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn dryrun_vectors_are_deterministic_unit_length() -> anyhow::Result<()> {
        let embedder = DryrunEmbedder::new(40);
        let first = embedder.embed_text("thumbnail about rust")?;
        let second = embedder.embed_text("thumbnail about rust")?;
        let other = embedder.embed_text("thumbnail about cooking")?;
        assert_eq!(first.len(), 40);
        assert_eq!(first, second);
        assert_ne!(first, other);
        let norm: f32 = first.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn dryrun_rejects_undecodable_images() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let good = temp.path().join("good.png");
        let bad = temp.path().join("bad.jpg");
        RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])).save(&good)?;
        std::fs::write(&bad, b"not an image")?;

        let embedder = DryrunEmbedder::default();
        assert_eq!(embedder.embed_image(&good)?.len(), DRYRUN_DIMENSION);
        assert!(embedder.embed_image(&bad).is_err());
        Ok(())
    }

    #[test]
    fn jina_embedder_posts_text_and_parses_vector() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/embeddings")
            .match_header("authorization", "Bearer jina-test")
            .match_body(mockito::Matcher::PartialJson(json!({
                "model": "jina-clip-v2",
                "input": [{"text": "thumbnail about rust"}]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"embedding":[0.5,-0.25,1.0]}]}"#)
            .create();

        let settings = Settings::isolated([
            ("JINA_API_KEY", "jina-test".to_string()),
            ("JINA_API_BASE", server.url()),
        ]);
        let embedder = JinaClipEmbedder::from_settings(&settings);
        let vector = embedder.embed_text("thumbnail about rust")?;
        assert_eq!(vector, vec![0.5, -0.25, 1.0]);
        mock.assert();
        Ok(())
    }

    #[test]
    fn jina_embedder_rejects_undecodable_image_before_sending() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let bad = temp.path().join("bad.jpg");
        std::fs::write(&bad, b"not an image")?;

        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/embeddings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"embedding":[0.1,0.2]}]}"#)
            .expect(0)
            .create();

        let settings = Settings::isolated([
            ("JINA_API_KEY", "jina-test".to_string()),
            ("JINA_API_BASE", server.url()),
        ]);
        let embedder = JinaClipEmbedder::from_settings(&settings);
        assert!(embedder.embed_image(&bad).is_err());
        mock.assert();
        Ok(())
    }

    #[test]
    fn jina_embedder_sends_decodable_image_as_jpeg() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let good = temp.path().join("good.png");
        RgbImage::from_pixel(4, 4, Rgb([9, 9, 9])).save(&good)?;
        let expected = BASE64.encode(jpeg_bytes_for_path(&good)?);

        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/embeddings")
            .match_body(mockito::Matcher::PartialJson(json!({
                "input": [{"image": expected}]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"embedding":[0.1,0.2]}]}"#)
            .create();

        let settings = Settings::isolated([
            ("JINA_API_KEY", "jina-test".to_string()),
            ("JINA_API_BASE", server.url()),
        ]);
        let embedder = JinaClipEmbedder::from_settings(&settings);
        assert_eq!(embedder.embed_image(&good)?, vec![0.1, 0.2]);
        mock.assert();
        Ok(())
    }

    #[test]
    fn jina_embedder_requires_key() {
        let embedder = JinaClipEmbedder::from_settings(&Settings::isolated(
            Vec::<(String, String)>::new(),
        ));
        assert!(!embedder.is_configured());
        let err = embedder.embed_text("x").err().map(|err| err.to_string());
        assert_eq!(err.as_deref(), Some("JINA_API_KEY not set"));
    }
}
