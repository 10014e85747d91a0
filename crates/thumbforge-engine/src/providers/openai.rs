use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use thumbforge_contracts::config::Settings;

use super::{
    AttemptError, AttemptRequest, AttemptResult, AttemptSuccess, ImagePayload, ImageProvider,
};
use crate::http::{http_client, jpeg_bytes_for_path, map_object, response_json_or_error};
use crate::vision::VisionAnalyzer;

const MAX_PROMPT_CHARS: usize = 4000;
const IMAGE_SIZE: &str = "1792x1024";
const LAYOUT_MAX_OUTPUT_TOKENS: u64 = 800;

const LAYOUT_INSTRUCTION: &str = "Analyze this YouTube thumbnail in extreme detail:
1. Overall layout and composition (where each element sits in the frame)
2. Text elements: exact wording, font style, size, color and position
3. People or faces: position, size, expression and framing
4. Background: colors, gradients, textures and scenery
5. Graphic elements: arrows, shapes, icons, borders and effects
6. Color scheme and contrast
7. Overall aesthetic and design style
Be extremely specific about spatial positions and visual hierarchy.";

pub struct OpenAiProvider {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
    vision: Option<Arc<dyn VisionAnalyzer>>,
}

impl OpenAiProvider {
    pub fn from_settings(settings: &Settings, vision: Option<Arc<dyn VisionAnalyzer>>) -> Self {
        Self {
            api_base: settings.api_base("OPENAI_API_BASE", "https://api.openai.com/v1"),
            api_key: settings.get("OPENAI_API_KEY"),
            http: http_client(settings.request_timeout()),
            vision,
        }
    }

    fn extract_image(response_payload: &Value) -> Option<ImagePayload> {
        let first = response_payload
            .get("data")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())?;
        if let Some(b64) = first
            .get("b64_json")
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
        {
            return Some(ImagePayload::Base64 {
                data: b64.to_string(),
                mime_type: Some("image/png".to_string()),
            });
        }
        first
            .get("url")
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
            .map(|url| ImagePayload::Url(url.to_string()))
    }
}

/// Prompt that asks the image model to rebuild the reference layout with
/// only the requested changes applied.
pub fn layout_preserving_prompt(layout: &str, changes: &str) -> String {
    format!(
        "Create a YouTube thumbnail (16:9, 1792x1024) by RECREATING this exact layout with modifications:\n\n\
ORIGINAL DESIGN TO REPLICATE:\n{layout}\n\n\
SPECIFIC CHANGES TO MAKE:\n{changes}\n\n\
CRITICAL INSTRUCTIONS:\n\
- KEEP the exact same layout structure, element positions and composition\n\
- KEEP the same visual hierarchy and proportions\n\
- ONLY change the elements specifically mentioned above\n\
- Maintain the same professional thumbnail quality\n\
- NO podcast microphones, headphones or podcast studio setups",
        layout = layout.trim(),
        changes = changes.trim(),
    )
}

impl ImageProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn missing_configuration(&self) -> Option<String> {
        self.api_key
            .is_none()
            .then(|| "OPENAI_API_KEY not set".to_string())
    }

    fn prepare_prompt(&self, prompt: &str, reference: Option<&Path>) -> anyhow::Result<Option<String>> {
        let (Some(reference), Some(vision)) = (reference, self.vision.as_ref()) else {
            return Ok(None);
        };
        let bytes = jpeg_bytes_for_path(reference)?;
        let layout = vision
            .analyze(&bytes, "image/jpeg", LAYOUT_INSTRUCTION, LAYOUT_MAX_OUTPUT_TOKENS)
            .context("reference layout analysis failed")?;
        if layout.trim().is_empty() {
            bail!("reference layout analysis returned no text");
        }
        Ok(Some(layout_preserving_prompt(&layout, prompt)))
    }

    fn attempt(&self, request: &AttemptRequest<'_>) -> AttemptResult {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(AttemptError::Unavailable("OPENAI_API_KEY not set".to_string()));
        };
        let endpoint = format!("{}/images/generations", self.api_base);
        let prompt: String = request.prompt.chars().take(MAX_PROMPT_CHARS).collect();
        let payload = json!({
            "model": request.candidate.model,
            "prompt": prompt,
            "size": IMAGE_SIZE,
            "quality": "standard",
            "n": 1,
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("OpenAI images request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("OpenAI", response)?;
        let image = Self::extract_image(&response_payload)
            .ok_or_else(|| AttemptError::Malformed("OpenAI returned no image data".to_string()))?;

        let revised_prompt = response_payload
            .get("data")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("revised_prompt"))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(AttemptSuccess {
            payload: image,
            provider_response: map_object(json!({
                "endpoint": endpoint,
                "model": request.candidate.model,
                "size": IMAGE_SIZE,
                "prompt_chars": prompt.chars().count(),
                "revised_prompt": revised_prompt,
            })),
        })
    }
}
