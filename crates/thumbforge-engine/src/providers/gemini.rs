use anyhow::Context;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use thumbforge_contracts::config::Settings;

use super::{
    AttemptError, AttemptRequest, AttemptResult, AttemptSuccess, ImagePayload, ImageProvider,
};
use crate::http::{http_client, jpeg_base64_for_path, map_object, response_json_or_error, truncate_text};

pub struct GeminiProvider {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            api_base: settings.api_base(
                "GEMINI_API_BASE",
                "https://generativelanguage.googleapis.com/v1beta",
            ),
            api_key: settings.first(&["GOOGLE_API_KEY", "GEMINI_API_KEY"]),
            http: http_client(settings.request_timeout()),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_parts(request: &AttemptRequest<'_>) -> anyhow::Result<Vec<Value>> {
        let Some(reference) = request.reference else {
            return Ok(vec![json!({ "text": request.prompt })]);
        };
        Ok(vec![
            json!({
                "inline_data": {
                    "mime_type": "image/jpeg",
                    "data": jpeg_base64_for_path(reference)?,
                }
            }),
            json!({ "text": format!("Edit this image to: {}", request.prompt) }),
        ])
    }

    fn extract_image(response_payload: &Value) -> Option<ImagePayload> {
        let candidates = response_payload.get("candidates").and_then(Value::as_array)?;
        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array);
            for part in parts.into_iter().flatten() {
                let Some(inline) = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                else {
                    continue;
                };
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                let mime_type = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                return Some(ImagePayload::Base64 {
                    data: data.to_string(),
                    mime_type,
                });
            }
        }
        None
    }

    fn reply_text(response_payload: &Value) -> String {
        let mut texts = Vec::new();
        for candidate in response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            for part in candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    texts.push(text.trim().to_string());
                }
            }
        }
        texts.join(" ")
    }
}

impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn missing_configuration(&self) -> Option<String> {
        self.api_key
            .is_none()
            .then(|| "GOOGLE_API_KEY or GEMINI_API_KEY not set".to_string())
    }

    fn attempt(&self, request: &AttemptRequest<'_>) -> AttemptResult {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(AttemptError::Unavailable(
                "GOOGLE_API_KEY or GEMINI_API_KEY not set".to_string(),
            ));
        };
        let endpoint = self.endpoint_for_model(&request.candidate.model);
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": Self::build_parts(request)?,
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
            },
        });

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Gemini", response)?;
        let Some(image) = Self::extract_image(&response_payload) else {
            let text = Self::reply_text(&response_payload);
            return Err(AttemptError::Malformed(if text.is_empty() {
                "Gemini returned no image".to_string()
            } else {
                format!("Gemini returned no image: {}", truncate_text(&text, 200))
            }));
        };

        Ok(AttemptSuccess {
            payload: image,
            provider_response: map_object(json!({
                "endpoint": endpoint,
                "model": request.candidate.model,
                "candidates": response_payload
                    .get("candidates")
                    .and_then(Value::as_array)
                    .map(|rows| rows.len())
                    .unwrap_or(0),
                "usage_metadata": response_payload.get("usageMetadata").cloned().unwrap_or(Value::Null),
            })),
        })
    }
}
