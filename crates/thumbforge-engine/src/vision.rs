use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use thumbforge_contracts::config::Settings;

use crate::http::{http_client, response_json_or_error};

pub const DEFAULT_VISION_MODEL: &str = "gpt-4o";

/// Describes an image in response to a free-form instruction.
pub trait VisionAnalyzer: Send + Sync {
    fn name(&self) -> &str;
    fn analyze(
        &self,
        image: &[u8],
        mime_type: &str,
        instruction: &str,
        max_output_tokens: u64,
    ) -> Result<String>;
}

/// OpenAI Responses API with an `input_image` data URL.
pub struct OpenAiVision {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http: HttpClient,
}

impl OpenAiVision {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            api_base: settings.api_base("OPENAI_API_BASE", "https://api.openai.com/v1"),
            api_key: settings.get("OPENAI_API_KEY"),
            model: settings
                .get("THUMBFORGE_VISION_MODEL")
                .unwrap_or_else(|| DEFAULT_VISION_MODEL.to_string()),
            http: http_client(settings.request_timeout()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl VisionAnalyzer for OpenAiVision {
    fn name(&self) -> &str {
        "openai"
    }

    fn analyze(
        &self,
        image: &[u8],
        mime_type: &str,
        instruction: &str,
        max_output_tokens: u64,
    ) -> Result<String> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("OPENAI_API_KEY not set");
        };
        let endpoint = format!("{}/responses", self.api_base);
        let data_url = format!("data:{mime_type};base64,{}", BASE64.encode(image));
        let payload = json!({
            "model": self.model,
            "input": [{
                "role": "user",
                "content": [
                    {"type": "input_text", "text": instruction},
                    {"type": "input_image", "image_url": data_url, "detail": "high"},
                ],
            }],
            "max_output_tokens": max_output_tokens,
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("OpenAI vision request failed ({endpoint})"))?;
        let parsed = response_json_or_error("OpenAI vision", response)?;
        let text = extract_openai_output_text(&parsed);
        if text.is_empty() {
            bail!("OpenAI vision returned no text output");
        }
        Ok(text)
    }
}

pub fn extract_openai_output_text(response: &Value) -> String {
    if let Some(text) = response.get("output_text").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return text.trim().to_string();
        }
    }

    let mut parts: Vec<String> = Vec::new();
    let rows = response
        .get("output")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for row in rows {
        let Some(obj) = row.as_object() else {
            continue;
        };
        if let Some(kind) = obj.get("type").and_then(Value::as_str) {
            if matches!(kind, "output_text" | "text") {
                if let Some(text) = obj.get("text").and_then(Value::as_str) {
                    if !text.trim().is_empty() {
                        parts.push(text.trim().to_string());
                    }
                }
                continue;
            }
            if kind != "message" {
                continue;
            }
        }
        let content = obj
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for chunk in content {
            let kind = chunk.get("type").and_then(Value::as_str).unwrap_or_default();
            if !matches!(kind, "output_text" | "text") {
                continue;
            }
            if let Some(text) = chunk.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    parts.push(text.trim().to_string());
                }
            }
        }
    }

    parts.join("\n").trim().to_string()
}
