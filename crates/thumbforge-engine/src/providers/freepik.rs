use anyhow::Context;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use thumbforge_contracts::config::Settings;

use super::{
    poll_until, AttemptError, AttemptRequest, AttemptResult, AttemptSuccess, ImagePayload,
    ImageProvider, PollSettings, PollStatus,
};
use crate::http::{http_client, jpeg_base64_for_path, map_object, response_json_or_error, truncate_text};

const API_KEY_HEADER: &str = "x-freepik-api-key";
const NEGATIVE_PROMPT: &str =
    "blurry, low quality, distorted, ugly, bad anatomy, podcast microphone, headphones";

pub struct FreepikProvider {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
    poll: PollSettings,
}

impl FreepikProvider {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            api_base: settings.api_base("FREEPIK_API_BASE", "https://api.freepik.com"),
            api_key: settings.get("FREEPIK_API_KEY"),
            http: http_client(settings.request_timeout()),
            poll: PollSettings::from_settings(settings),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/v1/ai/{}", self.api_base, model.trim_matches('/'))
    }

    fn build_payload(request: &AttemptRequest<'_>) -> anyhow::Result<Value> {
        let model = request.candidate.model.as_str();
        let Some(reference) = request.reference else {
            return Ok(json!({
                "prompt": request.prompt,
                "negative_prompt": NEGATIVE_PROMPT,
                "guidance_scale": 7.5,
                "num_images": 1,
                "image": {"size": "landscape_16_9"},
                "styling": {"style": "photo", "color": "vibrant", "lightning": "dramatic"},
            }));
        };
        let image = jpeg_base64_for_path(reference)?;
        let prompt = reference_prompt(request.prompt);
        let mut payload = map_object(json!({ "image": image, "prompt": prompt }));
        if model == "image-variations" {
            payload.insert("num_variations".to_string(), json!(1));
        } else {
            payload.insert("num_images".to_string(), json!(1));
        }
        Ok(Value::Object(payload))
    }

    fn call_key(&self) -> Result<&str, AttemptError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| AttemptError::Unavailable("FREEPIK_API_KEY not set".to_string()))
    }
}

fn reference_prompt(prompt: &str) -> String {
    format!(
        "Modify the attached image and create a YouTube thumbnail by making these changes: {prompt}. \
Keep the same layout and composition, only change the specified elements. \
Maintain professional YouTube thumbnail quality at 16:9 aspect ratio."
    )
}

/// First image under `data`, `output` or `result`, whether that holds a list
/// or a single object.
fn extract_image(value: &Value) -> Option<ImagePayload> {
    let container = ["data", "output", "result"]
        .iter()
        .find_map(|key| value.get(*key))?;
    let info = match container {
        Value::Array(rows) => rows.first()?,
        Value::Object(_) => container,
        _ => return None,
    };
    if let Some(data) = info
        .get("base64")
        .and_then(Value::as_str)
        .filter(|data| !data.trim().is_empty())
    {
        return Some(ImagePayload::Base64 {
            data: data.to_string(),
            mime_type: None,
        });
    }
    if let Some(url) = info
        .get("url")
        .and_then(Value::as_str)
        .filter(|url| !url.trim().is_empty())
    {
        return Some(ImagePayload::Url(url.to_string()));
    }
    info.get("generated")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(Value::as_str)
        .filter(|url| url.starts_with("http"))
        .map(|url| ImagePayload::Url(url.to_string()))
}

fn job_id(value: &Value) -> Option<String> {
    let lookup = |obj: &Value| {
        ["id", "job_id", "task_id"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string)
    };
    value
        .get("data")
        .filter(|data| data.is_object())
        .and_then(lookup)
        .or_else(|| lookup(value))
}

fn job_status(value: &Value) -> PollStatus {
    let status = value
        .get("status")
        .or_else(|| value.get("data").and_then(|data| data.get("status")))
        .and_then(Value::as_str)
        .map(|status| status.to_ascii_lowercase())
        .unwrap_or_default();
    match status.as_str() {
        "completed" | "success" => PollStatus::Done(value.clone()),
        "failed" | "error" => {
            let detail = value
                .get("error")
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            PollStatus::Failed(format!("Freepik generation failed: {detail}"))
        }
        _ => PollStatus::Pending,
    }
}

impl ImageProvider for FreepikProvider {
    fn name(&self) -> &str {
        "freepik"
    }

    fn missing_configuration(&self) -> Option<String> {
        self.api_key
            .is_none()
            .then(|| "FREEPIK_API_KEY not set".to_string())
    }

    fn attempt(&self, request: &AttemptRequest<'_>) -> AttemptResult {
        let api_key = self.call_key()?;
        let model = request.candidate.model.as_str();
        if model != "text-to-image" && request.reference.is_none() {
            return Err(AttemptError::Unavailable(format!(
                "Freepik {model} requires a reference image"
            )));
        }
        let endpoint = self.endpoint(model);
        let response = self
            .http
            .post(&endpoint)
            .header(API_KEY_HEADER, api_key)
            .json(&Self::build_payload(request)?)
            .send()
            .with_context(|| format!("Freepik request failed ({endpoint})"))?;
        let submitted = response_json_or_error("Freepik", response)?;

        let (image, final_payload) = match extract_image(&submitted) {
            Some(image) => (image, submitted),
            None => {
                let id = job_id(&submitted).ok_or_else(|| {
                    AttemptError::Malformed(format!(
                        "Unexpected Freepik response: {}",
                        truncate_text(&submitted.to_string(), 300)
                    ))
                })?;
                let status_url = format!("{endpoint}/{id}");
                let done = poll_until(self.poll, "Freepik job", |_| {
                    let response = self
                        .http
                        .get(&status_url)
                        .header(API_KEY_HEADER, api_key)
                        .send()
                        .with_context(|| format!("Freepik poll request failed ({status_url})"))?;
                    let polled = response_json_or_error("Freepik poll", response)?;
                    Ok(job_status(&polled))
                })?;
                let image = extract_image(&done).ok_or_else(|| {
                    AttemptError::Malformed("Image URL not found in completed Freepik job".to_string())
                })?;
                (image, done)
            }
        };

        Ok(AttemptSuccess {
            payload: image,
            provider_response: map_object(json!({
                "endpoint": endpoint,
                "model": model,
                "job_id": job_id(&final_payload),
                "meta": final_payload.get("meta").cloned().unwrap_or(Value::Null),
            })),
        })
    }
}
