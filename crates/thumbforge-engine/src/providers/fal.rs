use anyhow::Context;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Value};
use thumbforge_contracts::config::Settings;

use super::{
    extract_urls, poll_until, AttemptError, AttemptRequest, AttemptResult, AttemptSuccess,
    ImagePayload, ImageProvider, PollSettings, PollStatus,
};
use crate::http::{http_client, jpeg_data_url_for_path, map_object, response_json_or_error};

/// Fal queue API: submit, poll the status URL, then fetch the result.
pub struct FalProvider {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
    poll: PollSettings,
}

impl FalProvider {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            api_base: settings.api_base("FAL_API_BASE", "https://queue.fal.run"),
            api_key: settings.first(&["FAL_KEY", "FAL_API_KEY"]),
            http: http_client(settings.request_timeout()),
            poll: PollSettings::from_settings(settings),
        }
    }

    fn build_arguments(request: &AttemptRequest<'_>) -> anyhow::Result<Value> {
        let mut arguments = map_object(json!({
            "prompt": request.prompt,
            "image_size": "landscape_16_9",
            "num_inference_steps": 40,
            "guidance_scale": 3.5,
            "num_images": 1,
            "enable_safety_checker": false,
            "output_format": "png",
        }));
        if let Some(reference) = request.reference {
            arguments.insert(
                "image_url".to_string(),
                Value::String(jpeg_data_url_for_path(reference)?),
            );
            arguments.insert("strength".to_string(), json!(0.75));
        }
        Ok(Value::Object(arguments))
    }

    fn queue_url(queued: &Value, key: &str, fallback: String) -> String {
        queued
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .unwrap_or(fallback)
    }

    fn queue_status(status_payload: &Value) -> PollStatus {
        let status = status_payload
            .get("status")
            .and_then(Value::as_str)
            .map(|value| value.to_ascii_uppercase())
            .unwrap_or_default();
        match status.as_str() {
            "COMPLETED" => {
                if let Some(error) = status_payload
                    .get("error")
                    .and_then(Value::as_str)
                    .filter(|error| !error.trim().is_empty())
                {
                    return PollStatus::Failed(format!("Fal request failed: {error}"));
                }
                PollStatus::Done(status_payload.clone())
            }
            "FAILED" | "ERROR" => {
                let detail = status_payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("no detail");
                PollStatus::Failed(format!("Fal request {status}: {detail}"))
            }
            _ => PollStatus::Pending,
        }
    }
}

impl ImageProvider for FalProvider {
    fn name(&self) -> &str {
        "fal"
    }

    fn missing_configuration(&self) -> Option<String> {
        self.api_key
            .is_none()
            .then(|| "FAL_KEY (or FAL_API_KEY) not set".to_string())
    }

    fn attempt(&self, request: &AttemptRequest<'_>) -> AttemptResult {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(AttemptError::Unavailable("FAL_KEY (or FAL_API_KEY) not set".to_string()));
        };
        let auth = format!("Key {api_key}");
        let model = request.candidate.model.trim_matches('/');
        let endpoint = format!("{}/{model}", self.api_base);

        let response = self
            .http
            .post(&endpoint)
            .header(AUTHORIZATION, &auth)
            .json(&Self::build_arguments(request)?)
            .send()
            .with_context(|| format!("Fal request failed ({endpoint})"))?;
        let queued = response_json_or_error("Fal", response)?;
        let request_id = queued
            .get("request_id")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AttemptError::Malformed("Fal queue response had no request_id".to_string()))?
            .to_string();
        let status_url = Self::queue_url(
            &queued,
            "status_url",
            format!("{endpoint}/requests/{request_id}/status"),
        );
        let response_url = Self::queue_url(
            &queued,
            "response_url",
            format!("{endpoint}/requests/{request_id}"),
        );

        poll_until(self.poll, "Fal request", |_| {
            let response = self
                .http
                .get(&status_url)
                .header(AUTHORIZATION, &auth)
                .send()
                .with_context(|| format!("Fal status request failed ({status_url})"))?;
            let status_payload = response_json_or_error("Fal status", response)?;
            Ok(Self::queue_status(&status_payload))
        })?;

        let response = self
            .http
            .get(&response_url)
            .header(AUTHORIZATION, &auth)
            .send()
            .with_context(|| format!("Fal result request failed ({response_url})"))?;
        let result = response_json_or_error("Fal result", response)?;
        let mut urls = Vec::new();
        extract_urls(result.get("images").unwrap_or(&result), &mut urls);
        let url = urls
            .into_iter()
            .next()
            .ok_or_else(|| AttemptError::Malformed("Fal response returned no image URLs".to_string()))?;

        Ok(AttemptSuccess {
            payload: ImagePayload::Url(url),
            provider_response: map_object(json!({
                "endpoint": endpoint,
                "model": request.candidate.model,
                "request_id": request_id,
                "seed": result.get("seed").cloned().unwrap_or(Value::Null),
                "has_nsfw_concepts": result.get("has_nsfw_concepts").cloned().unwrap_or(Value::Null),
            })),
        })
    }
}
