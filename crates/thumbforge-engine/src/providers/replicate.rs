use anyhow::Context;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Value};
use thumbforge_contracts::config::Settings;

use super::{
    extract_urls, poll_until, AttemptError, AttemptRequest, AttemptResult, AttemptSuccess,
    ImagePayload, ImageProvider, PollSettings, PollStatus,
};
use crate::http::{http_client, jpeg_data_url_for_path, map_object, response_json_or_error, truncate_text};

pub struct ReplicateProvider {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
    poll: PollSettings,
}

impl ReplicateProvider {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            api_base: settings.api_base("REPLICATE_API_BASE", "https://api.replicate.com/v1"),
            api_key: settings.first(&["REPLICATE_API_TOKEN", "REPLICATE_API_KEY"]),
            http: http_client(settings.request_timeout()),
            poll: PollSettings::from_settings(settings),
        }
    }

    /// Pinned `owner/name:version` models go through `/predictions`; bare
    /// model names use the official-model route.
    fn submission(&self, model: &str, input: Value) -> (String, Value) {
        match model.split_once(':') {
            Some((_, version)) => (
                format!("{}/predictions", self.api_base),
                json!({ "version": version, "input": input }),
            ),
            None => (
                format!("{}/models/{}/predictions", self.api_base, model.trim_matches('/')),
                json!({ "input": input }),
            ),
        }
    }

    fn build_input(request: &AttemptRequest<'_>) -> anyhow::Result<Value> {
        let model = request.candidate.model.as_str();
        let mut input = if model.starts_with("stability-ai/sdxl") {
            map_object(json!({
                "prompt": request.prompt,
                "width": 1280,
                "height": 720,
                "num_outputs": 1,
                "num_inference_steps": 30,
                "guidance_scale": 7.5,
                "scheduler": "K_EULER",
            }))
        } else {
            map_object(json!({
                "prompt": request.prompt,
                "aspect_ratio": "16:9",
                "num_outputs": 1,
                "output_format": "png",
                "output_quality": 90,
            }))
        };
        if let Some(reference) = request.reference {
            let strength = if model.starts_with("stability-ai/sdxl") { 0.8 } else { 0.75 };
            input.insert(
                "image".to_string(),
                Value::String(jpeg_data_url_for_path(reference)?),
            );
            input.insert("prompt_strength".to_string(), json!(strength));
        }
        Ok(Value::Object(input))
    }

    fn poll_url(&self, prediction: &Value) -> Option<String> {
        if let Some(url) = prediction
            .get("urls")
            .and_then(|urls| urls.get("get"))
            .and_then(Value::as_str)
            .filter(|url| !url.trim().is_empty())
        {
            return Some(url.to_string());
        }
        prediction
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .map(|id| format!("{}/predictions/{id}", self.api_base))
    }

    fn prediction_status(prediction: &Value) -> PollStatus {
        let status = prediction
            .get("status")
            .and_then(Value::as_str)
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();
        match status.as_str() {
            "succeeded" => PollStatus::Done(prediction.clone()),
            "failed" | "canceled" => {
                let detail = prediction
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| truncate_text(&prediction.to_string(), 512));
                PollStatus::Failed(format!("Replicate prediction {status}: {detail}"))
            }
            _ => PollStatus::Pending,
        }
    }
}

impl ImageProvider for ReplicateProvider {
    fn name(&self) -> &str {
        "replicate"
    }

    fn missing_configuration(&self) -> Option<String> {
        self.api_key
            .is_none()
            .then(|| "REPLICATE_API_TOKEN not set".to_string())
    }

    fn attempt(&self, request: &AttemptRequest<'_>) -> AttemptResult {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(AttemptError::Unavailable("REPLICATE_API_TOKEN not set".to_string()));
        };
        let auth = format!("Token {api_key}");
        let (endpoint, payload) =
            self.submission(&request.candidate.model, Self::build_input(request)?);

        let response = self
            .http
            .post(&endpoint)
            .header(AUTHORIZATION, &auth)
            .json(&payload)
            .send()
            .with_context(|| format!("Replicate request failed ({endpoint})"))?;
        let created = response_json_or_error("Replicate", response)?;

        let prediction = match Self::prediction_status(&created) {
            PollStatus::Done(prediction) => prediction,
            PollStatus::Failed(message) => return Err(AttemptError::Unavailable(message)),
            PollStatus::Pending => {
                let poll_url = self.poll_url(&created).ok_or_else(|| {
                    AttemptError::Malformed("Replicate response had no prediction id".to_string())
                })?;
                poll_until(self.poll, "Replicate prediction", |_| {
                    let response = self
                        .http
                        .get(&poll_url)
                        .header(AUTHORIZATION, &auth)
                        .send()
                        .with_context(|| format!("Replicate poll request failed ({poll_url})"))?;
                    let prediction = response_json_or_error("Replicate poll", response)?;
                    Ok(Self::prediction_status(&prediction))
                })?
            }
        };

        let mut urls = Vec::new();
        extract_urls(prediction.get("output").unwrap_or(&Value::Null), &mut urls);
        let url = urls.into_iter().next().ok_or_else(|| {
            AttemptError::Malformed("Replicate prediction returned no image URL".to_string())
        })?;

        Ok(AttemptSuccess {
            payload: ImagePayload::Url(url),
            provider_response: map_object(json!({
                "endpoint": endpoint,
                "model": request.candidate.model,
                "prediction_id": prediction.get("id").cloned().unwrap_or(Value::Null),
                "status": prediction.get("status").cloned().unwrap_or(Value::Null),
                "metrics": prediction.get("metrics").cloned().unwrap_or(Value::Null),
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use image::{Rgb, RgbImage};
    use mockito::Matcher;
    use serde_json::json;
    use thumbforge_contracts::models::{CandidateRegistry, GenerationMode};

    use super::*;

    fn provider(server: &mockito::Server, attempts: &str) -> ReplicateProvider {
        ReplicateProvider::from_settings(&Settings::isolated([
            ("REPLICATE_API_TOKEN", "r8-test".to_string()),
            ("REPLICATE_API_BASE", server.url()),
            ("THUMBFORGE_POLL_INTERVAL_MS", "0".to_string()),
            ("THUMBFORGE_POLL_ATTEMPTS", attempts.to_string()),
        ]))
    }

    #[test]
    fn flux_prediction_is_polled_until_succeeded() -> Result<()> {
        let mut server = mockito::Server::new();
        let poll_url = format!("{}/predictions/p1", server.url());
        let create = server
            .mock("POST", "/models/black-forest-labs/flux-dev/predictions")
            .match_header("authorization", "Token r8-test")
            .match_body(Matcher::PartialJson(json!({
                "input": {"aspect_ratio": "16:9", "output_format": "png", "prompt": "robot chef"}
            })))
            .with_status(201)
            .with_body(json!({"id": "p1", "status": "starting", "urls": {"get": poll_url}}).to_string())
            .create();
        let poll = server
            .mock("GET", "/predictions/p1")
            .with_status(200)
            .with_body(r#"{"id":"p1","status":"succeeded","output":["https://cdn.example/out.png"]}"#)
            .expect(1)
            .create();

        let registry = CandidateRegistry::default();
        let chain = registry.chain("replicate", GenerationMode::TextOnly);
        let success = provider(&server, "3").attempt(&AttemptRequest {
            prompt: "robot chef",
            reference: None,
            candidate: &chain[0],
        })?;
        assert_eq!(
            success.payload,
            ImagePayload::Url("https://cdn.example/out.png".to_string())
        );
        create.assert();
        poll.assert();
        Ok(())
    }

    #[test]
    fn pinned_sdxl_uses_version_and_sends_reference() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let reference = temp.path().join("ref.png");
        RgbImage::from_pixel(4, 4, Rgb([5, 5, 5])).save(&reference)?;

        let mut server = mockito::Server::new();
        let create = server
            .mock("POST", "/predictions")
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(json!({
                    "version": "39ed52f2a78e934b3ba6e2a89f5b1c712de7dfea535525255b1aa35c5565e08b",
                    "input": {"width": 1280, "height": 720, "prompt_strength": 0.8}
                })),
                Matcher::Regex(r#""image":"data:image/jpeg;base64,"#.to_string()),
            ]))
            .with_status(201)
            .with_body(r#"{"id":"p2","status":"succeeded","output":"https://cdn.example/sdxl.png"}"#)
            .create();

        let registry = CandidateRegistry::default();
        let chain = registry.chain("replicate", GenerationMode::WithReference);
        let success = provider(&server, "3").attempt(&AttemptRequest {
            prompt: "robot chef",
            reference: Some(&reference),
            candidate: &chain[1],
        })?;
        assert_eq!(
            success.payload,
            ImagePayload::Url("https://cdn.example/sdxl.png".to_string())
        );
        create.assert();
        Ok(())
    }

    #[test]
    fn failed_prediction_carries_provider_message() {
        let mut server = mockito::Server::new();
        let _create = server
            .mock("POST", "/models/black-forest-labs/flux-dev/predictions")
            .with_status(201)
            .with_body(r#"{"id":"p3","status":"starting"}"#)
            .create();
        let _poll = server
            .mock("GET", "/predictions/p3")
            .with_status(200)
            .with_body(r#"{"id":"p3","status":"failed","error":"NSFW content detected"}"#)
            .create();

        let registry = CandidateRegistry::default();
        let chain = registry.chain("replicate", GenerationMode::TextOnly);
        let result = provider(&server, "3").attempt(&AttemptRequest {
            prompt: "robot chef",
            reference: None,
            candidate: &chain[0],
        });
        assert!(matches!(result, Err(AttemptError::Unavailable(message)) if message.contains("NSFW content detected")));
    }

    #[test]
    fn endless_processing_times_out() {
        let mut server = mockito::Server::new();
        let _create = server
            .mock("POST", "/models/black-forest-labs/flux-dev/predictions")
            .with_status(201)
            .with_body(r#"{"id":"p4","status":"starting"}"#)
            .create();
        let poll = server
            .mock("GET", "/predictions/p4")
            .with_status(200)
            .with_body(r#"{"id":"p4","status":"processing"}"#)
            .expect(2)
            .create();

        let registry = CandidateRegistry::default();
        let chain = registry.chain("replicate", GenerationMode::TextOnly);
        let result = provider(&server, "2").attempt(&AttemptRequest {
            prompt: "robot chef",
            reference: None,
            candidate: &chain[0],
        });
        assert!(matches!(result, Err(AttemptError::Timeout { attempts: 2, .. })));
        poll.assert();
    }
}
