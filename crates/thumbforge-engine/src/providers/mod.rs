use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use thumbforge_contracts::config::Settings;
use thumbforge_contracts::models::CandidateSpec;

use crate::http::error_chain_text;
use crate::vision::{OpenAiVision, VisionAnalyzer};

mod dryrun;
mod fal;
mod freepik;
mod gemini;
mod openai;
mod replicate;

pub use dryrun::DryrunProvider;
pub use fal::FalProvider;
pub use freepik::FreepikProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use replicate::ReplicateProvider;

/// Image returned by a provider before it is written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    Base64 {
        data: String,
        mime_type: Option<String>,
    },
    Bytes {
        bytes: Vec<u8>,
        mime_type: Option<String>,
    },
    Url(String),
}

#[derive(Debug, Clone)]
pub struct AttemptSuccess {
    pub payload: ImagePayload,
    pub provider_response: Map<String, Value>,
}

/// Why a single candidate failed. The orchestrator moves on to the next
/// candidate for every variant; the last one decides the surfaced error kind.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("{0}")]
    Unavailable(String),
    #[error("polling gave up after {attempts} attempts: {detail}")]
    Timeout { attempts: u32, detail: String },
    #[error("{0}")]
    Malformed(String),
}

impl AttemptError {
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptError::Unavailable(_) => "unavailable",
            AttemptError::Timeout { .. } => "timeout",
            AttemptError::Malformed(_) => "malformed",
        }
    }
}

impl From<anyhow::Error> for AttemptError {
    fn from(err: anyhow::Error) -> Self {
        AttemptError::Unavailable(error_chain_text(&err, 512))
    }
}

pub type AttemptResult = Result<AttemptSuccess, AttemptError>;

/// One candidate invocation.
#[derive(Debug, Clone, Copy)]
pub struct AttemptRequest<'a> {
    pub prompt: &'a str,
    pub reference: Option<&'a Path>,
    pub candidate: &'a CandidateSpec,
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Human-readable reason when the provider cannot run, typically a
    /// missing credential.
    fn missing_configuration(&self) -> Option<String>;

    /// Provider-specific prompt rewrite that runs once per pass, before the
    /// candidate chain. An error degrades to the unmodified prompt.
    fn prepare_prompt(&self, _prompt: &str, _reference: Option<&Path>) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    fn attempt(&self, request: &AttemptRequest<'_>) -> AttemptResult;
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry(settings: &Settings) -> ImageProviderRegistry {
    let vision: Arc<dyn VisionAnalyzer> = Arc::new(OpenAiVision::from_settings(settings));
    let mut providers = ImageProviderRegistry::new();
    providers.register(DryrunProvider::new());
    providers.register(OpenAiProvider::from_settings(settings, Some(vision)));
    providers.register(GeminiProvider::from_settings(settings));
    providers.register(ReplicateProvider::from_settings(settings));
    providers.register(FalProvider::from_settings(settings));
    providers.register(FreepikProvider::from_settings(settings));
    providers
}

/// Fixed thumbnail style applied to every prompt before it reaches a provider.
pub fn augment_prompt(prompt: &str) -> String {
    format!(
        "Create a professional YouTube thumbnail (16:9 aspect ratio): {}\n\n\
Style requirements:\n\
- High quality, professional design\n\
- Eye-catching and engaging\n\
- Clear, bold visual elements\n\
- Suitable for YouTube platform\n\
- 16:9 landscape format\n\
- Modern and polished aesthetic\n\n\
Avoid: podcast microphones, headphones, podcast studio setup",
        prompt.trim()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            interval: settings.poll_interval(),
            max_attempts: settings.poll_attempts(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Pending,
    Done(Value),
    Failed(String),
}

/// Sleeps, checks, repeats. An explicit failure status ends the loop as an
/// unavailable candidate; running out of attempts is a timeout.
pub fn poll_until<F>(settings: PollSettings, label: &str, mut check: F) -> Result<Value, AttemptError>
where
    F: FnMut(u32) -> Result<PollStatus, AttemptError>,
{
    let max_attempts = settings.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        if !settings.interval.is_zero() {
            thread::sleep(settings.interval);
        }
        match check(attempt)? {
            PollStatus::Done(value) => return Ok(value),
            PollStatus::Failed(message) => return Err(AttemptError::Unavailable(message)),
            PollStatus::Pending => {
                tracing::debug!(label, attempt, max_attempts, "job still pending");
            }
        }
    }
    Err(AttemptError::Timeout {
        attempts: max_attempts,
        detail: format!("{label} did not finish"),
    })
}

/// `http...` strings found under `url`/`urls`/`images`/`image`/`output` keys,
/// in document order, without duplicates.
pub fn extract_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if !trimmed.is_empty()
                && trimmed.starts_with("http")
                && !out.iter().any(|existing| existing == trimmed)
            {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                extract_urls(row, out);
            }
        }
        Value::Object(obj) => {
            for key in ["url", "urls", "images", "image", "output"] {
                if let Some(inner) = obj.get(key) {
                    extract_urls(inner, out);
                }
            }
        }
        _ => {}
    }
}
