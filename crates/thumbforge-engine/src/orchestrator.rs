use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thumbforge_contracts::config::Settings;
use thumbforge_contracts::events::{payload, EventWriter};
use thumbforge_contracts::models::{CandidateRegistry, CandidateSpec, GenerationMode, ProviderSelector};
use thumbforge_contracts::runs::receipts::{
    build_receipt, receipt_path_for, write_receipt, AttemptOutcome, AttemptRecord, ReceiptDraft,
    ReceiptRequest,
};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::http::{download_image, error_chain_text, http_client, ImageBytes};
use crate::providers::{
    augment_prompt, default_provider_registry, AttemptError, AttemptRequest, ImagePayload,
    ImageProvider, ImageProviderRegistry,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub output_path: PathBuf,
    pub reference: Option<PathBuf>,
    pub provider: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            output_path: output_path.into(),
            reference: None,
            provider: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<PathBuf>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    pub path: PathBuf,
    pub provider: String,
    pub candidate: String,
    /// Candidate invocations across both passes.
    pub attempts: u32,
    pub reference_used: bool,
    pub receipt_path: Option<PathBuf>,
    pub image_sha256: String,
}

/// `thumbnail_<utc timestamp>.png` inside `dir`.
pub fn default_output_path(dir: &Path) -> PathBuf {
    dir.join(format!("thumbnail_{}.png", Utc::now().format("%Y%m%d_%H%M%S")))
}

struct Winner {
    candidate: CandidateSpec,
    image: ImageBytes,
    provider_response: Map<String, Value>,
    prompt: String,
}

struct PassLog<'a> {
    provider: &'a str,
    attempts: &'a mut Vec<AttemptRecord>,
    warnings: &'a mut Vec<String>,
}

/// Runs one provider's candidate chain, with the one-shot retry that drops
/// the reference image when every candidate failed.
pub struct Orchestrator {
    providers: ImageProviderRegistry,
    selector: ProviderSelector,
    events: EventWriter,
    http: HttpClient,
    write_receipts: bool,
}

impl Orchestrator {
    pub fn new(settings: &Settings, events: EventWriter) -> Self {
        Self {
            providers: default_provider_registry(settings),
            selector: ProviderSelector::new(None),
            events,
            http: http_client(settings.request_timeout()),
            write_receipts: true,
        }
    }

    pub fn with_providers(
        providers: ImageProviderRegistry,
        candidates: CandidateRegistry,
        events: EventWriter,
    ) -> Self {
        Self {
            providers,
            selector: ProviderSelector::new(Some(candidates)),
            events,
            http: http_client(Settings::default().request_timeout()),
            write_receipts: true,
        }
    }

    pub fn without_receipts(mut self) -> Self {
        self.write_receipts = false;
        self
    }

    pub fn candidates(&self) -> &CandidateRegistry {
        &self.selector.registry
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.names()
    }

    /// Missing-credential message for a provider, `None` when it can run.
    pub fn missing_configuration(&self, provider: &str) -> Option<String> {
        self.providers
            .get(provider)
            .and_then(|provider| provider.missing_configuration())
    }

    pub fn generate(&self, request: &GenerationRequest) -> EngineResult<GenerationOutcome> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(EngineError::InvalidInput("prompt must not be blank".to_string()));
        }
        if request.output_path.as_os_str().is_empty() {
            return Err(EngineError::InvalidInput("output path must not be empty".to_string()));
        }

        let selection = self
            .selector
            .select(request.provider.as_deref())
            .map_err(EngineError::Configuration)?;
        let provider_name = selection.provider.as_str();
        let provider = self.providers.get(provider_name).ok_or_else(|| {
            EngineError::Configuration(format!(
                "provider '{provider_name}' has no client (registered: {})",
                self.provider_names().join(", ")
            ))
        })?;
        if let Some(missing) = provider.missing_configuration() {
            return Err(EngineError::Configuration(format!("{provider_name}: {missing}")));
        }

        let mut warnings = Vec::new();
        if let Some(reason) = selection.fallback_reason.as_ref() {
            warnings.push(reason.clone());
        }
        let reference = self.usable_reference(request.reference.as_deref(), &mut warnings);
        let augmented = augment_prompt(prompt);

        info!(provider = provider_name, reference = reference.is_some(), "generation started");
        self.events.record(
            "generation_started",
            payload(json!({
                "provider": provider_name,
                "requested_provider": selection.requested,
                "output_path": request.output_path.to_string_lossy(),
                "reference": reference.map(|path| path.to_string_lossy().to_string()),
                "prompt_chars": prompt.chars().count(),
            })),
        );

        let mut attempts = Vec::new();
        let mut log = PassLog {
            provider: provider_name,
            attempts: &mut attempts,
            warnings: &mut warnings,
        };
        let mut result = self.run_pass(provider, prompt, &augmented, reference, &mut log);
        let mut reference_used = reference.is_some();
        let retry_detail = match &result {
            Err(last_error) => Some(
                last_error
                    .as_ref()
                    .map(|err| err.to_string())
                    .unwrap_or_default(),
            ),
            Ok(_) => None,
        };
        if let (Some(detail), Some(dropped)) = (retry_detail, reference) {
            warn!(provider = provider_name, error = %detail, "all candidates failed with reference; retrying without it");
            log.warnings
                .push(format!("Reference {} dropped after every candidate failed.", dropped.display()));
            self.events.record(
                "reference_dropped",
                payload(json!({
                    "provider": provider_name,
                    "reference": dropped.to_string_lossy(),
                    "last_error": detail,
                })),
            );
            reference_used = false;
            result = self.run_pass(provider, prompt, &augmented, None, &mut log);
        }

        let attempt_count = u32::try_from(attempts.len()).unwrap_or(u32::MAX);
        let winner = match result {
            Ok(winner) => winner,
            Err(last_error) => {
                let err = exhaustion_error(provider_name, last_error);
                warn!(provider = provider_name, attempts = attempt_count, error = %err, "generation failed");
                self.events.record(
                    "generation_failed",
                    payload(json!({
                        "provider": provider_name,
                        "attempts": attempt_count,
                        "error_kind": err.kind(),
                        "error": err.to_string(),
                    })),
                );
                return Err(err);
            }
        };

        write_output_atomic(&request.output_path, &winner.image.bytes)
            .map_err(|err| EngineError::io(&request.output_path, err))?;
        let image_sha256 = hex::encode(Sha256::digest(&winner.image.bytes));

        let receipt_path = if self.write_receipts {
            let receipt_path = receipt_path_for(&request.output_path);
            let mut provider_response = winner.provider_response.clone();
            provider_response.insert("image_sha256".to_string(), Value::String(image_sha256.clone()));
            provider_response.insert("mime_type".to_string(), json!(winner.image.mime_type));
            let receipt_request = ReceiptRequest {
                prompt: prompt.to_string(),
                provider: provider_name.to_string(),
                reference: reference.map(|path| path.to_string_lossy().to_string()),
                output_path: request.output_path.to_string_lossy().to_string(),
            };
            let receipt = build_receipt(&ReceiptDraft {
                request: &receipt_request,
                resolved_prompt: &winner.prompt,
                attempts: &attempts,
                winning_candidate: &winner.candidate.label,
                warnings: &warnings,
                image_path: &request.output_path,
                receipt_path: &receipt_path,
                provider_response: &provider_response,
            });
            match write_receipt(&receipt_path, &receipt) {
                Ok(()) => Some(receipt_path),
                Err(err) => {
                    warn!(path = %receipt_path.display(), error = %err, "failed to write receipt");
                    None
                }
            }
        } else {
            None
        };

        info!(
            provider = provider_name,
            candidate = %winner.candidate.label,
            attempts = attempt_count,
            path = %request.output_path.display(),
            "generation succeeded"
        );
        self.events.record(
            "generation_succeeded",
            payload(json!({
                "provider": provider_name,
                "candidate": winner.candidate.label,
                "attempts": attempt_count,
                "reference_used": reference_used,
                "output_path": request.output_path.to_string_lossy(),
                "bytes": winner.image.bytes.len(),
                "image_sha256": image_sha256,
            })),
        );

        Ok(GenerationOutcome {
            path: request.output_path.clone(),
            provider: provider_name.to_string(),
            candidate: winner.candidate.label,
            attempts: attempt_count,
            reference_used,
            receipt_path,
            image_sha256,
        })
    }

    /// Blank or nonexistent references are treated as absent.
    fn usable_reference<'a>(&self, reference: Option<&'a Path>, warnings: &mut Vec<String>) -> Option<&'a Path> {
        let reference = reference?;
        if reference.as_os_str().is_empty() || reference.to_string_lossy().trim().is_empty() {
            return None;
        }
        if reference.is_file() {
            return Some(reference);
        }
        warn!(reference = %reference.display(), "reference image not found; generating without it");
        warnings.push(format!("Reference {} not found; ignored.", reference.display()));
        self.events.record(
            "reference_ignored",
            payload(json!({ "reference": reference.to_string_lossy() })),
        );
        None
    }

    fn run_pass(
        &self,
        provider: &dyn ImageProvider,
        prompt: &str,
        augmented: &str,
        reference: Option<&Path>,
        log: &mut PassLog<'_>,
    ) -> Result<Winner, Option<AttemptError>> {
        let mode = if reference.is_some() {
            GenerationMode::WithReference
        } else {
            GenerationMode::TextOnly
        };
        let resolved_prompt = match provider.prepare_prompt(prompt, reference) {
            Ok(Some(prepared)) => prepared,
            Ok(None) => augmented.to_string(),
            Err(err) => {
                let detail = error_chain_text(&err, 512);
                warn!(provider = log.provider, error = %detail, "vision context unavailable; using plain prompt");
                log.warnings.push(format!("Vision context failed: {detail}"));
                self.events.record(
                    "vision_context_failed",
                    payload(json!({ "provider": log.provider, "error": detail })),
                );
                augmented.to_string()
            }
        };

        let chain = self.selector.registry.chain(log.provider, mode);
        if chain.is_empty() {
            return Err(Some(AttemptError::Unavailable(format!(
                "no {} candidates registered for {}",
                mode.as_str(),
                log.provider
            ))));
        }

        let mut last_error = None;
        for candidate in &chain {
            debug!(candidate = %candidate.label, mode = mode.as_str(), "trying candidate");
            self.events.record(
                "candidate_attempt",
                payload(json!({
                    "provider": log.provider,
                    "candidate": candidate.label,
                    "mode": mode.as_str(),
                })),
            );
            let started = Instant::now();
            let result = provider
                .attempt(&AttemptRequest {
                    prompt: &resolved_prompt,
                    reference,
                    candidate,
                })
                .and_then(|success| {
                    self.normalize_payload(success.payload)
                        .map(|image| (image, success.provider_response))
                });
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match result {
                Ok((image, provider_response)) => {
                    log.attempts.push(AttemptRecord {
                        candidate: candidate.label.clone(),
                        with_reference: reference.is_some(),
                        outcome: AttemptOutcome::Succeeded,
                        error: None,
                        elapsed_ms,
                    });
                    return Ok(Winner {
                        candidate: candidate.clone(),
                        image,
                        provider_response,
                        prompt: resolved_prompt,
                    });
                }
                Err(err) => {
                    warn!(candidate = %candidate.label, kind = err.kind(), error = %err, "candidate failed");
                    log.attempts.push(AttemptRecord {
                        candidate: candidate.label.clone(),
                        with_reference: reference.is_some(),
                        outcome: AttemptOutcome::Failed,
                        error: Some(err.to_string()),
                        elapsed_ms,
                    });
                    self.events.record(
                        "candidate_failed",
                        payload(json!({
                            "provider": log.provider,
                            "candidate": candidate.label,
                            "mode": mode.as_str(),
                            "error_kind": err.kind(),
                            "error": err.to_string(),
                            "elapsed_ms": elapsed_ms,
                        })),
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(last_error)
    }

    fn normalize_payload(&self, payload: ImagePayload) -> Result<ImageBytes, AttemptError> {
        let image = match payload {
            ImagePayload::Base64 { data, mime_type } => decode_base64_image(&data, mime_type)?,
            ImagePayload::Bytes { bytes, mime_type } => ImageBytes { bytes, mime_type },
            ImagePayload::Url(url) if url.starts_with("data:") => decode_base64_image(&url, None)?,
            ImagePayload::Url(url) => download_image(&self.http, &url)?,
        };
        if image.bytes.is_empty() {
            return Err(AttemptError::Malformed("provider returned an empty image".to_string()));
        }
        if image::guess_format(&image.bytes).is_err() {
            return Err(AttemptError::Malformed(
                "provider payload is not a recognizable image".to_string(),
            ));
        }
        Ok(image)
    }
}

/// Accepts bare base64 or a `data:<mime>;base64,` URL.
fn decode_base64_image(raw: &str, mime_type: Option<String>) -> Result<ImageBytes, AttemptError> {
    let (data, mime_type) = match raw.trim().strip_prefix("data:") {
        Some(rest) => {
            let (header, data) = rest.split_once(',').ok_or_else(|| {
                AttemptError::Malformed("data URL has no payload".to_string())
            })?;
            let mime = header.split(';').next().filter(|mime| !mime.is_empty());
            (data, mime.map(str::to_string).or(mime_type))
        }
        None => (raw.trim(), mime_type),
    };
    let bytes = BASE64
        .decode(data.trim())
        .map_err(|err| AttemptError::Malformed(format!("invalid base64 image payload: {err}")))?;
    Ok(ImageBytes { bytes, mime_type })
}

fn exhaustion_error(provider: &str, last_error: Option<AttemptError>) -> EngineError {
    let provider = provider.to_string();
    match last_error {
        None => EngineError::ProviderUnavailable {
            provider,
            last_error: "no candidates were attempted".to_string(),
        },
        Some(err @ AttemptError::Timeout { .. }) => EngineError::Timeout {
            provider,
            detail: err.to_string(),
        },
        Some(AttemptError::Malformed(detail)) => EngineError::MalformedResponse { provider, detail },
        Some(AttemptError::Unavailable(last_error)) => {
            EngineError::ProviderUnavailable { provider, last_error }
        }
    }
}

fn write_output_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    let mut tmp = NamedTempFile::new_in(&parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
