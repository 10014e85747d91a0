use super::registry::CandidateRegistry;

pub const DEFAULT_PROVIDER: &str = "openai";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSelection {
    pub provider: String,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderSelector {
    pub registry: CandidateRegistry,
}

impl ProviderSelector {
    pub fn new(registry: Option<CandidateRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_default(),
        }
    }

    /// Resolves a user-facing provider name (aliases like `dalle` included)
    /// to a registered provider. Unknown names are an error, never a silent
    /// substitution.
    pub fn select(&self, requested: Option<&str>) -> Result<ProviderSelection, String> {
        let Some(requested_value) = requested.map(str::trim).filter(|value| !value.is_empty())
        else {
            if !self.registry.has_provider(DEFAULT_PROVIDER) {
                return Err(format!(
                    "Default provider '{DEFAULT_PROVIDER}' is not registered."
                ));
            }
            return Ok(ProviderSelection {
                provider: DEFAULT_PROVIDER.to_string(),
                requested: None,
                fallback_reason: Some("No provider specified; using default.".to_string()),
            });
        };

        let canonical = canonical_provider_name(requested_value)
            .map(str::to_string)
            .unwrap_or_else(|| requested_value.to_ascii_lowercase());
        if !self.registry.has_provider(&canonical) {
            return Err(format!(
                "Unsupported provider '{requested_value}' (available: {}).",
                self.registry.providers().join(", ")
            ));
        }
        Ok(ProviderSelection {
            provider: canonical,
            requested: Some(requested_value.to_string()),
            fallback_reason: None,
        })
    }
}

pub fn canonical_provider_name(raw: &str) -> Option<&'static str> {
    let normalized = raw.trim().to_ascii_lowercase();
    let name = match normalized.as_str() {
        "openai" | "dalle" | "dall-e" | "dall-e-3" | "dalle3" => "openai",
        "gemini" | "google" | "nano-banana" | "nanobanana" => "gemini",
        "replicate" | "flux" => "replicate",
        "fal" | "fal-ai" | "fal.ai" => "fal",
        "freepik" => "freepik",
        "dryrun" | "dry-run" => "dryrun",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::{canonical_provider_name, ProviderSelector};

    #[test]
    fn aliases_resolve_to_registered_providers() {
        let selector = ProviderSelector::new(None);
        let selection = selector.select(Some("DALLE")).unwrap();
        assert_eq!(selection.provider, "openai");
        assert_eq!(selection.requested.as_deref(), Some("DALLE"));
        assert_eq!(selection.fallback_reason, None);
        assert_eq!(canonical_provider_name(" nano-banana "), Some("gemini"));
    }

    #[test]
    fn missing_request_uses_default_with_explanation() {
        let selection = ProviderSelector::new(None).select(Some("  ")).unwrap();
        assert_eq!(selection.provider, "openai");
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("No provider specified; using default.")
        );
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = ProviderSelector::new(None)
            .select(Some("midjourney"))
            .err()
            .unwrap_or_default();
        assert!(err.starts_with("Unsupported provider 'midjourney'"));
        assert!(err.contains("gemini, openai, replicate, fal, freepik, dryrun"));
    }
}
