use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    TextOnly,
    WithReference,
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMode::TextOnly => "text_only",
            GenerationMode::WithReference => "with_reference",
        }
    }
}

/// One entry of a provider's candidate chain: a model or endpoint that is
/// tried in registry order until one produces an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSpec {
    pub label: String,
    pub provider: String,
    pub model: String,
    pub display_name: String,
    pub modes: Vec<GenerationMode>,
}

impl CandidateSpec {
    pub fn supports(&self, mode: GenerationMode) -> bool {
        self.modes.contains(&mode)
    }
}

#[derive(Debug, Clone)]
pub struct CandidateRegistry {
    candidates: IndexMap<String, CandidateSpec>,
}

impl CandidateRegistry {
    pub fn new(candidates: Option<IndexMap<String, CandidateSpec>>) -> Self {
        Self {
            candidates: candidates.unwrap_or_else(default_candidates),
        }
    }

    pub fn from_specs(specs: impl IntoIterator<Item = CandidateSpec>) -> Self {
        Self {
            candidates: specs
                .into_iter()
                .map(|spec| (spec.label.clone(), spec))
                .collect(),
        }
    }

    pub fn get(&self, label: &str) -> Option<&CandidateSpec> {
        self.candidates.get(label)
    }

    pub fn list(&self) -> impl Iterator<Item = &CandidateSpec> {
        self.candidates.values()
    }

    /// Ordered candidate chain for a provider in the given mode.
    pub fn chain(&self, provider: &str, mode: GenerationMode) -> Vec<CandidateSpec> {
        self.candidates
            .values()
            .filter(|spec| spec.provider == provider && spec.supports(mode))
            .cloned()
            .collect()
    }

    /// Provider names in first-registration order, without duplicates.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for spec in self.candidates.values() {
            if !names.iter().any(|name| name == &spec.provider) {
                names.push(spec.provider.clone());
            }
        }
        names
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.candidates
            .values()
            .any(|spec| spec.provider == provider)
    }
}

impl Default for CandidateRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

const BOTH: &[GenerationMode] = &[GenerationMode::TextOnly, GenerationMode::WithReference];
const TEXT: &[GenerationMode] = &[GenerationMode::TextOnly];
const REFERENCE: &[GenerationMode] = &[GenerationMode::WithReference];

fn default_candidates() -> IndexMap<String, CandidateSpec> {
    let mut map = IndexMap::new();

    let mut insert = |provider: &str, model: &str, display_name: &str, modes: &[GenerationMode]| {
        let label = format!("{provider}/{model}");
        map.insert(
            label.clone(),
            CandidateSpec {
                label,
                provider: provider.to_string(),
                model: model.to_string(),
                display_name: display_name.to_string(),
                modes: modes.to_vec(),
            },
        );
    };

    insert(
        "gemini",
        "gemini-2.5-flash-image",
        "Gemini 2.5 Flash Image",
        BOTH,
    );
    insert(
        "gemini",
        "gemini-2.5-flash-image-preview",
        "Gemini 2.5 Flash Image Preview",
        BOTH,
    );
    insert(
        "gemini",
        "gemini-2.0-flash-preview-image-generation",
        "Gemini 2.0 Flash Image Generation",
        BOTH,
    );
    insert("gemini", "gemini-exp-1206", "Gemini Exp 1206", BOTH);
    insert("openai", "dall-e-3", "DALL-E 3", BOTH);
    insert(
        "replicate",
        "black-forest-labs/flux-dev",
        "FLUX Dev",
        BOTH,
    );
    insert(
        "replicate",
        "stability-ai/sdxl:39ed52f2a78e934b3ba6e2a89f5b1c712de7dfea535525255b1aa35c5565e08b",
        "SDXL",
        BOTH,
    );
    insert(
        "fal",
        "fal-ai/flux-pro/v1.1-ultra",
        "FLUX Pro 1.1 Ultra",
        BOTH,
    );
    insert("freepik", "text-to-image", "Freepik Text to Image", TEXT);
    insert("freepik", "reimagine", "Freepik Reimagine", REFERENCE);
    insert(
        "freepik",
        "image-variations",
        "Freepik Image Variations",
        REFERENCE,
    );
    insert("dryrun", "dryrun-solid", "Dryrun solid fill", BOTH);

    map
}
