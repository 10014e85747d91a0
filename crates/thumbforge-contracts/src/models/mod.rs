mod registry;
mod selectors;

pub use registry::{CandidateRegistry, CandidateSpec, GenerationMode};
pub use selectors::{canonical_provider_name, ProviderSelection, ProviderSelector, DEFAULT_PROVIDER};
