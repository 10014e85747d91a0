pub mod analyzer;
pub mod embed;
pub mod error;
pub mod http;
pub mod library;
pub mod orchestrator;
pub mod providers;
pub mod vision;

pub use analyzer::ThumbnailAnalyzer;
pub use embed::{DryrunEmbedder, Embedder, JinaClipEmbedder};
pub use error::{EngineError, EngineResult};
pub use library::{query_text, ImportReport, SearchResult, ThumbnailLibrary};
pub use orchestrator::{default_output_path, GenerationOutcome, GenerationRequest, Orchestrator};
pub use providers::{ImageProvider, ImageProviderRegistry};
pub use vision::{OpenAiVision, VisionAnalyzer};
