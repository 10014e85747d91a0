use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use thumbforge_contracts::analysis::ThumbnailAnalysis;
use thumbforge_contracts::events::{payload, EventWriter};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::http::{error_chain_text, jpeg_bytes_for_path, mime_for_path};
use crate::vision::VisionAnalyzer;

const ANALYSIS_MAX_OUTPUT_TOKENS: u64 = 2000;

/// Turns a reference thumbnail plus a new topic into a modification plan.
pub struct ThumbnailAnalyzer {
    vision: Arc<dyn VisionAnalyzer>,
    events: EventWriter,
}

impl ThumbnailAnalyzer {
    pub fn new(vision: Arc<dyn VisionAnalyzer>) -> Self {
        Self {
            vision,
            events: EventWriter::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = events;
        self
    }

    pub fn analyze(
        &self,
        image_path: &Path,
        topic: &str,
        point_of_view: Option<&str>,
    ) -> EngineResult<ThumbnailAnalysis> {
        if topic.trim().is_empty() {
            return Err(EngineError::InvalidInput("topic must not be blank".to_string()));
        }
        if !image_path.is_file() {
            return Err(EngineError::InvalidInput(format!(
                "thumbnail {} does not exist",
                image_path.display()
            )));
        }
        let (bytes, mime_type) = match jpeg_bytes_for_path(image_path) {
            Ok(bytes) => (bytes, "image/jpeg"),
            Err(_) => {
                let raw = std::fs::read(image_path)
                    .map_err(|err| EngineError::io(image_path, err))?;
                (raw, mime_for_path(image_path).unwrap_or("image/png"))
            }
        };

        let instruction = analysis_instruction(topic.trim(), point_of_view);
        let reply = self
            .vision
            .analyze(&bytes, mime_type, &instruction, ANALYSIS_MAX_OUTPUT_TOKENS)
            .map_err(|err| EngineError::ProviderUnavailable {
                provider: self.vision.name().to_string(),
                last_error: error_chain_text(&err, 512),
            })?;
        let analysis = ThumbnailAnalysis::parse(&reply)
            .map_err(|err| EngineError::analysis(self.vision.name(), err))?;

        info!(thumbnail = %image_path.display(), topic, "thumbnail analysis completed");
        self.events.record(
            "analysis_completed",
            payload(json!({
                "thumbnail": image_path.to_string_lossy(),
                "topic": topic.trim(),
                "point_of_view": point_of_view,
                "generation_prompt_chars": analysis.generation_prompt.chars().count(),
            })),
        );
        Ok(analysis)
    }
}

pub fn analysis_instruction(topic: &str, point_of_view: Option<&str>) -> String {
    let pov_context = point_of_view
        .map(str::trim)
        .filter(|pov| !pov.is_empty())
        .map(|pov| format!(" from {pov} perspective"))
        .unwrap_or_default();
    format!(
        r#"You are a YouTube thumbnail strategist. Analyze this outlier thumbnail and suggest visual modifications that maximize curiosity and click-through rate for a new topic.

NEW TOPIC: {topic}{pov_context}

RULES:
1. MUST include a human face (expressive, emotional, relatable).
2. NO podcast elements (microphones, headphones, podcast setups).
3. NOT a simple poster: the design needs depth, emotion and intrigue.
4. Lean on psychological triggers: curiosity, emotion, surprise, relatability.
5. Aim for YouTube performance, not graphic design perfection.

ANALYSIS FRAMEWORK:
- Face prominence and emotional expression
- Background and setting relevance
- Color psychology and contrast
- Text readability and curiosity gap
- Visual symbols that create intrigue
- Overall composition and flow

MODIFICATION STRATEGY for "{topic}":
- Keep the successful elements of the original
- Adapt the emotional tone to the new topic
- Use visual metaphors and symbols specific to the topic
- Open a curiosity gap that makes viewers need to click
- Make the face convey the right emotion for the topic

Reply with this exact JSON shape:

{{
  "current_analysis": {{
    "face_presence": "whether there is a face, its expression and prominence",
    "background": "the setting and how well it works",
    "color_psychology": "colors used and the emotions they evoke",
    "text_strategy": "text content, style and the curiosity it creates",
    "visual_symbols": "key symbols, props or elements that add meaning",
    "overall_effectiveness": "what makes this thumbnail successful"
  }},
  "suggested_modifications": {{
    "face_expression": "facial expression and emotion to show for '{topic}'",
    "background_change": "specific background for the new topic (lighting, environment, props)",
    "color_tone_shift": "exact palette changes and why they suit the topic",
    "text_update": "new curiosity-driving text with wording and placement",
    "symbolic_additions": "symbols, props or overlays that reinforce the topic",
    "layout_adjustments": "composition, face size and positioning changes"
  }},
  "psychological_reasoning": {{
    "curiosity_trigger": "how the changes open a curiosity gap",
    "emotional_resonance": "what viewers will feel and why they will click",
    "relatability_factor": "how viewers will think 'this is about me'"
  }},
  "generation_prompt": "Create a YouTube thumbnail by MODIFYING the existing design. FOR TOPIC: '{topic}'. Include an expressive human face showing [emotion]. Background: [background]. Colors: [palette]. Text: [exact text]. Add these symbols: [symbols]. Layout: [adjustments]. Emotional and intriguing, NOT a poster. Keep the energy and composition of the original while adapting the content to the new topic. NO microphones, NO podcast elements."
}}

Reply with the JSON object only."#
    )
}
