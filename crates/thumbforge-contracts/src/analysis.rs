use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type AnalysisSection = BTreeMap<String, String>;

/// Modification plan produced for a reference thumbnail and a new topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailAnalysis {
    pub current_analysis: AnalysisSection,
    pub suggested_modifications: AnalysisSection,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub psychological_reasoning: AnalysisSection,
    pub generation_prompt: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnalysisParseError {
    #[error("analysis reply contained no JSON object")]
    NoJsonObject,
    #[error("analysis field `{0}` is missing")]
    MissingField(&'static str),
    #[error("analysis field `{0}` must be a JSON object")]
    NotAnObject(&'static str),
    #[error("analysis field `{0}` is empty")]
    EmptyField(&'static str),
}

impl ThumbnailAnalysis {
    /// Parses a model reply, tolerating markdown fences and surrounding prose.
    pub fn parse(text: &str) -> Result<Self, AnalysisParseError> {
        let object = extract_json_object_from_text(text).ok_or(AnalysisParseError::NoJsonObject)?;
        Self::from_object(&object)
    }

    pub fn from_object(object: &Map<String, Value>) -> Result<Self, AnalysisParseError> {
        let current_analysis = required_section(object, "current_analysis")?;
        let suggested_modifications = required_section(object, "suggested_modifications")?;
        let psychological_reasoning = match object.get("psychological_reasoning") {
            Some(Value::Object(map)) => section_from_map(map),
            _ => AnalysisSection::new(),
        };
        let generation_prompt = object
            .get("generation_prompt")
            .ok_or(AnalysisParseError::MissingField("generation_prompt"))?
            .as_str()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if generation_prompt.is_empty() {
            return Err(AnalysisParseError::EmptyField("generation_prompt"));
        }
        Ok(Self {
            current_analysis,
            suggested_modifications,
            psychological_reasoning,
            generation_prompt,
        })
    }

    /// Plain-text rendering used by the CLI.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let rule = "=".repeat(70);
        for (title, section) in [
            ("CURRENT THUMBNAIL ANALYSIS", &self.current_analysis),
            ("SUGGESTED MODIFICATIONS", &self.suggested_modifications),
            ("PSYCHOLOGICAL REASONING", &self.psychological_reasoning),
        ] {
            if section.is_empty() {
                continue;
            }
            out.push_str(&format!("{rule}\n{title}\n{rule}\n"));
            for (key, value) in section {
                out.push_str(&format!("\n{}:\n  {value}\n", heading(key)));
            }
            out.push('\n');
        }
        out.push_str(&format!(
            "{rule}\nGENERATION PROMPT\n{rule}\n\n{}\n",
            self.generation_prompt
        ));
        out
    }
}

fn heading(key: &str) -> String {
    key.replace('_', " ").to_ascii_uppercase()
}

fn required_section(
    object: &Map<String, Value>,
    key: &'static str,
) -> Result<AnalysisSection, AnalysisParseError> {
    match object.get(key) {
        None | Some(Value::Null) => Err(AnalysisParseError::MissingField(key)),
        Some(Value::Object(map)) => {
            let section = section_from_map(map);
            if section.is_empty() {
                return Err(AnalysisParseError::EmptyField(key));
            }
            Ok(section)
        }
        Some(_) => Err(AnalysisParseError::NotAnObject(key)),
    }
}

fn section_from_map(map: &Map<String, Value>) -> AnalysisSection {
    map.iter()
        .filter_map(|(key, value)| {
            let text = match value {
                Value::String(text) => text.trim().to_string(),
                Value::Null => return None,
                other => other.to_string(),
            };
            (!text.is_empty()).then(|| (key.clone(), text))
        })
        .collect()
}

pub fn strip_code_fence(text: &str) -> String {
    let raw = text.trim();
    if !(raw.starts_with("```") && raw.ends_with("```")) {
        return raw.to_string();
    }
    let lines: Vec<&str> = raw.lines().collect();
    if lines.len() < 2 {
        return raw.to_string();
    }
    let first = lines[0].trim_start_matches("```").trim();
    let mut body = lines[1..lines.len() - 1].join("\n").trim().to_string();
    if first.is_empty() && body.to_ascii_lowercase().starts_with("json") {
        body = body[4..].trim().to_string();
    }
    body
}

pub fn extract_json_object_from_text(text: &str) -> Option<Map<String, Value>> {
    let raw = strip_code_fence(text);
    if raw.trim().is_empty() {
        return None;
    }
    let mut candidates = vec![raw.clone()];
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if end > start {
            candidates.push(raw[start..=end].to_string());
        }
    }
    for candidate in candidates {
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(&candidate) {
            return Some(object);
        }
    }
    None
}
