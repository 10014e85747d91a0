use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;
pub const RECEIPT_SUFFIX: &str = ".receipt.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptRequest {
    pub prompt: String,
    pub provider: String,
    #[serde(default)]
    pub reference: Option<String>,
    pub output_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub candidate: String,
    pub with_reference: bool,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// `<output>.receipt.json` next to the generated image.
pub fn receipt_path_for(image_path: &Path) -> PathBuf {
    let mut raw = image_path.as_os_str().to_os_string();
    raw.push(RECEIPT_SUFFIX);
    PathBuf::from(raw)
}

/// Everything a receipt records about one finished generation.
#[derive(Debug, Clone, Copy)]
pub struct ReceiptDraft<'a> {
    pub request: &'a ReceiptRequest,
    pub resolved_prompt: &'a str,
    pub attempts: &'a [AttemptRecord],
    pub winning_candidate: &'a str,
    pub warnings: &'a [String],
    pub image_path: &'a Path,
    pub receipt_path: &'a Path,
    pub provider_response: &'a Map<String, Value>,
}

pub fn build_receipt(draft: &ReceiptDraft<'_>) -> Value {
    let request = serde_json::to_value(draft.request).unwrap_or(Value::Null);
    let attempts = serde_json::to_value(draft.attempts).unwrap_or_else(|_| json!([]));
    json!({
        "schema_version": RECEIPT_SCHEMA_VERSION,
        "request": sanitize_payload(&request),
        "resolved_prompt": draft.resolved_prompt,
        "attempts": attempts,
        "winning_candidate": draft.winning_candidate,
        "provider_response": sanitize_payload(&Value::Object(draft.provider_response.clone())),
        "warnings": draft.warnings,
        "artifacts": {
            "image_path": draft.image_path.to_string_lossy(),
            "receipt_path": draft.receipt_path.to_string_lossy(),
        },
    })
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

/// Replaces inline image payloads with `<omitted>`. Data URLs hidden in
/// string values are collapsed the same way.
pub fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) => value.clone(),
        Value::String(text) => {
            if text.starts_with("data:") && text.contains(";base64,") {
                Value::String("<omitted>".to_string())
            } else {
                value.clone()
            }
        }
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "b64_json" | "base64" | "image" | "image_bytes" | "data" | "inlinedata" | "inline_data"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}
