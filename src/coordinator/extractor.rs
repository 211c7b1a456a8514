//! Extractor role: pull named fields out of page content.

use serde_json::{Map, Value};

use crate::errors::EngineError;
use crate::llm::extract_json_object;

/// Typed extraction result: every requested field is present, null when the
/// content did not contain it.
#[derive(Debug, Clone)]
pub struct ExtractedFields {
    pub data: Map<String, Value>,
    pub confidence: f64,
}

/// Parse the extractor model reply against the requested field list.
pub fn parse_extraction_reply(raw: &str, fields: &[String]) -> Result<ExtractedFields, EngineError> {
    let json = extract_json_object(raw)
        .ok_or_else(|| EngineError::PlannerParse("extraction reply has no JSON".to_string()))?;
    let value: Value = serde_json::from_str(&json)
        .map_err(|err| EngineError::PlannerParse(format!("malformed extraction JSON: {err}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| EngineError::PlannerParse("extraction reply is not an object".to_string()))?;

    let mut data = Map::new();
    let mut found = 0usize;
    for field in fields {
        let entry = object.get(field).cloned().unwrap_or(Value::Null);
        if !entry.is_null() {
            found += 1;
        }
        data.insert(field.clone(), entry);
    }

    let confidence = object
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| {
            if fields.is_empty() {
                0.0
            } else {
                found as f64 / fields.len() as f64
            }
        })
        .clamp(0.0, 1.0);

    Ok(ExtractedFields { data, confidence })
}
