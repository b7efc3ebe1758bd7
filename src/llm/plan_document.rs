//! Defensive parsing of assistant-drafted plan documents.
//!
//! Assistants wrap JSON in prose or markdown fences often enough that the
//! parser tries the raw text, then a fenced block, then the outermost braces
//! before giving up. The extracted value is checked against a fixed schema.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Plan document errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanDocumentError {
    #[error("Empty plan document")]
    Empty,
    #[error("No JSON object found in plan document: {0}")]
    NotJson(String),
    #[error("Plan document schema violation: {0}")]
    Schema(String),
}

/// One phase of a drafted plan
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PlanPhase {
    pub id: String,
    pub title: String,
    pub description: String,
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub estimated_minutes: Option<f64>,
    #[serde(default)]
    pub complexity: Option<f64>,
}

/// Drafted plan: a goal and ordered phases
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PlanDocument {
    pub goal: String,
    pub phases: Vec<PlanPhase>,
}

/// Pull the first parseable JSON object out of free-form text
pub fn extract_json_value(content: &str) -> Option<Value> {
    let content = content.trim();
    if content.is_empty() {
        return None;
    }

    if let Ok(parsed) = serde_json::from_str::<Value>(content) {
        return Some(parsed);
    }

    for fence in ["```json", "```"] {
        if let Some(start) = content.find(fence) {
            let body = &content[start + fence.len()..];
            if let Some(end) = body.find("```")
                && let Ok(parsed) = serde_json::from_str::<Value>(body[..end].trim())
            {
                return Some(parsed);
            }
        }
    }

    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&content[start..=end]).ok()
}

fn require_string(object: &Value, field: &str, context: &str) -> Result<(), PlanDocumentError> {
    match object.get(field).and_then(Value::as_str) {
        Some(value) if !value.trim().is_empty() => Ok(()),
        _ => Err(PlanDocumentError::Schema(format!(
            "{} requires a non-empty string '{}'",
            context, field
        ))),
    }
}

/// Check the fixed schema: `goal`, and `phases[]` each with `id`, `title`,
/// `description` and `required_capabilities[]`
pub fn validate_plan_schema(document: &Value) -> Result<(), PlanDocumentError> {
    if !document.is_object() {
        return Err(PlanDocumentError::Schema(
            "document must be a JSON object".to_string(),
        ));
    }
    require_string(document, "goal", "document")?;

    let phases = document
        .get("phases")
        .and_then(Value::as_array)
        .ok_or_else(|| PlanDocumentError::Schema("'phases' must be an array".to_string()))?;
    if phases.is_empty() {
        return Err(PlanDocumentError::Schema(
            "'phases' must not be empty".to_string(),
        ));
    }

    for (index, phase) in phases.iter().enumerate() {
        let context = format!("phase {}", index);
        for field in ["id", "title", "description"] {
            require_string(phase, field, &context)?;
        }
        let capabilities = phase
            .get("required_capabilities")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                PlanDocumentError::Schema(format!(
                    "{} requires an array 'required_capabilities'",
                    context
                ))
            })?;
        if capabilities.iter().any(|c| !c.is_string()) {
            return Err(PlanDocumentError::Schema(format!(
                "{} has a non-string capability",
                context
            )));
        }
    }
    Ok(())
}

/// Extract, validate and deserialize a plan document
pub fn parse_plan_document(content: &str) -> Result<PlanDocument, PlanDocumentError> {
    if content.trim().is_empty() {
        return Err(PlanDocumentError::Empty);
    }
    let value = extract_json_value(content).ok_or_else(|| {
        PlanDocumentError::NotJson(content.chars().take(80).collect::<String>())
    })?;
    validate_plan_schema(&value)?;
    serde_json::from_value(value).map_err(|e| PlanDocumentError::Schema(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"{
        "goal": "Compare runtimes",
        "phases": [
            {"id": "collect", "title": "Collect", "description": "Gather benchmarks",
             "required_capabilities": ["web_search"]},
            {"id": "compare", "title": "Compare", "description": "Analyze numbers",
             "required_capabilities": ["analysis"], "depends_on": ["collect"]}
        ]
    }"#;

    #[test]
    fn test_parse_raw_json() {
        let document = parse_plan_document(DOCUMENT).unwrap();
        assert_eq!(document.goal, "Compare runtimes");
        assert_eq!(document.phases.len(), 2);
        assert_eq!(document.phases[1].depends_on, vec!["collect".to_string()]);
    }

    #[test]
    fn test_parse_fenced_and_wrapped_json() {
        let fenced = format!("Here is the plan:\n```json\n{}\n```\nGood luck!", DOCUMENT);
        assert!(parse_plan_document(&fenced).is_ok());

        let wrapped = format!("Sure. {} Let me know.", DOCUMENT);
        assert!(parse_plan_document(&wrapped).is_ok());
    }

    #[test]
    fn test_reject_schema_violations() {
        let missing_capabilities =
            r#"{"goal": "g", "phases": [{"id": "a", "title": "A", "description": "d"}]}"#;
        assert!(matches!(
            parse_plan_document(missing_capabilities),
            Err(PlanDocumentError::Schema(_))
        ));

        let no_phases = r#"{"goal": "g", "phases": []}"#;
        assert!(matches!(
            parse_plan_document(no_phases),
            Err(PlanDocumentError::Schema(_))
        ));

        let blank_goal = r#"{"goal": " ", "phases": []}"#;
        assert!(parse_plan_document(blank_goal).is_err());
    }

    #[test]
    fn test_reject_non_json() {
        assert_eq!(parse_plan_document("   "), Err(PlanDocumentError::Empty));
        assert!(matches!(
            parse_plan_document("I cannot help with that."),
            Err(PlanDocumentError::NotJson(_))
        ));
    }
}
