//! Planning-assistant collaborator contract and plan document parsing.

pub mod assistant;
pub mod plan_document;

pub use assistant::{AssistantError, PlanningAssistant, ScriptedAssistant};
pub use plan_document::{
    PlanDocument, PlanDocumentError, PlanPhase, extract_json_value, parse_plan_document,
    validate_plan_schema,
};
