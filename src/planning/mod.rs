//! Hierarchical planning: task classification, decomposition into steps,
//! plan validation and optimization, step adaptation and the plan cache.

pub mod adaptation;
pub mod cache;
pub mod classifier;
pub mod decomposer;
pub mod engine;
pub mod types;

pub use adaptation::{
    Adaptation, AdaptationConfig, AdaptationRequest, AssistedStepAdapter, RuleBasedAdapter,
    StepAdapter,
};
pub use cache::PlanCache;
pub use classifier::TaskClassifier;
pub use decomposer::{
    AssistedDecomposer, Decomposer, DecompositionError, DecompositionRequest, TemplateDecomposer,
    base_duration, fallback_steps, tool_for_capability,
};
pub use engine::HierarchicalPlanningEngine;
pub use types::*;
