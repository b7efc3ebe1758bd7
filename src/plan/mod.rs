//! Plan data model and dependency resolution.

pub mod resolver;
pub mod types;

pub use resolver::{
    DependencyIssue, DependencyRelation, DependencyResolver, LevelSchedule, RelationKind,
    ResolvedSchedule, ResolverConfig, can_run_together,
};
pub use types::*;

#[cfg(test)]
mod tests;
