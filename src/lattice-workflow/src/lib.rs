//! Deterministic MCP tool pipelines.
//!
//! A workflow is an ordered list of [`WorkflowStep`]s. Each step calls one
//! tool on a registered server with arguments templated from the running
//! context (`{{var.path}}`), may be guarded by a condition, and declares what
//! happens when it fails through its [`ErrorPolicy`]. Steps run strictly one
//! after another, so every step observes the context writes of the previous
//! one.

pub mod condition;
pub mod error;
pub mod orchestrator;
pub mod template;

pub use condition::ConditionError;
pub use error::{Result, WorkflowError};
pub use orchestrator::{
    ErrorPolicy, ExecutionOptions, HistoryEntry, WorkflowDefinition, WorkflowOrchestrator,
    WorkflowResult, WorkflowStep,
};
