//! # Pipeline Orchestration
//!
//! Runs the fixed agent pipeline with supervisor fallback and checkpoints.
//!
//! ## Pipeline Flow
//!
//! ```text
//! Planning → Generation → Execution → Reporting → End
//!     ↘          ↘           ↘
//!              Supervisor → {Generation, Execution, Reporting, End}
//! ```

pub mod engine;
pub mod events;
pub mod graph;
pub mod node;
pub mod registry;
pub mod router;
pub mod supervisor;

pub use engine::{EngineBuilder, ExecutionAttempt, RunOutcome, WorkflowEngine};
pub use events::{PipelineEvent, PipelineEventKind};
pub use graph::{CompiledGraph, GraphInfo, WorkflowGraph};
pub use node::{
    AgentLogic, AgentNode, ChannelExecutionLog, ExecutionLog, ExecutionRecord, ExecutionStatus,
    SqliteExecutionLog, TracingExecutionLog,
};
pub use registry::{EngineRegistry, RegistryStats};
pub use supervisor::{Decision, Supervisor};
