//! # Autoflow Core
//!
//! Orchestration core for a fixed four-stage agent pipeline: typed shared
//! state with merge-on-write, supervisor routing on failure, SQLite
//! checkpoints with resume, and collaboration sessions between agents.
//!
//! ## Architecture
//!
//! - `state/` - Shared state, collaboration sessions, checkpoint storage
//! - `pipeline/` - Agent nodes, routers, supervisor, engine and registry
//! - `config` - Engine configuration
//! - `error` - Errors surfaced by orchestration calls
//!
//! ## Usage
//!
//! ```rust,ignore
//! use autoflow_core::{EngineConfig, Run, Platform, Stage, WorkflowEngine};
//!
//! let engine = WorkflowEngine::builder(EngineConfig::from_env())
//!     .agent(Stage::Planning, Arc::new(Planner))
//!     .agent(Stage::Generation, Arc::new(Generator))
//!     .agent(Stage::Execution, Arc::new(Tester))
//!     .agent(Stage::Reporting, Arc::new(Reporter))
//!     .build()?;
//! let outcome = engine.execute(Run::new("42", "Send an email", Platform::Web)).await?;
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod state;

pub use config::EngineConfig;
pub use error::{ErrorClass, OrchestratorError, Result};
pub use pipeline::{AgentLogic, EngineRegistry, RunOutcome, WorkflowEngine};
pub use state::{NodeId, Platform, Run, SharedState, Stage, StateUpdate};
