pub mod checkpoints;
pub mod collaboration;
pub mod db;
pub mod shared;
pub mod tools;

pub use db::CheckpointDb;

pub use checkpoints::{Checkpoint, CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore};
pub use collaboration::{
    CollaborationMessage, CollaborationOp, CollaborationSession, MessageKind, SessionStatus,
};
pub use shared::{
    AgentReview, AgentStatus, ErrorKind, ErrorRecord, NodeId, Platform, Run, SharedState, Stage,
    StateSummary, StateUpdate, SupervisorDecision, WarningRecord, WorkflowStatus,
};
pub use tools::{ToolExecution, ToolOp, ToolStatus};
