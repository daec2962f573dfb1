//! # Pipeline Events
//!
//! Progress events emitted while a run executes. Hosts subscribe through
//! [`ChannelExecutionLog`](super::node::ChannelExecutionLog) or the engine's
//! event channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of pipeline event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
    /// Run started (fresh or resumed)
    RunStarted,
    /// Agent started working
    AgentStarted,
    /// Agent completed successfully
    AgentCompleted,
    /// Agent failed
    AgentFailed,
    /// Supervisor chose the next node
    SupervisorDecided,
    /// Checkpoint written
    CheckpointSaved,
    /// Checkpoint write failed and the run lost durability
    PersistenceLost,
    /// Run reached a terminal node
    RunCompleted,
    /// Run terminated with failure
    RunFailed,
}

/// An event in a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: PipelineEventKind,
    pub run_id: String,
    /// Node or agent that produced this event
    pub agent: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl PipelineEvent {
    pub fn new(kind: PipelineEventKind, run_id: &str, agent: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            run_id: run_id.to_string(),
            agent: agent.to_string(),
            data: None,
        }
    }

    /// Add data to the event
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}
