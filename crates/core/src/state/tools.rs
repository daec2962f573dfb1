//! # Tool Executions
//!
//! Record of the tools an agent invoked while producing its output (a
//! device driver call, a template render, a browser action). An execution
//! starts as `started` and is closed exactly once as `completed` or
//! `failed`. Active tools are the executions still `started`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Started,
    Completed,
    Failed,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// One tool invocation made by an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolExecution {
    pub execution_id: String,
    pub agent: String,
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ToolExecution {
    pub fn start(
        execution_id: impl Into<String>,
        agent: &str,
        tool_name: &str,
        input: Value,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            agent: agent.to_string(),
            tool_name: tool_name.to_string(),
            input,
            status: ToolStatus::Started,
            output: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Close the execution with its result. A finished execution is never
    /// reopened or overwritten.
    pub fn finish(&mut self, success: bool, output: Option<Value>) -> Result<()> {
        if !self.is_active() {
            return Err(OrchestratorError::ToolExecutionFinished(
                self.execution_id.clone(),
            ));
        }

        self.status = if success {
            ToolStatus::Completed
        } else {
            ToolStatus::Failed
        };
        self.output = output;
        self.completed_at = Some(Utc::now());

        tracing::debug!(
            execution_id = %self.execution_id,
            agent = %self.agent,
            tool = %self.tool_name,
            status = self.status.as_str(),
            "Tool execution finished"
        );
        Ok(())
    }
}

/// Tool step reported by an agent as part of its state update.
///
/// `execution_id: None` addresses the agent's most recent active execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ToolOp {
    Start {
        tool_name: String,
        input: Value,
    },
    Finish {
        execution_id: Option<String>,
        success: bool,
        output: Option<Value>,
    },
}
