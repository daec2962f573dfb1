//! # Shared State
//!
//! The single record threaded through every node of a run. Nodes never see
//! it mutably: they return a [`StateUpdate`] and the node wrapper merges it.
//! Merging only adds or overwrites, so every field present before a node
//! runs is still present afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::collaboration::{CollaborationOp, CollaborationSession, MessageKind};
use super::tools::{ToolExecution, ToolOp};
use crate::error::{OrchestratorError, Result};

/// A pipeline stage, in execution order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Document analysis and blueprint
    Planning,
    /// Script generation
    Generation,
    /// Environment setup and script execution
    Execution,
    /// Final report
    Reporting,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Planning,
        Stage::Generation,
        Stage::Execution,
        Stage::Reporting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Generation => "generation",
            Self::Execution => "execution",
            Self::Reporting => "reporting",
        }
    }

    /// The stage that follows this one, `None` after reporting
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Planning => Some(Self::Generation),
            Self::Generation => Some(Self::Execution),
            Self::Execution => Some(Self::Reporting),
            Self::Reporting => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node of the fixed workflow graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    Planning,
    Generation,
    Execution,
    Reporting,
    Supervisor,
    /// Terminal pseudo-node
    End,
}

impl NodeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Generation => "generation",
            Self::Execution => "execution",
            Self::Reporting => "reporting",
            Self::Supervisor => "supervisor",
            Self::End => "end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planning" => Some(Self::Planning),
            "generation" => Some(Self::Generation),
            "execution" => Some(Self::Execution),
            "reporting" => Some(Self::Reporting),
            "supervisor" => Some(Self::Supervisor),
            "end" => Some(Self::End),
            _ => None,
        }
    }

    /// The stage this node runs, if it is a stage node
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Planning => Some(Stage::Planning),
            Self::Generation => Some(Stage::Generation),
            Self::Execution => Some(Stage::Execution),
            Self::Reporting => Some(Stage::Reporting),
            Self::Supervisor | Self::End => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == Self::End
    }
}

impl From<Stage> for NodeId {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Planning => Self::Planning,
            Stage::Generation => Self::Generation,
            Stage::Execution => Self::Execution,
            Stage::Reporting => Self::Reporting,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-agent execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses only move forward: pending → running → completed | failed
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        match (self, next) {
            (a, b) if *a == b => true,
            (Self::Pending, _) => true,
            (Self::Running, Self::Completed | Self::Failed) => true,
            _ => false,
        }
    }
}

/// Target platform of the automation script
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Web,
    Mobile,
    #[default]
    Auto,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Mobile => "mobile",
            Self::Auto => "auto",
        }
    }
}

/// Overall state of the run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Initiated,
    Running,
    Completed,
    Failed,
}

/// Immutable inputs of one pipeline execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: String,
    pub thread_id: String,
    pub checkpoint_namespace: String,
    pub instruction: String,
    pub platform: Platform,
    #[serde(default)]
    pub document_ref: Option<String>,
}

impl Run {
    /// New run addressed as thread `workflow_<run_id>`, namespace `task-<run_id>`
    pub fn new(run_id: impl Into<String>, instruction: &str, platform: Platform) -> Self {
        let run_id = run_id.into();
        Self {
            thread_id: format!("workflow_{}", run_id),
            checkpoint_namespace: format!("task-{}", run_id),
            run_id,
            instruction: instruction.to_string(),
            platform,
            document_ref: None,
        }
    }

    pub fn with_document(mut self, document_ref: &str) -> Self {
        self.document_ref = Some(document_ref.to_string());
        self
    }

    pub fn with_thread(mut self, thread_id: &str) -> Self {
        self.thread_id = thread_id.to_string();
        self
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.checkpoint_namespace = namespace.to_string();
        self
    }
}

/// Category of a recorded error
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Agent logic returned an error
    Domain,
    /// Agent logic exceeded the node timeout
    Timeout,
    /// Agent misused the collaboration protocol or status lifecycle
    Protocol,
    /// Checkpoint or logging infrastructure failed
    Infrastructure,
    /// Supervisor stopped rerouting
    RetryLimit,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub source_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WarningRecord {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub source_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A routing decision made by the supervisor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorDecision {
    pub decision_id: u32,
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub reason: String,
    /// Retry count after this visit
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Self-assessment attached by an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentReview {
    pub confidence: f64,
    #[serde(default)]
    pub notes: Value,
    pub reviewed_at: DateTime<Utc>,
}

/// Partial update returned by agent logic
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    /// Replaces the agent's output slot
    pub output: Option<Value>,
    /// Added to (or overwriting) `SharedState::extras`
    pub extras: BTreeMap<String, Value>,
    /// Non-fatal observations, recorded as warnings
    pub warnings: Vec<String>,
    /// `(confidence, notes)`
    pub review: Option<(f64, Value)>,
    /// Collaboration steps, applied in order
    pub collaboration: Vec<CollaborationOp>,
    /// Tool invocations made by the agent, applied in order
    pub tools: Vec<ToolOp>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extras.insert(key.to_string(), value);
        self
    }

    pub fn with_warning(mut self, message: &str) -> Self {
        self.warnings.push(message.to_string());
        self
    }

    pub fn with_review(mut self, confidence: f64, notes: Value) -> Self {
        self.review = Some((confidence, notes));
        self
    }

    pub fn start_collaboration(mut self, requesting: &str, target: &str, request: Value) -> Self {
        self.collaboration.push(CollaborationOp::Start {
            requesting_agent: requesting.to_string(),
            target_agent: target.to_string(),
            request,
        });
        self
    }

    pub fn collaboration_message(
        mut self,
        from: &str,
        to: &str,
        kind: MessageKind,
        content: Value,
    ) -> Self {
        self.collaboration.push(CollaborationOp::Message {
            session_id: None,
            from: from.to_string(),
            to: to.to_string(),
            kind,
            content,
        });
        self
    }

    pub fn start_tool(mut self, tool_name: &str, input: Value) -> Self {
        self.tools.push(ToolOp::Start {
            tool_name: tool_name.to_string(),
            input,
        });
        self
    }

    /// Close a tool execution; `None` closes the agent's latest active one
    pub fn finish_tool(
        mut self,
        execution_id: Option<&str>,
        success: bool,
        output: Option<Value>,
    ) -> Self {
        self.tools.push(ToolOp::Finish {
            execution_id: execution_id.map(str::to_string),
            success,
            output,
        });
        self
    }

    pub fn end_collaboration(mut self, success: bool, resolution: Option<&str>) -> Self {
        self.collaboration.push(CollaborationOp::End {
            session_id: None,
            success,
            resolution: resolution.map(str::to_string),
        });
        self
    }
}

/// The state record carried through a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SharedState {
    // Identification (never mutated by nodes)
    pub run_id: String,
    pub thread_id: String,
    pub checkpoint_namespace: String,
    pub instruction: String,
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ref: Option<String>,

    // Per-agent status
    pub planning_status: AgentStatus,
    pub generation_status: AgentStatus,
    pub execution_status: AgentStatus,
    pub reporting_status: AgentStatus,

    // Per-agent output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_code: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testing_results: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_report: Option<Value>,

    // Execution tracking
    pub workflow_status: WorkflowStatus,
    #[serde(default)]
    pub routing_history: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_node: Option<NodeId>,
    pub retry_count: u32,
    pub max_retries: u32,

    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    #[serde(default)]
    pub warnings: Vec<WarningRecord>,
    #[serde(default)]
    pub collaboration_sessions: Vec<CollaborationSession>,
    #[serde(default)]
    pub supervisor_decisions: Vec<SupervisorDecision>,
    #[serde(default)]
    pub tool_executions: Vec<ToolExecution>,
    /// Node chosen by the latest supervisor decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_agent: Option<NodeId>,

    #[serde(default)]
    pub agent_reviews: BTreeMap<String, AgentReview>,
    #[serde(default)]
    pub quality_scores: BTreeMap<String, f64>,
    /// Free-form fields added by agents
    #[serde(default)]
    pub extras: BTreeMap<String, Value>,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SharedState {
    /// Initial state for a run: every agent pending
    pub fn new(run: &Run, max_retries: u32) -> Self {
        Self {
            run_id: run.run_id.clone(),
            thread_id: run.thread_id.clone(),
            checkpoint_namespace: run.checkpoint_namespace.clone(),
            instruction: run.instruction.clone(),
            platform: run.platform,
            document_ref: run.document_ref.clone(),
            planning_status: AgentStatus::Pending,
            generation_status: AgentStatus::Pending,
            execution_status: AgentStatus::Pending,
            reporting_status: AgentStatus::Pending,
            blueprint: None,
            generated_code: None,
            testing_results: None,
            final_report: None,
            workflow_status: WorkflowStatus::Initiated,
            routing_history: Vec::new(),
            current_node: None,
            previous_node: None,
            retry_count: 0,
            max_retries,
            errors: Vec::new(),
            warnings: Vec::new(),
            collaboration_sessions: Vec::new(),
            supervisor_decisions: Vec::new(),
            tool_executions: Vec::new(),
            next_agent: None,
            agent_reviews: BTreeMap::new(),
            quality_scores: BTreeMap::new(),
            extras: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn status(&self, stage: Stage) -> AgentStatus {
        match stage {
            Stage::Planning => self.planning_status,
            Stage::Generation => self.generation_status,
            Stage::Execution => self.execution_status,
            Stage::Reporting => self.reporting_status,
        }
    }

    fn status_mut(&mut self, stage: Stage) -> &mut AgentStatus {
        match stage {
            Stage::Planning => &mut self.planning_status,
            Stage::Generation => &mut self.generation_status,
            Stage::Execution => &mut self.execution_status,
            Stage::Reporting => &mut self.reporting_status,
        }
    }

    /// Move an agent's status forward. Regressions are rejected and leave
    /// the status unchanged.
    pub fn set_status(&mut self, stage: Stage, next: AgentStatus) -> Result<()> {
        let slot = self.status_mut(stage);
        if !slot.can_transition_to(next) {
            return Err(OrchestratorError::StatusRegression {
                agent: stage.as_str().to_string(),
                from: slot.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        *slot = next;
        Ok(())
    }

    pub fn output(&self, stage: Stage) -> Option<&Value> {
        match stage {
            Stage::Planning => self.blueprint.as_ref(),
            Stage::Generation => self.generated_code.as_ref(),
            Stage::Execution => self.testing_results.as_ref(),
            Stage::Reporting => self.final_report.as_ref(),
        }
    }

    fn output_mut(&mut self, stage: Stage) -> &mut Option<Value> {
        match stage {
            Stage::Planning => &mut self.blueprint,
            Stage::Generation => &mut self.generated_code,
            Stage::Execution => &mut self.testing_results,
            Stage::Reporting => &mut self.final_report,
        }
    }

    /// Merge an agent's partial update. Either the whole update applies or,
    /// on a collaboration protocol error, none of it does.
    pub fn apply_update(&mut self, stage: Stage, update: StateUpdate) -> Result<()> {
        let mut merged = self.clone();
        let agent = stage.as_str();

        if let Some(output) = update.output {
            *merged.output_mut(stage) = Some(output);
        }

        merged.extras.extend(update.extras);

        for message in update.warnings {
            merged.add_warning(ErrorKind::Domain, &message, Some(agent));
        }

        if let Some((confidence, notes)) = update.review {
            merged.add_review(agent, confidence, notes);
        }

        for op in update.collaboration {
            merged.apply_collaboration_op(op)?;
        }

        for op in update.tools {
            merged.apply_tool_op(agent, op)?;
        }

        *self = merged;
        Ok(())
    }

    fn apply_collaboration_op(&mut self, op: CollaborationOp) -> Result<()> {
        match op {
            CollaborationOp::Start {
                requesting_agent,
                target_agent,
                request,
            } => {
                self.start_collaboration(&requesting_agent, &target_agent, request);
                Ok(())
            }
            CollaborationOp::Message {
                session_id,
                from,
                to,
                kind,
                content,
            } => self
                .collaboration_mut(session_id.as_deref())?
                .append_message(&from, &to, kind, content)
                .map(|_| ()),
            CollaborationOp::End {
                session_id,
                success,
                resolution,
            } => self
                .collaboration_mut(session_id.as_deref())?
                .end(success, resolution),
        }
    }

    fn apply_tool_op(&mut self, agent: &str, op: ToolOp) -> Result<()> {
        match op {
            ToolOp::Start { tool_name, input } => {
                self.log_tool_execution(agent, &tool_name, input);
                Ok(())
            }
            ToolOp::Finish {
                execution_id,
                success,
                output,
            } => {
                let execution = match execution_id {
                    Some(id) => self.tool_execution_mut(&id)?,
                    None => self
                        .tool_executions
                        .iter_mut()
                        .rev()
                        .find(|e| e.agent == agent && e.is_active())
                        .ok_or_else(|| {
                            OrchestratorError::ToolExecutionNotFound(format!(
                                "no active tool execution for {}",
                                agent
                            ))
                        })?,
                };
                execution.finish(success, output)
            }
        }
    }

    // =========================================================================
    // Tool executions
    // =========================================================================

    /// Record a started tool execution and return it
    pub fn log_tool_execution(
        &mut self,
        agent: &str,
        tool_name: &str,
        input: Value,
    ) -> &ToolExecution {
        let execution_id = format!("tool_{}", self.tool_executions.len() + 1);
        tracing::info!(
            run_id = %self.run_id,
            execution_id = %execution_id,
            "Tool execution started: {}.{}",
            agent,
            tool_name
        );
        self.tool_executions
            .push(ToolExecution::start(execution_id, agent, tool_name, input));
        &self.tool_executions[self.tool_executions.len() - 1]
    }

    pub fn tool_execution_mut(&mut self, execution_id: &str) -> Result<&mut ToolExecution> {
        self.tool_executions
            .iter_mut()
            .find(|e| e.execution_id == execution_id)
            .ok_or_else(|| OrchestratorError::ToolExecutionNotFound(execution_id.to_string()))
    }

    /// Executions that have started but not finished
    pub fn active_tools(&self) -> impl Iterator<Item = &ToolExecution> {
        self.tool_executions.iter().filter(|e| e.is_active())
    }

    // =========================================================================
    // Collaboration
    // =========================================================================

    /// Open a collaboration session and return it
    pub fn start_collaboration(
        &mut self,
        requesting_agent: &str,
        target_agent: &str,
        request: Value,
    ) -> &CollaborationSession {
        let session_id = format!("collab_{}", self.collaboration_sessions.len() + 1);
        tracing::info!(
            run_id = %self.run_id,
            session_id = %session_id,
            "Collaboration started: {} <-> {}",
            requesting_agent,
            target_agent
        );
        self.collaboration_sessions.push(CollaborationSession::start(
            session_id,
            requesting_agent,
            target_agent,
            request,
        ));
        &self.collaboration_sessions[self.collaboration_sessions.len() - 1]
    }

    /// Session by id, or the latest session when `session_id` is `None`
    pub fn collaboration_mut(
        &mut self,
        session_id: Option<&str>,
    ) -> Result<&mut CollaborationSession> {
        match session_id {
            Some(id) => self
                .collaboration_sessions
                .iter_mut()
                .find(|s| s.session_id == id)
                .ok_or_else(|| OrchestratorError::SessionNotFound(id.to_string())),
            None => self
                .collaboration_sessions
                .last_mut()
                .ok_or(OrchestratorError::NoActiveSession),
        }
    }

    pub fn active_collaboration(&self) -> Option<&CollaborationSession> {
        self.collaboration_sessions.iter().rev().find(|s| s.is_active())
    }

    pub fn has_active_collaboration(&self) -> bool {
        self.active_collaboration().is_some()
    }

    // =========================================================================
    // Records
    // =========================================================================

    pub fn add_error(&mut self, kind: ErrorKind, message: &str, source_agent: Option<&str>) {
        tracing::error!(
            run_id = %self.run_id,
            kind = ?kind,
            agent = source_agent.unwrap_or("-"),
            "{}",
            message
        );
        self.errors.push(ErrorRecord {
            kind,
            message: message.to_string(),
            source_agent: source_agent.map(str::to_string),
            timestamp: Utc::now(),
        });
    }

    pub fn add_warning(&mut self, kind: ErrorKind, message: &str, source_agent: Option<&str>) {
        tracing::warn!(
            run_id = %self.run_id,
            kind = ?kind,
            agent = source_agent.unwrap_or("-"),
            "{}",
            message
        );
        self.warnings.push(WarningRecord {
            kind,
            message: message.to_string(),
            source_agent: source_agent.map(str::to_string),
            timestamp: Utc::now(),
        });
    }

    pub fn add_review(&mut self, agent: &str, confidence: f64, notes: Value) {
        self.agent_reviews.insert(
            agent.to_string(),
            AgentReview {
                confidence,
                notes,
                reviewed_at: Utc::now(),
            },
        );
        self.quality_scores.insert(agent.to_string(), confidence);
    }

    /// Record a supervisor decision and make it the current routing choice
    pub fn add_supervisor_decision(
        &mut self,
        from_node: NodeId,
        to_node: NodeId,
        reason: &str,
    ) -> &SupervisorDecision {
        let decision = SupervisorDecision {
            decision_id: self.supervisor_decisions.len() as u32 + 1,
            from_node,
            to_node,
            reason: reason.to_string(),
            retry_count: self.retry_count,
            timestamp: Utc::now(),
        };
        tracing::info!(
            run_id = %self.run_id,
            "Supervisor decision: {} -> {} ({})",
            from_node,
            to_node,
            reason
        );
        self.supervisor_decisions.push(decision);
        self.next_agent = Some(to_node);
        &self.supervisor_decisions[self.supervisor_decisions.len() - 1]
    }

    /// Record that a node is about to run
    pub fn record_visit(&mut self, node: NodeId) {
        self.previous_node = self.current_node;
        self.current_node = Some(node);
        self.routing_history.push(node);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
        tracing::info!(
            run_id = %self.run_id,
            "Retry count incremented: {}/{}",
            self.retry_count,
            self.max_retries
        );
    }

    /// Testing reported failure and retries remain
    pub fn is_collaboration_needed(&self) -> bool {
        let testing_failed = self
            .testing_results
            .as_ref()
            .map(|r| !r.get("success").and_then(Value::as_bool).unwrap_or(false))
            .unwrap_or(false);
        testing_failed && self.should_retry()
    }

    /// Number of supervisor visits so far
    pub fn supervisor_visits(&self) -> usize {
        self.routing_history
            .iter()
            .filter(|n| **n == NodeId::Supervisor)
            .count()
    }

    /// Last stage node that ran
    pub fn last_stage(&self) -> Option<Stage> {
        self.routing_history.iter().rev().find_map(NodeId::stage)
    }

    pub fn has_visited(&self, node: NodeId) -> bool {
        self.routing_history.contains(&node)
    }

    pub fn all_completed(&self) -> bool {
        Stage::ALL
            .iter()
            .all(|s| self.status(*s) == AgentStatus::Completed)
    }

    /// Top-level field names plus `extras.<key>` entries, as serialized
    pub fn field_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        if let Ok(Value::Object(map)) = serde_json::to_value(self) {
            keys.extend(map.keys().cloned());
        }
        keys.extend(self.extras.keys().map(|k| format!("extras.{}", k)));
        keys
    }

    pub fn summary(&self) -> StateSummary {
        let now = Utc::now();
        StateSummary {
            run_id: self.run_id.clone(),
            platform: self.platform,
            workflow_status: self.workflow_status,
            current_node: self.current_node,
            retry_count: self.retry_count,
            routing_history: self.routing_history.clone(),
            agent_statuses: Stage::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), self.status(*s)))
                .collect(),
            outputs_present: Stage::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), self.output(*s).is_some()))
                .collect(),
            collaboration_active: self.has_active_collaboration(),
            collaboration_count: self.collaboration_sessions.len(),
            tool_execution_count: self.tool_executions.len(),
            active_tool_count: self.active_tools().count(),
            supervisor_visits: self.supervisor_visits(),
            error_count: self.errors.len(),
            warning_count: self.warnings.len(),
            quality_scores: self.quality_scores.clone(),
            total_duration_secs: self
                .started_at
                .map(|start| {
                    (self.completed_at.unwrap_or(now) - start).num_milliseconds() as f64 / 1000.0
                })
                .unwrap_or(0.0),
        }
    }
}

/// Compact view of a state for status endpoints and logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSummary {
    pub run_id: String,
    pub platform: Platform,
    pub workflow_status: WorkflowStatus,
    pub current_node: Option<NodeId>,
    pub retry_count: u32,
    pub routing_history: Vec<NodeId>,
    pub agent_statuses: BTreeMap<String, AgentStatus>,
    pub outputs_present: BTreeMap<String, bool>,
    pub collaboration_active: bool,
    pub collaboration_count: usize,
    pub tool_execution_count: usize,
    pub active_tool_count: usize,
    pub supervisor_visits: usize,
    pub error_count: usize,
    pub warning_count: usize,
    pub quality_scores: BTreeMap<String, f64>,
    pub total_duration_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tools::ToolStatus;
    use serde_json::json;

    fn state() -> SharedState {
        let run = Run::new("123", "Send an email via Outlook", Platform::Mobile)
            .with_document("docs/outlook.pdf");
        SharedState::new(&run, 3)
    }

    #[test]
    fn test_initial_state() {
        let state = state();
        for stage in Stage::ALL {
            assert_eq!(state.status(stage), AgentStatus::Pending);
        }
        assert_eq!(state.thread_id, "workflow_123");
        assert_eq!(state.checkpoint_namespace, "task-123");
        assert_eq!(state.workflow_status, WorkflowStatus::Initiated);
        assert!(state.routing_history.is_empty());
    }

    #[test]
    fn test_status_transitions() {
        let mut state = state();
        state.set_status(Stage::Planning, AgentStatus::Running).unwrap();
        state.set_status(Stage::Planning, AgentStatus::Completed).unwrap();

        let err = state
            .set_status(Stage::Planning, AgentStatus::Pending)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::StatusRegression { .. }));
        assert!(state.set_status(Stage::Planning, AgentStatus::Running).is_err());
        assert!(state.set_status(Stage::Planning, AgentStatus::Failed).is_err());
        assert_eq!(state.planning_status, AgentStatus::Completed);

        // Pending may jump straight to a terminal status
        state.set_status(Stage::Generation, AgentStatus::Failed).unwrap();
    }

    #[test]
    fn test_apply_update_only_adds_keys() {
        let mut state = state();
        state.extras.insert("additional".into(), json!({"test": true}));
        let before = state.field_keys();

        state
            .apply_update(
                Stage::Planning,
                StateUpdate::new()
                    .with_output(json!({"target_application": "outlook"}))
                    .with_extra("planning_completed_at", json!("now"))
                    .with_review(0.9, json!({"ui_elements": 4})),
            )
            .unwrap();

        let after = state.field_keys();
        assert!(after.is_superset(&before));
        assert!(after.contains("blueprint"));
        assert!(after.contains("extras.planning_completed_at"));
        assert_eq!(state.quality_scores.get("planning"), Some(&0.9));
        assert_eq!(state.run_id, "123");
    }

    #[test]
    fn test_apply_update_is_atomic_on_protocol_error() {
        let mut state = state();
        let before = state.clone();

        // Message without any session
        let err = state
            .apply_update(
                Stage::Execution,
                StateUpdate::new()
                    .with_output(json!({"success": false}))
                    .collaboration_message("execution", "generation", MessageKind::Note, json!({})),
            )
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::NoActiveSession));
        assert_eq!(state, before);
    }

    #[test]
    fn test_collaboration_through_updates() {
        let mut state = state();
        state
            .apply_update(
                Stage::Execution,
                StateUpdate::new()
                    .start_collaboration(
                        "execution",
                        "generation",
                        json!({"error": "Element not found"}),
                    )
                    .collaboration_message(
                        "execution",
                        "generation",
                        MessageKind::DefectReport,
                        json!({"selector": "#compose"}),
                    ),
            )
            .unwrap();

        assert!(state.has_active_collaboration());
        assert_eq!(state.collaboration_sessions[0].session_id, "collab_1");

        state
            .apply_update(
                Stage::Generation,
                StateUpdate::new().end_collaboration(true, Some("Code fixed")),
            )
            .unwrap();
        assert!(!state.has_active_collaboration());

        // Sealed: a later message fails and the session is unchanged
        let sealed = state.collaboration_sessions[0].clone();
        let err = state
            .apply_update(
                Stage::Execution,
                StateUpdate::new().collaboration_message(
                    "execution",
                    "generation",
                    MessageKind::FixResult,
                    json!({}),
                ),
            )
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::SessionSealed(_)));
        assert_eq!(state.collaboration_sessions[0], sealed);
    }

    #[test]
    fn test_unknown_session_id() {
        let mut state = state();
        state.start_collaboration("execution", "generation", json!({}));
        let err = state.collaboration_mut(Some("collab_9")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_supervisor_decision_sets_next_agent() {
        let mut state = state();
        state.increment_retry();
        let decision = state
            .add_supervisor_decision(NodeId::Generation, NodeId::Execution, "generation failed")
            .clone();

        assert_eq!(decision.decision_id, 1);
        assert_eq!(decision.retry_count, 1);
        assert_eq!(state.next_agent, Some(NodeId::Execution));
    }

    #[test]
    fn test_collaboration_needed() {
        let mut state = state();
        assert!(!state.is_collaboration_needed());

        state.testing_results = Some(json!({"success": false}));
        assert!(state.is_collaboration_needed());

        state.retry_count = 3;
        assert!(!state.is_collaboration_needed());
    }

    #[test]
    fn test_tool_executions_through_updates() {
        let mut state = state();
        state
            .apply_update(
                Stage::Execution,
                StateUpdate::new()
                    .start_tool("launch_app", json!({"package": "com.microsoft.outlook"}))
                    .finish_tool(None, true, Some(json!({"pid": 4242})))
                    .start_tool("tap_element", json!({"selector": "#compose"})),
            )
            .unwrap();

        assert_eq!(state.tool_executions.len(), 2);
        assert_eq!(state.tool_executions[0].execution_id, "tool_1");
        assert_eq!(state.tool_executions[0].status, ToolStatus::Completed);
        assert_eq!(state.tool_executions[0].agent, "execution");
        let active: Vec<&str> = state.active_tools().map(|e| e.tool_name.as_str()).collect();
        assert_eq!(active, vec!["tap_element"]);

        let summary = state.summary();
        assert_eq!(summary.tool_execution_count, 2);
        assert_eq!(summary.active_tool_count, 1);

        // Another agent cannot implicitly close execution's tool
        let before = state.clone();
        let err = state
            .apply_update(
                Stage::Reporting,
                StateUpdate::new()
                    .with_output(json!({"summary": "x"}))
                    .finish_tool(None, true, None),
            )
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ToolExecutionNotFound(_)));
        assert_eq!(state, before);

        state
            .apply_update(
                Stage::Execution,
                StateUpdate::new().finish_tool(Some("tool_2"), false, None),
            )
            .unwrap();
        assert_eq!(state.active_tools().count(), 0);

        // Finished executions stay finished
        let err = state
            .apply_update(
                Stage::Execution,
                StateUpdate::new().finish_tool(Some("tool_1"), false, None),
            )
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ToolExecutionFinished(_)));
        assert_eq!(state.tool_executions[0].status, ToolStatus::Completed);
    }

    #[test]
    fn test_visits_and_summary() {
        let mut state = state();
        state.record_visit(NodeId::Planning);
        state.record_visit(NodeId::Supervisor);
        state.record_visit(NodeId::Generation);

        assert_eq!(state.previous_node, Some(NodeId::Supervisor));
        assert_eq!(state.last_stage(), Some(Stage::Generation));
        assert_eq!(state.supervisor_visits(), 1);

        let summary = state.summary();
        assert_eq!(summary.routing_history.len(), 3);
        assert_eq!(summary.agent_statuses["planning"], AgentStatus::Pending);
    }

    #[test]
    fn test_state_json_round_trip() {
        let mut state = state();
        state.record_visit(NodeId::Planning);
        state.add_error(ErrorKind::Domain, "boom", Some("planning"));

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"routing_history\":[\"planning\"]"));
        let back: SharedState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_node_id_parse() {
        for node in [
            NodeId::Planning,
            NodeId::Generation,
            NodeId::Execution,
            NodeId::Reporting,
            NodeId::Supervisor,
            NodeId::End,
        ] {
            assert_eq!(NodeId::parse(node.as_str()), Some(node));
        }
        assert_eq!(NodeId::parse("agent5"), None);
        assert_eq!(NodeId::from(Stage::Execution).stage(), Some(Stage::Execution));
    }
}
