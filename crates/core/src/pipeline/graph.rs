//! # Workflow Graph
//!
//! The fixed topology: four stage nodes, the supervisor, and the routers
//! connecting them. A [`WorkflowGraph`] is built once per engine and then
//! compiled twice, with and without a checkpoint store, sharing the same
//! node definitions.

use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::engine::RunOutcome;
use super::events::{PipelineEvent, PipelineEventKind};
use super::node::{AgentLogic, AgentNode, ExecutionLog};
use super::router;
use super::supervisor::Supervisor;
use crate::error::{OrchestratorError, Result};
use crate::state::{
    AgentStatus, Checkpoint, CheckpointStore, ErrorKind, NodeId, SharedState, Stage,
    WorkflowStatus,
};

/// Node definitions of the pipeline
pub struct WorkflowGraph {
    nodes: BTreeMap<Stage, AgentNode>,
    supervisor: Supervisor,
}

impl WorkflowGraph {
    /// Wrap every stage's logic. Fails if any stage has no agent.
    pub fn build(
        mut agents: HashMap<Stage, Arc<dyn AgentLogic>>,
        log: Arc<dyn ExecutionLog>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let missing: Vec<&str> = Stage::ALL
            .iter()
            .filter(|stage| !agents.contains_key(*stage))
            .map(Stage::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(OrchestratorError::GraphBuild(format!(
                "missing agent for stage(s): {}",
                missing.join(", ")
            )));
        }

        let mut nodes = BTreeMap::new();
        for stage in Stage::ALL {
            if let Some(logic) = agents.remove(&stage) {
                nodes.insert(
                    stage,
                    AgentNode::new(stage, logic, Arc::clone(&log)).with_timeout(timeout),
                );
            }
        }

        Ok(Self {
            nodes,
            supervisor: Supervisor,
        })
    }

    pub fn entry(&self) -> NodeId {
        NodeId::Planning
    }

    /// Execute a single node
    pub async fn run_node(&self, node: NodeId, state: &SharedState) -> SharedState {
        match node {
            NodeId::Supervisor => self.supervisor.run(state),
            NodeId::End => state.clone(),
            stage_node => match stage_node.stage().and_then(|s| self.nodes.get(&s)) {
                Some(agent) => agent.run(state).await,
                None => state.clone(),
            },
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes
            .keys()
            .map(|s| NodeId::from(*s))
            .chain([NodeId::Supervisor])
            .collect()
    }
}

/// Description of a compiled graph
#[derive(Debug, Clone, Serialize)]
pub struct GraphInfo {
    pub entry: NodeId,
    pub nodes: Vec<NodeId>,
    pub agents_count: usize,
    pub checkpoint_enabled: bool,
    pub capabilities: Vec<&'static str>,
}

/// A [`WorkflowGraph`] bound to an optional checkpoint store
#[derive(Clone)]
pub struct CompiledGraph {
    graph: Arc<WorkflowGraph>,
    store: Option<Arc<dyn CheckpointStore>>,
    events: Option<mpsc::Sender<PipelineEvent>>,
}

impl CompiledGraph {
    pub fn new(graph: Arc<WorkflowGraph>, store: Option<Arc<dyn CheckpointStore>>) -> Self {
        Self {
            graph,
            store,
            events: None,
        }
    }

    /// Stream run-level events
    pub fn with_events(mut self, tx: Option<mpsc::Sender<PipelineEvent>>) -> Self {
        self.events = tx;
        self
    }

    pub fn is_durable(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Option<&Arc<dyn CheckpointStore>> {
        self.store.as_ref()
    }

    pub fn info(&self) -> GraphInfo {
        let mut capabilities = vec!["workflow_execution", "agent_coordination", "error_handling"];
        if self.is_durable() {
            capabilities.extend(["checkpoint_management", "state_recovery"]);
        } else {
            capabilities.push("memory_only");
        }
        GraphInfo {
            entry: self.graph.entry(),
            nodes: self.graph.node_ids(),
            agents_count: self.graph.nodes.len(),
            checkpoint_enabled: self.is_durable(),
            capabilities,
        }
    }

    /// Run from `start` until the end node.
    ///
    /// Fresh runs (`resume_from == None`) write an initial checkpoint before
    /// the first node; resumed runs chain onto the given checkpoint. A failed
    /// checkpoint write drops persistence for the rest of the run.
    pub async fn invoke(
        &self,
        mut state: SharedState,
        start: NodeId,
        resume_from: Option<&Checkpoint>,
    ) -> RunOutcome {
        let mut store = self.store.clone();
        let durable_at_start = store.is_some();
        let mut warnings = Vec::new();
        let mut checkpoints_written = 0;
        let mut step = resume_from.map(|c| c.step).unwrap_or(0);
        let mut parent_id = resume_from.map(|c| c.checkpoint_id.clone());

        if start != NodeId::End {
            state.workflow_status = WorkflowStatus::Running;
            state.started_at.get_or_insert_with(chrono::Utc::now);
        }

        self.emit(
            PipelineEvent::new(PipelineEventKind::RunStarted, &state.run_id, start.as_str())
                .with_data(json!({
                    "resumed": resume_from.is_some(),
                    "durable": durable_at_start,
                })),
        );

        if resume_from.is_none() {
            self.save(
                &mut store,
                &mut state,
                step,
                start,
                &mut parent_id,
                &mut checkpoints_written,
                &mut warnings,
            )
            .await;
        }

        let mut node = start;
        while node != NodeId::End {
            state.record_visit(node);
            state = self.graph.run_node(node, &state).await;
            step += 1;

            let next = router::next_node(node, &state);
            tracing::debug!(run_id = %state.run_id, step, "{} -> {}", node, next);

            if node == NodeId::Supervisor {
                if let Some(decision) = state.supervisor_decisions.last() {
                    let event = PipelineEvent::new(
                        PipelineEventKind::SupervisorDecided,
                        &state.run_id,
                        node.as_str(),
                    )
                    .with_data(json!({
                        "from_node": decision.from_node,
                        "to_node": decision.to_node,
                        "reason": decision.reason,
                    }));
                    self.emit(event);
                }
            }

            if next == NodeId::End {
                Self::finalize(&mut state);
            }

            self.save(
                &mut store,
                &mut state,
                step,
                next,
                &mut parent_id,
                &mut checkpoints_written,
                &mut warnings,
            )
            .await;

            node = next;
        }

        let kind = match state.workflow_status {
            WorkflowStatus::Failed => PipelineEventKind::RunFailed,
            _ => PipelineEventKind::RunCompleted,
        };
        self.emit(PipelineEvent::new(kind, &state.run_id, NodeId::End.as_str()));

        tracing::info!(
            run_id = %state.run_id,
            status = ?state.workflow_status,
            all_completed = state.all_completed(),
            steps = step,
            durable = store.is_some(),
            "Run finished"
        );

        RunOutcome {
            state,
            durable: store.is_some(),
            warnings,
            checkpoints_written,
            last_checkpoint_id: parent_id,
        }
    }

    fn finalize(state: &mut SharedState) {
        if state.workflow_status != WorkflowStatus::Failed {
            state.workflow_status = if state.reporting_status == AgentStatus::Completed {
                WorkflowStatus::Completed
            } else {
                WorkflowStatus::Failed
            };
        }
        state.completed_at = Some(chrono::Utc::now());
    }

    /// Write a checkpoint if persistence is still active
    #[allow(clippy::too_many_arguments)]
    async fn save(
        &self,
        store: &mut Option<Arc<dyn CheckpointStore>>,
        state: &mut SharedState,
        step: u32,
        next: NodeId,
        parent_id: &mut Option<String>,
        written: &mut u32,
        warnings: &mut Vec<String>,
    ) {
        let Some(active) = store.as_ref() else {
            return;
        };

        let checkpoint = Checkpoint::new(state, step, next, parent_id.clone());
        match active.put(&checkpoint).await {
            Ok(()) => {
                *written += 1;
                *parent_id = Some(checkpoint.checkpoint_id.clone());
                self.emit(
                    PipelineEvent::new(
                        PipelineEventKind::CheckpointSaved,
                        &state.run_id,
                        next.as_str(),
                    )
                    .with_data(json!({
                        "checkpoint_id": checkpoint.checkpoint_id,
                        "step": step,
                    })),
                );
            }
            Err(e) => {
                let message = format!(
                    "Checkpoint write failed, continuing without persistence: {:#}",
                    e
                );
                state.add_warning(ErrorKind::Infrastructure, &message, None);
                warnings.push(message.clone());
                *store = None;
                self.emit(
                    PipelineEvent::new(
                        PipelineEventKind::PersistenceLost,
                        &state.run_id,
                        next.as_str(),
                    )
                    .with_data(json!({ "error": message })),
                );
            }
        }
    }

    /// Non-blocking: a slow or gone consumer loses events, the run goes on
    fn emit(&self, event: PipelineEvent) {
        let Some(tx) = &self.events else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::debug!(kind = ?event.kind, "Event channel full, event dropped")
            }
            Err(TrySendError::Closed(_)) => tracing::debug!("Event channel closed"),
        }
    }
}
