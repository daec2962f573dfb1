//! # Workflow Engine
//!
//! Owns the compiled graphs of one workflow and the checkpoint capability.
//!
//! Persistence is decided once, in [`EngineBuilder::build`]: either a
//! checkpoint store could be opened and the durable graph is used, or the
//! engine runs the ephemeral graph and reports why in every outcome. Both
//! graphs share the same node definitions.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::events::PipelineEvent;
use super::graph::{CompiledGraph, GraphInfo, WorkflowGraph};
use super::node::{AgentLogic, ExecutionLog, TracingExecutionLog};
use crate::config::EngineConfig;
use crate::error::{OrchestratorError, Result};
use crate::state::{
    Checkpoint, CheckpointDb, CheckpointStore, ErrorKind, Run, SharedState, SqliteCheckpointStore,
    Stage, WorkflowStatus,
};

/// Result of executing or resuming a run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Terminal state
    pub state: SharedState,
    /// Persistence was still active when the run ended
    pub durable: bool,
    /// Infrastructure problems absorbed during the run
    pub warnings: Vec<String>,
    pub checkpoints_written: u32,
    /// Checkpoint holding the terminal state, if it was persisted
    pub last_checkpoint_id: Option<String>,
}

/// One entry of an engine's execution history
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionAttempt {
    pub run_id: String,
    pub thread_id: String,
    pub resumed: bool,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub workflow_status: WorkflowStatus,
    pub durable: bool,
    pub checkpoints_written: u32,
}

type StoreFactory =
    Box<dyn FnOnce(&EngineConfig) -> anyhow::Result<Arc<dyn CheckpointStore>> + Send>;

/// Builder for [`WorkflowEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    agents: HashMap<Stage, Arc<dyn AgentLogic>>,
    log: Option<Arc<dyn ExecutionLog>>,
    store_factory: Option<StoreFactory>,
    events: Option<mpsc::Sender<PipelineEvent>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            agents: HashMap::new(),
            log: None,
            store_factory: None,
            events: None,
        }
    }

    /// Domain logic for one stage
    pub fn agent(mut self, stage: Stage, logic: Arc<dyn AgentLogic>) -> Self {
        self.agents.insert(stage, logic);
        self
    }

    /// Execution log collaborator (defaults to `tracing` output)
    pub fn execution_log(mut self, log: Arc<dyn ExecutionLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Use an already opened checkpoint store
    pub fn checkpoint_store(self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store_factory(move |_| Ok(store))
    }

    /// Open the checkpoint store with a custom factory instead of
    /// `config.checkpoint_db`
    pub fn checkpoint_store_factory<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(&EngineConfig) -> anyhow::Result<Arc<dyn CheckpointStore>> + Send + 'static,
    {
        self.store_factory = Some(Box::new(factory));
        self
    }

    /// Stream run-level events
    pub fn event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Build the engine. Only a missing stage fails; an unavailable
    /// checkpoint store downgrades the engine to ephemeral execution.
    pub fn build(self) -> Result<WorkflowEngine> {
        let log = self
            .log
            .unwrap_or_else(|| Arc::new(TracingExecutionLog) as Arc<dyn ExecutionLog>);
        let graph = Arc::new(WorkflowGraph::build(
            self.agents,
            log,
            self.config.node_timeout(),
        )?);

        let mut build_warnings = Vec::new();
        let store = if !self.config.checkpoints_enabled {
            tracing::info!("Checkpoints disabled by configuration");
            None
        } else {
            let opened = match self.store_factory {
                Some(factory) => factory(&self.config).map(Some),
                None => open_default_store(&self.config),
            };
            match opened {
                Ok(store) => store,
                Err(e) => {
                    let message = format!(
                        "Checkpoint store unavailable, running without persistence: {:#}",
                        e
                    );
                    tracing::warn!("{}", message);
                    build_warnings.push(message);
                    None
                }
            }
        };

        let durable = store.map(|store| {
            CompiledGraph::new(Arc::clone(&graph), Some(store)).with_events(self.events.clone())
        });
        let ephemeral = CompiledGraph::new(graph, None).with_events(self.events);

        tracing::info!(
            durable = durable.is_some(),
            max_retries = self.config.max_retries,
            "Workflow engine built"
        );

        Ok(WorkflowEngine {
            config: self.config,
            durable: RwLock::new(durable),
            ephemeral,
            build_warnings,
            history: Mutex::new(VecDeque::new()),
        })
    }
}

fn open_default_store(config: &EngineConfig) -> anyhow::Result<Option<Arc<dyn CheckpointStore>>> {
    let Some(path) = &config.checkpoint_db else {
        return Ok(None);
    };
    let db = CheckpointDb::open_at(path)
        .with_context(|| format!("Failed to open checkpoints at {}", path.display()))?;
    Ok(Some(Arc::new(SqliteCheckpointStore::new(&db))))
}

/// Executes and resumes runs of the fixed pipeline
pub struct WorkflowEngine {
    config: EngineConfig,
    /// `None` once shut down or when no store could be opened
    durable: RwLock<Option<CompiledGraph>>,
    ephemeral: CompiledGraph,
    build_warnings: Vec<String>,
    /// Most recent attempts, capped at `config.history_limit`
    history: Mutex<VecDeque<ExecutionAttempt>>,
}

impl WorkflowEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn is_durable(&self) -> bool {
        self.durable.read().await.is_some()
    }

    /// Warnings produced while opening the checkpoint store
    pub fn build_warnings(&self) -> &[String] {
        &self.build_warnings
    }

    async fn active_graph(&self) -> CompiledGraph {
        match self.durable.read().await.as_ref() {
            Some(graph) => graph.clone(),
            None => self.ephemeral.clone(),
        }
    }

    async fn store(&self) -> Option<Arc<dyn CheckpointStore>> {
        self.durable
            .read()
            .await
            .as_ref()
            .and_then(|graph| graph.store().cloned())
    }

    /// Execute a new run from the entry node
    #[tracing::instrument(skip(self, run), fields(run_id = %run.run_id))]
    pub async fn execute(&self, run: Run) -> Result<RunOutcome> {
        let state = SharedState::new(&run, self.config.max_retries);
        self.execute_state(state).await
    }

    /// Execute from the entry node with a caller-supplied initial state
    pub async fn execute_state(&self, mut state: SharedState) -> Result<RunOutcome> {
        self.note_build_warnings(&mut state);

        let graph = self.active_graph().await;
        let started = Instant::now();
        let started_at = Utc::now();
        let entry = graph.info().entry;

        let mut outcome = graph.invoke(state, entry, None).await;
        self.prepend_build_warnings(&mut outcome);

        self.record(&outcome, false, started_at, started).await;
        Ok(outcome)
    }

    /// Continue a run from a checkpoint: the given one, or the latest under
    /// `(thread_id, namespace)` when `checkpoint_id` is `None`.
    #[tracing::instrument(skip(self))]
    pub async fn resume(
        &self,
        thread_id: &str,
        namespace: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<RunOutcome> {
        let checkpoint = self
            .get_checkpoint(thread_id, namespace, checkpoint_id)
            .await?
            .ok_or_else(|| OrchestratorError::CheckpointNotFound {
                thread_id: thread_id.to_string(),
                namespace: namespace.to_string(),
                checkpoint_id: checkpoint_id.unwrap_or("latest").to_string(),
            })?;

        tracing::info!(
            checkpoint_id = %checkpoint.checkpoint_id,
            step = checkpoint.step,
            next_node = %checkpoint.next_node,
            "Resuming from checkpoint"
        );

        let graph = self.active_graph().await;
        let started = Instant::now();
        let started_at = Utc::now();

        let outcome = graph
            .invoke(
                checkpoint.state.clone(),
                checkpoint.next_node,
                Some(&checkpoint),
            )
            .await;

        self.record(&outcome, true, started_at, started).await;
        Ok(outcome)
    }

    /// Load a checkpoint without running anything
    pub async fn get_checkpoint(
        &self,
        thread_id: &str,
        namespace: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<Checkpoint>> {
        let store = self
            .store()
            .await
            .ok_or_else(|| OrchestratorError::PersistenceUnavailable(thread_id.to_string()))?;

        let found = match checkpoint_id {
            Some(id) => store.get(thread_id, namespace, id).await,
            None => store.get_latest(thread_id, namespace).await,
        };
        found.map_err(|e| OrchestratorError::Store(format!("{:#}", e)))
    }

    /// All checkpoints of a run, oldest first
    pub async fn list_checkpoints(
        &self,
        thread_id: &str,
        namespace: &str,
    ) -> Result<Vec<Checkpoint>> {
        let store = self
            .store()
            .await
            .ok_or_else(|| OrchestratorError::PersistenceUnavailable(thread_id.to_string()))?;
        store
            .list(thread_id, namespace)
            .await
            .map_err(|e| OrchestratorError::Store(format!("{:#}", e)))
    }

    /// Delete checkpoints older than `max_age`. Without persistence there is
    /// nothing to prune.
    pub async fn prune_checkpoints(&self, max_age: chrono::Duration) -> Result<usize> {
        match self.store().await {
            Some(store) => store
                .prune_older_than(max_age)
                .await
                .map_err(|e| OrchestratorError::Store(format!("{:#}", e))),
            None => Ok(0),
        }
    }

    pub async fn graph_info(&self) -> GraphInfo {
        self.active_graph().await.info()
    }

    /// Recorded attempts, oldest first
    pub async fn execution_history(&self) -> Vec<ExecutionAttempt> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// Clear the execution history, returning how many entries were dropped
    pub async fn clear_execution_history(&self) -> usize {
        let mut history = self.history.lock().await;
        let cleared = history.len();
        history.clear();
        cleared
    }

    /// Release the checkpoint store. Later runs execute ephemerally.
    pub async fn shutdown(&self) {
        if self.durable.write().await.take().is_some() {
            tracing::info!("Checkpoint store released");
        }
    }

    async fn record(
        &self,
        outcome: &RunOutcome,
        resumed: bool,
        started_at: DateTime<Utc>,
        started: Instant,
    ) {
        let attempt = ExecutionAttempt {
            run_id: outcome.state.run_id.clone(),
            thread_id: outcome.state.thread_id.clone(),
            resumed,
            started_at,
            duration_secs: started.elapsed().as_secs_f64(),
            workflow_status: outcome.state.workflow_status,
            durable: outcome.durable,
            checkpoints_written: outcome.checkpoints_written,
        };
        let mut history = self.history.lock().await;
        history.push_back(attempt);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    /// Store-opening problems go into the state of every run
    fn note_build_warnings(&self, state: &mut SharedState) {
        for warning in &self.build_warnings {
            state.add_warning(ErrorKind::Infrastructure, warning, None);
        }
    }

    fn prepend_build_warnings(&self, outcome: &mut RunOutcome) {
        let mut warnings = self.build_warnings.clone();
        warnings.append(&mut outcome.warnings);
        outcome.warnings = warnings;
    }
}
