//! # Agent Nodes
//!
//! [`AgentNode`] wraps a stage's domain logic so that every stage behaves
//! the same way towards the engine:
//!
//! - the logic sees a read-only snapshot and returns a [`StateUpdate`]
//! - the update is merged into a copy of the state, never replacing it
//! - errors, panics and timeouts become `failed` status plus an `errors` entry
//! - `started` / `completed` / `failed` go to the [`ExecutionLog`]; a
//!   failing or slow sink never holds up the stage

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};

use super::events::{PipelineEvent, PipelineEventKind};
use crate::state::{AgentStatus, CheckpointDb, ErrorKind, SharedState, Stage, StateUpdate};

/// Upper bound for a single execution log emission
const LOG_EMIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Domain logic of one pipeline stage
#[async_trait]
pub trait AgentLogic: Send + Sync {
    /// Produce the stage's delta. `state` must be treated as read-only.
    async fn execute(&self, state: &SharedState) -> Result<StateUpdate>;
}

/// Status reported to the execution log
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Started,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Best-effort sink for agent status events
#[async_trait]
pub trait ExecutionLog: Send + Sync {
    async fn log_event(
        &self,
        run_id: &str,
        agent: &str,
        status: ExecutionStatus,
        metadata: Value,
    ) -> Result<()>;
}

/// Writes execution events to `tracing` only
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingExecutionLog;

#[async_trait]
impl ExecutionLog for TracingExecutionLog {
    async fn log_event(
        &self,
        run_id: &str,
        agent: &str,
        status: ExecutionStatus,
        metadata: Value,
    ) -> Result<()> {
        tracing::info!(
            run_id = %run_id,
            agent = %agent,
            status = status.as_str(),
            metadata = %metadata,
            "Agent execution"
        );
        Ok(())
    }
}

/// One row of the `agent_executions` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub run_id: String,
    pub agent: String,
    pub status: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Persists execution events next to the checkpoints
pub struct SqliteExecutionLog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExecutionLog {
    pub fn new(db: &CheckpointDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Events recorded for a run, oldest first
    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<ExecutionRecord>> {
        let conn = Arc::clone(&self.conn);
        let run_id = run_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<ExecutionRecord>> {
            let conn = conn
                .lock()
                .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
            let mut stmt = conn.prepare(
                r#"
                SELECT run_id, agent, status, metadata, created_at
                FROM agent_executions
                WHERE run_id = ?1
                ORDER BY id ASC
                "#,
            )?;
            let rows = stmt
                .query_map(params![run_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to list agent executions")?;

            rows.into_iter()
                .map(|(run_id, agent, status, metadata, created_at)| -> Result<ExecutionRecord> {
                    Ok(ExecutionRecord {
                        run_id,
                        agent,
                        status,
                        metadata: serde_json::from_str(&metadata)?,
                        created_at: DateTime::parse_from_rfc3339(&created_at)?
                            .with_timezone(&Utc),
                    })
                })
                .collect()
        })
        .await?
    }
}

#[async_trait]
impl ExecutionLog for SqliteExecutionLog {
    async fn log_event(
        &self,
        run_id: &str,
        agent: &str,
        status: ExecutionStatus,
        metadata: Value,
    ) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let run_id = run_id.to_string();
        let agent = agent.to_string();
        let metadata = serde_json::to_string(&metadata)?;

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn
                .lock()
                .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
            conn.execute(
                r#"
                INSERT INTO agent_executions (run_id, agent, status, metadata, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![run_id, agent, status.as_str(), metadata, Utc::now().to_rfc3339()],
            )
            .context("Failed to log agent execution")?;
            Ok(())
        })
        .await?
    }
}

/// Forwards execution events to a channel as [`PipelineEvent`]s.
/// A full or closed channel drops the event.
#[derive(Clone)]
pub struct ChannelExecutionLog {
    tx: mpsc::Sender<PipelineEvent>,
}

impl ChannelExecutionLog {
    pub fn new(tx: mpsc::Sender<PipelineEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ExecutionLog for ChannelExecutionLog {
    async fn log_event(
        &self,
        run_id: &str,
        agent: &str,
        status: ExecutionStatus,
        metadata: Value,
    ) -> Result<()> {
        let kind = match status {
            ExecutionStatus::Started => PipelineEventKind::AgentStarted,
            ExecutionStatus::Completed => PipelineEventKind::AgentCompleted,
            ExecutionStatus::Failed => PipelineEventKind::AgentFailed,
        };
        match self
            .tx
            .try_send(PipelineEvent::new(kind, run_id, agent).with_data(metadata))
        {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => anyhow::bail!("Event channel full, event dropped"),
            Err(TrySendError::Closed(_)) => anyhow::bail!("Event channel closed"),
        }
    }
}

/// A pipeline stage wrapped with merge, failure and logging handling
pub struct AgentNode {
    stage: Stage,
    logic: Arc<dyn AgentLogic>,
    log: Arc<dyn ExecutionLog>,
    timeout: Option<Duration>,
}

impl AgentNode {
    pub fn new(stage: Stage, logic: Arc<dyn AgentLogic>, log: Arc<dyn ExecutionLog>) -> Self {
        Self {
            stage,
            logic,
            log,
            timeout: None,
        }
    }

    /// Bound the domain call; expiry is recorded as a `timeout` failure
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Run the stage against `state` and return the merged state.
    ///
    /// Never fails: every error is recorded in the returned state.
    #[tracing::instrument(skip(self, state), fields(run_id = %state.run_id, agent = %self.stage))]
    pub async fn run(&self, state: &SharedState) -> SharedState {
        let agent = self.stage.as_str();
        let mut merged = state.clone();

        if let Err(e) = merged.set_status(self.stage, AgentStatus::Running) {
            merged.add_error(ErrorKind::Protocol, &e.to_string(), Some(agent));
            return merged;
        }

        self.emit(&merged.run_id, ExecutionStatus::Started, json!({}))
            .await;

        let started = Instant::now();
        let call = AssertUnwindSafe(self.logic.execute(&merged)).catch_unwind();
        let caught = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(caught) => Ok(caught),
                Err(_) => Err((
                    ErrorKind::Timeout,
                    format!("timed out after {}s", limit.as_secs_f64()),
                )),
            },
            None => Ok(call.await),
        };
        let outcome = caught.and_then(|caught| match caught {
            Ok(result) => result.map_err(|e| (ErrorKind::Domain, format!("{:#}", e))),
            Err(panic) => Err((
                ErrorKind::Domain,
                format!("panicked: {}", panic_message(panic.as_ref())),
            )),
        });
        let duration_ms = started.elapsed().as_millis() as u64;

        let failure = match outcome {
            Ok(update) => merged
                .apply_update(self.stage, update)
                .err()
                .map(|e| (ErrorKind::Protocol, e.to_string())),
            Err(failure) => Some(failure),
        };

        match failure {
            None => {
                self.finish(&mut merged, AgentStatus::Completed);
                tracing::info!(duration_ms, "Agent completed");
                self.emit(
                    &merged.run_id,
                    ExecutionStatus::Completed,
                    json!({
                        "duration_ms": duration_ms,
                        "output_present": merged.output(self.stage).is_some(),
                    }),
                )
                .await;
            }
            Some((kind, message)) => {
                let message = format!("{} error: {}", agent, message);
                merged.add_error(kind, &message, Some(agent));
                self.finish(&mut merged, AgentStatus::Failed);
                self.emit(
                    &merged.run_id,
                    ExecutionStatus::Failed,
                    json!({ "error": message, "duration_ms": duration_ms }),
                )
                .await;
            }
        }

        merged
    }

    fn finish(&self, state: &mut SharedState, status: AgentStatus) {
        // Running -> Completed/Failed is always a legal transition
        if let Err(e) = state.set_status(self.stage, status) {
            tracing::warn!(error = %e, "Unexpected status transition");
        }
        state.extras.insert(
            format!("{}_completed_at", self.stage.as_str()),
            json!(Utc::now().to_rfc3339()),
        );
    }

    async fn emit(&self, run_id: &str, status: ExecutionStatus, metadata: Value) {
        let emission = self
            .log
            .log_event(run_id, self.stage.as_str(), status, metadata);
        match tokio::time::timeout(LOG_EMIT_TIMEOUT, emission).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Execution log emission failed"),
            Err(_) => tracing::debug!("Execution log emission timed out"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MessageKind, Platform, Run};

    struct Succeed;

    #[async_trait]
    impl AgentLogic for Succeed {
        async fn execute(&self, state: &SharedState) -> Result<StateUpdate> {
            Ok(StateUpdate::new()
                .with_output(json!({"instruction": state.instruction}))
                .with_extra("ui_elements", json!([{"type": "button"}])))
        }
    }

    struct Explode;

    #[async_trait]
    impl AgentLogic for Explode {
        async fn execute(&self, _state: &SharedState) -> Result<StateUpdate> {
            anyhow::bail!("template rendering failed")
        }
    }

    struct Hang;

    #[async_trait]
    impl AgentLogic for Hang {
        async fn execute(&self, _state: &SharedState) -> Result<StateUpdate> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(StateUpdate::new())
        }
    }

    struct Panicky;

    #[async_trait]
    impl AgentLogic for Panicky {
        async fn execute(&self, _state: &SharedState) -> Result<StateUpdate> {
            let selectors: Vec<&str> = Vec::new();
            let index = selectors.len() + 3;
            Ok(StateUpdate::new().with_output(json!({ "selector": selectors[index] })))
        }
    }

    /// Sink that never completes
    struct StuckLog;

    #[async_trait]
    impl ExecutionLog for StuckLog {
        async fn log_event(&self, _: &str, _: &str, _: ExecutionStatus, _: Value) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct BadCollaboration;

    #[async_trait]
    impl AgentLogic for BadCollaboration {
        async fn execute(&self, _state: &SharedState) -> Result<StateUpdate> {
            Ok(StateUpdate::new()
                .with_output(json!({"success": false}))
                .collaboration_message("execution", "generation", MessageKind::Note, json!({})))
        }
    }

    struct BrokenLog;

    #[async_trait]
    impl ExecutionLog for BrokenLog {
        async fn log_event(&self, _: &str, _: &str, _: ExecutionStatus, _: Value) -> Result<()> {
            anyhow::bail!("database is locked")
        }
    }

    fn state() -> SharedState {
        SharedState::new(&Run::new("9", "Compose an email", Platform::Web), 3)
    }

    fn node(stage: Stage, logic: impl AgentLogic + 'static) -> AgentNode {
        AgentNode::new(stage, Arc::new(logic), Arc::new(TracingExecutionLog))
    }

    #[tokio::test]
    async fn test_success_merges_update() {
        let before = state();
        let after = node(Stage::Planning, Succeed).run(&before).await;

        assert_eq!(after.planning_status, AgentStatus::Completed);
        assert_eq!(after.blueprint.as_ref().unwrap()["instruction"], "Compose an email");
        assert!(after.extras.contains_key("planning_completed_at"));
        assert!(after.field_keys().is_superset(&before.field_keys()));
        // Input untouched
        assert_eq!(before.planning_status, AgentStatus::Pending);
    }

    #[tokio::test]
    async fn test_failure_is_absorbed() {
        let mut before = state();
        before.blueprint = Some(json!({"steps": 3}));

        let after = node(Stage::Generation, Explode).run(&before).await;

        assert_eq!(after.generation_status, AgentStatus::Failed);
        assert_eq!(after.errors.len(), 1);
        assert_eq!(after.errors[0].kind, ErrorKind::Domain);
        assert_eq!(after.errors[0].source_agent.as_deref(), Some("generation"));
        assert!(after.errors[0].message.contains("template rendering failed"));
        assert_eq!(after.blueprint, before.blueprint);
        assert!(after.field_keys().is_superset(&before.field_keys()));
    }

    #[tokio::test]
    async fn test_timeout_becomes_failure() {
        let after = node(Stage::Execution, Hang)
            .with_timeout(Some(Duration::from_millis(50)))
            .run(&state())
            .await;

        assert_eq!(after.execution_status, AgentStatus::Failed);
        assert_eq!(after.errors[0].kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let after = node(Stage::Generation, Panicky).run(&state()).await;

        assert_eq!(after.generation_status, AgentStatus::Failed);
        assert_eq!(after.errors.len(), 1);
        assert_eq!(after.errors[0].kind, ErrorKind::Domain);
        assert!(after.errors[0].message.contains("panicked"));
        assert!(after.errors[0].message.contains("index out of bounds"));
        assert!(after.generated_code.is_none());
    }

    #[tokio::test]
    async fn test_full_channel_does_not_block() {
        let (tx, mut rx) = mpsc::channel(1);
        let node = AgentNode::new(
            Stage::Planning,
            Arc::new(Succeed),
            Arc::new(ChannelExecutionLog::new(tx)),
        );

        let after = tokio::time::timeout(Duration::from_secs(1), node.run(&state()))
            .await
            .expect("stage blocked on a full event channel");

        assert_eq!(after.planning_status, AgentStatus::Completed);
        // Only the first event fit
        assert_eq!(rx.recv().await.unwrap().kind, PipelineEventKind::AgentStarted);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stuck_log_is_bounded() {
        let node = AgentNode::new(Stage::Reporting, Arc::new(Succeed), Arc::new(StuckLog));
        let started = Instant::now();
        let after = node.run(&state()).await;

        assert_eq!(after.reporting_status, AgentStatus::Completed);
        assert!(started.elapsed() < LOG_EMIT_TIMEOUT * 3);
    }

    #[tokio::test]
    async fn test_protocol_error_discards_update() {
        let after = node(Stage::Execution, BadCollaboration).run(&state()).await;

        assert_eq!(after.execution_status, AgentStatus::Failed);
        assert_eq!(after.errors[0].kind, ErrorKind::Protocol);
        assert!(after.testing_results.is_none());
    }

    #[tokio::test]
    async fn test_completed_stage_is_not_rerun() {
        let mut before = state();
        before
            .set_status(Stage::Planning, AgentStatus::Completed)
            .unwrap();

        let after = node(Stage::Planning, Succeed).run(&before).await;
        assert_eq!(after.planning_status, AgentStatus::Completed);
        assert_eq!(after.errors[0].kind, ErrorKind::Protocol);
        assert!(after.blueprint.is_none());
    }

    #[tokio::test]
    async fn test_log_failures_are_swallowed() {
        let node = AgentNode::new(Stage::Planning, Arc::new(Succeed), Arc::new(BrokenLog));
        let after = node.run(&state()).await;
        assert_eq!(after.planning_status, AgentStatus::Completed);
        assert!(after.errors.is_empty());
    }

    #[tokio::test]
    async fn test_channel_log_streams_events() {
        let (tx, mut rx) = mpsc::channel(8);
        let node = AgentNode::new(
            Stage::Reporting,
            Arc::new(Succeed),
            Arc::new(ChannelExecutionLog::new(tx)),
        );
        node.run(&state()).await;

        assert_eq!(rx.recv().await.unwrap().kind, PipelineEventKind::AgentStarted);
        let done = rx.recv().await.unwrap();
        assert_eq!(done.kind, PipelineEventKind::AgentCompleted);
        assert_eq!(done.agent, "reporting");
    }

    #[tokio::test]
    async fn test_sqlite_log_persists_events() {
        let dir = tempfile::tempdir().unwrap();
        let db = CheckpointDb::open_at(dir.path().join("log.db")).unwrap();
        let log = Arc::new(SqliteExecutionLog::new(&db));

        let node = AgentNode::new(Stage::Generation, Arc::new(Explode), log.clone());
        node.run(&state()).await;

        let records = log.list_for_run("9").await.unwrap();
        let statuses: Vec<&str> = records.iter().map(|r| r.status.as_str()).collect();
        assert_eq!(statuses, vec!["started", "failed"]);
        assert!(records[1].metadata["error"]
            .as_str()
            .unwrap()
            .contains("template rendering failed"));
    }
}
