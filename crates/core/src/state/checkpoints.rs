//! # Checkpoints
//!
//! Immutable snapshots of [`SharedState`] written after every node, addressed
//! by `(thread_id, namespace, checkpoint_id)`. A checkpoint records the node
//! to resume into, so a restarted run picks up exactly where it stopped.
//!
//! Checkpoints are never updated. A resumed run appends new checkpoints whose
//! `parent_id` points at the checkpoint it resumed from.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use super::db::CheckpointDb;
use super::shared::{NodeId, SharedState};

/// A persisted snapshot of run state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    /// Checkpoint this one follows (lineage across resumes)
    pub parent_id: Option<String>,
    pub thread_id: String,
    pub namespace: String,
    /// Number of nodes executed when the checkpoint was taken
    pub step: u32,
    /// Node to run when resuming from here
    pub next_node: NodeId,
    pub state: SharedState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Snapshot `state` at its own address with a fresh id
    pub fn new(
        state: &SharedState,
        step: u32,
        next_node: NodeId,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            checkpoint_id: uuid::Uuid::new_v4().to_string(),
            parent_id,
            thread_id: state.thread_id.clone(),
            namespace: state.checkpoint_namespace.clone(),
            step,
            next_node,
            state: state.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Durable checkpoint storage
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store a checkpoint. Duplicate ids under one address are rejected.
    async fn put(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Most recently written checkpoint for an address
    async fn get_latest(&self, thread_id: &str, namespace: &str) -> Result<Option<Checkpoint>>;

    /// A specific checkpoint
    async fn get(
        &self,
        thread_id: &str,
        namespace: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>>;

    /// All checkpoints for an address, oldest first
    async fn list(&self, thread_id: &str, namespace: &str) -> Result<Vec<Checkpoint>>;

    /// Delete checkpoints older than `max_age`, returning how many were removed
    async fn prune_older_than(&self, max_age: chrono::Duration) -> Result<usize>;
}

type Address = (String, String);

fn address(thread_id: &str, namespace: &str) -> Address {
    (thread_id.to_string(), namespace.to_string())
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    // Fixed-width so that string comparison in SQL orders correctly
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// =============================================================================
// SQLite store
// =============================================================================

/// Checkpoint store backed by the shared SQLite database
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
    /// One async lock per address serializes writes to the same namespace
    write_locks: Mutex<HashMap<Address, Arc<AsyncMutex<()>>>>,
}

/// Raw row before JSON/enum decoding
struct CheckpointRow {
    thread_id: String,
    namespace: String,
    checkpoint_id: String,
    parent_id: Option<String>,
    step: u32,
    next_node: String,
    state: String,
    created_at: String,
}

const SELECT_COLUMNS: &str =
    "SELECT thread_id, namespace, checkpoint_id, parent_id, step, next_node, state, created_at FROM checkpoints";

impl SqliteCheckpointStore {
    pub fn new(db: &CheckpointDb) -> Self {
        Self {
            conn: db.connection(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    fn write_lock(&self, key: &Address) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .write_locks
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        Ok(Arc::clone(locks.entry(key.clone()).or_default()))
    }

    /// Forget the lock of an address once no other writer holds a handle to
    /// it. Handles are only cloned under the map mutex, so the count cannot
    /// grow while it is checked.
    fn release_write_lock(&self, key: &Address, lock: Arc<AsyncMutex<()>>) {
        let Ok(mut locks) = self.write_locks.lock() else {
            tracing::debug!("Write lock map poisoned, keeping entry");
            return;
        };
        // The map's reference plus ours
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked_write_locks(&self) -> usize {
        self.write_locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    async fn insert(&self, checkpoint: &Checkpoint) -> Result<()> {
        let state_json =
            serde_json::to_string(&checkpoint.state).context("Failed to serialize state")?;
        let checkpoint = checkpoint.clone();

        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO checkpoints
                    (thread_id, namespace, checkpoint_id, parent_id, step, next_node, state, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    checkpoint.thread_id,
                    checkpoint.namespace,
                    checkpoint.checkpoint_id,
                    checkpoint.parent_id,
                    checkpoint.step,
                    checkpoint.next_node.as_str(),
                    state_json,
                    format_timestamp(&checkpoint.created_at),
                ],
            )
            .context("Failed to save checkpoint")?;

            tracing::debug!(
                checkpoint_id = %checkpoint.checkpoint_id,
                thread_id = %checkpoint.thread_id,
                namespace = %checkpoint.namespace,
                step = checkpoint.step,
                next_node = %checkpoint.next_node,
                "Checkpoint saved"
            );
            Ok(())
        })
        .await
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<T> {
            let conn = conn
                .lock()
                .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
            f(&conn)
        })
        .await?
    }

    fn row_to_raw(row: &rusqlite::Row) -> rusqlite::Result<CheckpointRow> {
        Ok(CheckpointRow {
            thread_id: row.get(0)?,
            namespace: row.get(1)?,
            checkpoint_id: row.get(2)?,
            parent_id: row.get(3)?,
            step: row.get(4)?,
            next_node: row.get(5)?,
            state: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn decode(raw: CheckpointRow) -> Result<Checkpoint> {
        let next_node = NodeId::parse(&raw.next_node)
            .with_context(|| format!("Unknown resume node '{}'", raw.next_node))?;
        let state: SharedState = serde_json::from_str(&raw.state).with_context(|| {
            format!("Corrupt state in checkpoint {}", raw.checkpoint_id)
        })?;
        let created_at = DateTime::parse_from_rfc3339(&raw.created_at)
            .with_context(|| format!("Bad timestamp in checkpoint {}", raw.checkpoint_id))?
            .with_timezone(&Utc);

        Ok(Checkpoint {
            checkpoint_id: raw.checkpoint_id,
            parent_id: raw.parent_id,
            thread_id: raw.thread_id,
            namespace: raw.namespace,
            step: raw.step,
            next_node,
            state,
            created_at,
        })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn put(&self, checkpoint: &Checkpoint) -> Result<()> {
        let key = address(&checkpoint.thread_id, &checkpoint.namespace);
        let lock = self.write_lock(&key)?;
        let result = {
            let _guard = lock.lock().await;
            self.insert(checkpoint).await
        };
        self.release_write_lock(&key, lock);
        result
    }

    async fn get_latest(&self, thread_id: &str, namespace: &str) -> Result<Option<Checkpoint>> {
        let (thread_id, namespace) = address(thread_id, namespace);
        let raw = self
            .with_conn(move |conn| {
                conn.query_row(
                    &format!(
                        "{} WHERE thread_id = ?1 AND namespace = ?2 ORDER BY seq DESC LIMIT 1",
                        SELECT_COLUMNS
                    ),
                    params![thread_id, namespace],
                    Self::row_to_raw,
                )
                .optional()
                .context("Failed to load latest checkpoint")
            })
            .await?;

        raw.map(Self::decode).transpose()
    }

    async fn get(
        &self,
        thread_id: &str,
        namespace: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>> {
        let (thread_id, namespace) = address(thread_id, namespace);
        let checkpoint_id = checkpoint_id.to_string();
        let raw = self
            .with_conn(move |conn| {
                conn.query_row(
                    &format!(
                        "{} WHERE thread_id = ?1 AND namespace = ?2 AND checkpoint_id = ?3",
                        SELECT_COLUMNS
                    ),
                    params![thread_id, namespace, checkpoint_id],
                    Self::row_to_raw,
                )
                .optional()
                .context("Failed to load checkpoint")
            })
            .await?;

        raw.map(Self::decode).transpose()
    }

    async fn list(&self, thread_id: &str, namespace: &str) -> Result<Vec<Checkpoint>> {
        let (thread_id, namespace) = address(thread_id, namespace);
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE thread_id = ?1 AND namespace = ?2 ORDER BY seq ASC",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![thread_id, namespace], Self::row_to_raw)?
                    .collect::<Result<Vec<_>, _>>()
                    .context("Failed to list checkpoints")?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(Self::decode).collect()
    }

    async fn prune_older_than(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = format_timestamp(&(Utc::now() - max_age));
        self.with_conn(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM checkpoints WHERE created_at < ?1",
                    params![cutoff],
                )
                .context("Failed to prune checkpoints")?;
            tracing::info!(removed, cutoff = %cutoff, "Pruned old checkpoints");
            Ok(removed)
        })
        .await
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Process-local store, for tests and hosts that want resume within one process
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<Address, Vec<Checkpoint>>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut guard = self.checkpoints.write().await;
        let entries = guard
            .entry(address(&checkpoint.thread_id, &checkpoint.namespace))
            .or_default();
        if entries
            .iter()
            .any(|c| c.checkpoint_id == checkpoint.checkpoint_id)
        {
            anyhow::bail!("Duplicate checkpoint id {}", checkpoint.checkpoint_id);
        }
        entries.push(checkpoint.clone());
        Ok(())
    }

    async fn get_latest(&self, thread_id: &str, namespace: &str) -> Result<Option<Checkpoint>> {
        let guard = self.checkpoints.read().await;
        Ok(guard
            .get(&address(thread_id, namespace))
            .and_then(|entries| entries.last().cloned()))
    }

    async fn get(
        &self,
        thread_id: &str,
        namespace: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>> {
        let guard = self.checkpoints.read().await;
        Ok(guard.get(&address(thread_id, namespace)).and_then(|entries| {
            entries
                .iter()
                .find(|c| c.checkpoint_id == checkpoint_id)
                .cloned()
        }))
    }

    async fn list(&self, thread_id: &str, namespace: &str) -> Result<Vec<Checkpoint>> {
        let guard = self.checkpoints.read().await;
        Ok(guard
            .get(&address(thread_id, namespace))
            .cloned()
            .unwrap_or_default())
    }

    async fn prune_older_than(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let mut guard = self.checkpoints.write().await;
        let mut removed = 0;
        for entries in guard.values_mut() {
            let before = entries.len();
            entries.retain(|c| c.created_at >= cutoff);
            removed += before - entries.len();
        }
        guard.retain(|_, entries| !entries.is_empty());
        Ok(removed)
    }
}
