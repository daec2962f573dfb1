//! # Engine Registry
//!
//! Process-wide map of run id → engine, owned by the host. Safe for
//! concurrent registration and removal from any task.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::engine::WorkflowEngine;

/// Counts of registered engines
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub active: usize,
    pub durable: usize,
    pub ephemeral: usize,
}

#[derive(Default)]
pub struct EngineRegistry {
    engines: RwLock<HashMap<String, Arc<WorkflowEngine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine for a run. A previously registered engine for the
    /// same run is shut down and returned.
    pub async fn register(
        &self,
        run_id: &str,
        engine: Arc<WorkflowEngine>,
    ) -> Option<Arc<WorkflowEngine>> {
        let previous = self
            .engines
            .write()
            .await
            .insert(run_id.to_string(), engine);

        if let Some(old) = &previous {
            tracing::warn!(run_id = %run_id, "Replacing registered engine");
            old.shutdown().await;
        }
        previous
    }

    /// Remove and shut down the engine of a run
    pub async fn unregister(&self, run_id: &str) -> Option<Arc<WorkflowEngine>> {
        let removed = self.engines.write().await.remove(run_id);
        if let Some(engine) = &removed {
            engine.shutdown().await;
            tracing::debug!(run_id = %run_id, "Engine unregistered");
        }
        removed
    }

    pub async fn get(&self, run_id: &str) -> Option<Arc<WorkflowEngine>> {
        self.engines.read().await.get(run_id).cloned()
    }

    pub async fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.engines.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.engines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.engines.read().await.is_empty()
    }

    /// Shut down and remove every engine, returning how many were closed
    pub async fn shutdown_all(&self) -> usize {
        let drained: Vec<(String, Arc<WorkflowEngine>)> =
            self.engines.write().await.drain().collect();

        for (run_id, engine) in &drained {
            engine.shutdown().await;
            tracing::debug!(run_id = %run_id, "Engine shut down");
        }

        tracing::info!(closed = drained.len(), "All engines shut down");
        drained.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        let engines: Vec<Arc<WorkflowEngine>> =
            self.engines.read().await.values().cloned().collect();

        let mut stats = RegistryStats {
            active: engines.len(),
            ..RegistryStats::default()
        };
        for engine in engines {
            if engine.is_durable().await {
                stats.durable += 1;
            } else {
                stats.ephemeral += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::pipeline::node::AgentLogic;
    use crate::state::{InMemoryCheckpointStore, SharedState, Stage, StateUpdate};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl AgentLogic for Noop {
        async fn execute(&self, _state: &SharedState) -> anyhow::Result<StateUpdate> {
            Ok(StateUpdate::new())
        }
    }

    fn engine(durable: bool) -> Arc<WorkflowEngine> {
        let config = EngineConfig {
            checkpoint_db: None,
            ..EngineConfig::default()
        };
        let mut builder = WorkflowEngine::builder(config);
        for stage in Stage::ALL {
            builder = builder.agent(stage, Arc::new(Noop));
        }
        if durable {
            builder = builder.checkpoint_store(Arc::new(InMemoryCheckpointStore::new()));
        }
        Arc::new(builder.build().unwrap())
    }

    #[tokio::test]
    async fn test_register_get_unregister() {
        let registry = EngineRegistry::new();
        assert!(registry.register("run-1", engine(true)).await.is_none());
        assert!(registry.get("run-1").await.is_some());

        let removed = registry.unregister("run-1").await.unwrap();
        assert!(!removed.is_durable().await);
        assert!(registry.get("run-1").await.is_none());
        assert!(registry.unregister("run-1").await.is_none());
    }

    #[tokio::test]
    async fn test_register_replaces_and_shuts_down() {
        let registry = EngineRegistry::new();
        registry.register("run-1", engine(true)).await;
        let old = registry.register("run-1", engine(true)).await.unwrap();

        assert!(!old.is_durable().await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_stats_and_shutdown_all() {
        let registry = EngineRegistry::new();
        registry.register("a", engine(true)).await;
        registry.register("b", engine(false)).await;
        registry.register("c", engine(true)).await;

        assert_eq!(
            registry.stats().await,
            RegistryStats {
                active: 3,
                durable: 2,
                ephemeral: 1
            }
        );
        assert_eq!(registry.run_ids().await, vec!["a", "b", "c"]);

        assert_eq!(registry.shutdown_all().await, 3);
        assert!(registry.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration() {
        let registry = Arc::new(EngineRegistry::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let run_id = format!("run-{}", i);
                registry.register(&run_id, engine(false)).await;
                if i % 2 == 0 {
                    registry.unregister(&run_id).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.len().await, 16);
    }
}
