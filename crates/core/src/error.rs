//! # Orchestration Errors
//!
//! Errors that surface out of the orchestration call itself. Agent failures
//! never show up here: they are absorbed into `SharedState::errors`.

/// How an [`OrchestratorError`] should be treated by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Misuse of the API (missing checkpoint, sealed session, ...)
    Protocol,
    /// The run could not be created at all
    Fatal,
    /// The checkpoint store failed while it was the only way to answer
    Infrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Checkpoint not found: thread={thread_id} namespace={namespace} checkpoint={checkpoint_id}")]
    CheckpointNotFound {
        thread_id: String,
        namespace: String,
        checkpoint_id: String,
    },

    #[error("Persistence is not available for run {0}")]
    PersistenceUnavailable(String),

    #[error("Collaboration session {0} is sealed")]
    SessionSealed(String),

    #[error("Collaboration session not found: {0}")]
    SessionNotFound(String),

    #[error("No active collaboration session")]
    NoActiveSession,

    #[error("Tool execution not found: {0}")]
    ToolExecutionNotFound(String),

    #[error("Tool execution {0} already finished")]
    ToolExecutionFinished(String),

    #[error("Status regression for {agent}: {from} -> {to}")]
    StatusRegression {
        agent: String,
        from: String,
        to: String,
    },

    #[error("Graph construction failed: {0}")]
    GraphBuild(String),

    #[error("Checkpoint store error: {0}")]
    Store(String),
}

impl OrchestratorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::GraphBuild(_) => ErrorClass::Fatal,
            Self::Store(_) => ErrorClass::Infrastructure,
            _ => ErrorClass::Protocol,
        }
    }

    /// Not-found protocol errors (resume against an unknown address)
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::CheckpointNotFound { .. }
                | Self::SessionNotFound(_)
                | Self::ToolExecutionNotFound(_)
        )
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
