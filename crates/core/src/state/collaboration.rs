//! # Collaboration Sessions
//!
//! Structured negotiation between a requesting agent and a target agent,
//! e.g. the execution stage asking the generation stage to fix a selector.
//! A session is created by `start`, grows only through `append_message`
//! while active, and is sealed by `end`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchestratorError, Result};

/// Status of a collaboration session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Kind of payload carried by a collaboration message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Description of what is wrong with the target's output
    DefectReport,
    /// Proposed change to the target's output
    SuggestedFix,
    /// Target reports the fix was applied
    FixApplied,
    /// Requester reports the outcome of re-testing
    FixResult,
    /// Free-form note
    Note,
}

/// A single message inside a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollaborationMessage {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
}

/// One negotiation between two agents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollaborationSession {
    pub session_id: String,
    pub requesting_agent: String,
    pub target_agent: String,
    /// Payload that opened the session
    pub request: Value,
    pub status: SessionStatus,
    #[serde(default)]
    pub messages: Vec<CollaborationMessage>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

impl CollaborationSession {
    /// Open a new active session
    pub fn start(
        session_id: impl Into<String>,
        requesting_agent: &str,
        target_agent: &str,
        request: Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            requesting_agent: requesting_agent.to_string(),
            target_agent: target_agent.to_string(),
            request,
            status: SessionStatus::Active,
            messages: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            resolution: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Append a message. Fails with `SessionSealed` once the session has ended,
    /// leaving the message list untouched.
    pub fn append_message(
        &mut self,
        from: &str,
        to: &str,
        kind: MessageKind,
        content: Value,
    ) -> Result<&CollaborationMessage> {
        if !self.is_active() {
            return Err(OrchestratorError::SessionSealed(self.session_id.clone()));
        }

        self.messages.push(CollaborationMessage {
            from: from.to_string(),
            to: to.to_string(),
            kind,
            content,
            timestamp: Utc::now(),
        });

        tracing::debug!(
            session_id = %self.session_id,
            from = %from,
            to = %to,
            kind = ?kind,
            "Collaboration message appended"
        );

        Ok(&self.messages[self.messages.len() - 1])
    }

    /// Seal the session with a terminal status
    pub fn end(&mut self, success: bool, resolution: Option<String>) -> Result<()> {
        if !self.is_active() {
            return Err(OrchestratorError::SessionSealed(self.session_id.clone()));
        }

        self.status = if success {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        self.ended_at = Some(Utc::now());
        self.resolution = Some(resolution.unwrap_or_else(|| {
            if success { "Success" } else { "Failed" }.to_string()
        }));

        tracing::info!(
            session_id = %self.session_id,
            status = self.status.as_str(),
            "Collaboration ended"
        );

        Ok(())
    }
}

/// Collaboration step requested by an agent as part of its state update.
///
/// `session_id: None` addresses the most recently started session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CollaborationOp {
    Start {
        requesting_agent: String,
        target_agent: String,
        request: Value,
    },
    Message {
        session_id: Option<String>,
        from: String,
        to: String,
        kind: MessageKind,
        content: Value,
    },
    End {
        session_id: Option<String>,
        success: bool,
        resolution: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> CollaborationSession {
        CollaborationSession::start(
            "collab_1",
            "execution",
            "generation",
            json!({"error": "Element not found"}),
        )
    }

    #[test]
    fn test_session_lifecycle() {
        let mut session = session();
        assert!(session.is_active());

        session
            .append_message(
                "execution",
                "generation",
                MessageKind::DefectReport,
                json!({"selector": "#compose-button"}),
            )
            .unwrap();
        session
            .append_message(
                "generation",
                "execution",
                MessageKind::FixApplied,
                json!({"selector": "button[aria-label='New mail']"}),
            )
            .unwrap();

        session.end(true, Some("Selector fixed".into())).unwrap();

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.resolution.as_deref(), Some("Selector fixed"));
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn test_sealed_session_rejects_messages() {
        let mut session = session();
        session
            .append_message("execution", "generation", MessageKind::Note, json!("hi"))
            .unwrap();
        session.end(false, None).unwrap();
        assert_eq!(session.resolution.as_deref(), Some("Failed"));

        let before = session.messages.clone();
        let err = session
            .append_message("execution", "generation", MessageKind::Note, json!("late"))
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::SessionSealed(ref id) if id == "collab_1"));
        assert_eq!(session.messages, before);
    }

    #[test]
    fn test_end_twice_fails() {
        let mut session = session();
        session.end(true, None).unwrap();
        assert!(session.end(false, None).is_err());
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[test]
    fn test_message_serializes_type_field() {
        let mut session = session();
        session
            .append_message("execution", "generation", MessageKind::SuggestedFix, json!({}))
            .unwrap();
        let value = serde_json::to_value(&session.messages[0]).unwrap();
        assert_eq!(value["type"], "suggested_fix");
    }

    #[test]
    fn test_op_serialization() {
        let op = CollaborationOp::End {
            session_id: None,
            success: true,
            resolution: None,
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"op\":\"end\""));
    }
}
