//! # Supervisor
//!
//! Decides where a run goes after a stage fails. The policy only moves
//! forward: a failed stage hands over to the stage after it, reporting
//! failures and healthy states end the run. Every visit counts against
//! `max_retries`; once the count exceeds it the run is terminated as failed.

use crate::state::{AgentStatus, ErrorKind, NodeId, SharedState, Stage, WorkflowStatus};

/// Outcome of one supervisor evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub reason: String,
    /// Decision was forced by the retry cap
    pub retry_limit: bool,
}

/// The supervisor node
#[derive(Debug, Default, Clone, Copy)]
pub struct Supervisor;

impl Supervisor {
    /// Policy table, evaluated on a state whose retry count already includes
    /// the current visit
    pub fn decide(&self, state: &SharedState) -> Decision {
        let failed = state
            .last_stage()
            .filter(|stage| state.status(*stage) == AgentStatus::Failed);

        let from_node = failed
            .map(NodeId::from)
            .or(state.current_node)
            .unwrap_or(NodeId::Supervisor);

        if state.retry_count > state.max_retries {
            return Decision {
                from_node,
                to_node: NodeId::End,
                reason: format!(
                    "retry limit exceeded ({}/{})",
                    state.retry_count, state.max_retries
                ),
                retry_limit: true,
            };
        }

        let Some(failed) = failed else {
            return Decision {
                from_node,
                to_node: NodeId::End,
                reason: "no agent failed".to_string(),
                retry_limit: false,
            };
        };

        // First later stage that has not run yet
        let mut candidate = failed.next();
        while let Some(stage) = candidate {
            if !state.has_visited(NodeId::from(stage)) {
                break;
            }
            candidate = stage.next();
        }

        match candidate {
            Some(stage) => Decision {
                from_node,
                to_node: NodeId::from(stage),
                reason: match failed {
                    Stage::Planning => {
                        "planning failed, continuing to generation with partial output".to_string()
                    }
                    Stage::Generation => {
                        "generation failed, proceeding to execution phase".to_string()
                    }
                    _ => format!("{} failed, proceeding to {}", failed, stage),
                },
                retry_limit: false,
            },
            None => Decision {
                from_node,
                to_node: NodeId::End,
                reason: format!("{} failed, no later stage to run", failed),
                retry_limit: false,
            },
        }
    }

    /// Run the supervisor node: count the visit, decide, record the decision
    pub fn run(&self, state: &SharedState) -> SharedState {
        let mut next = state.clone();
        next.increment_retry();

        let decision = self.decide(&next);
        if decision.retry_limit {
            next.add_error(ErrorKind::RetryLimit, &decision.reason, Some("supervisor"));
            next.workflow_status = WorkflowStatus::Failed;
        }
        next.add_supervisor_decision(decision.from_node, decision.to_node, &decision.reason);
        next
    }
}
