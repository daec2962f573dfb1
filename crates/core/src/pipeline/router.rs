//! # Routing
//!
//! Pure functions deciding the successor of a node from state alone.

use crate::state::{AgentStatus, NodeId, SharedState, Stage};

/// Successor of a stage node: the next stage on success, the supervisor
/// otherwise. Reporting always ends the run.
pub fn route(stage: Stage, state: &SharedState) -> NodeId {
    if stage == Stage::Reporting {
        return NodeId::End;
    }

    let status = state.status(stage);
    if status == AgentStatus::Completed {
        let next = stage.next().map(NodeId::from).unwrap_or(NodeId::End);
        tracing::debug!(run_id = %state.run_id, "{} completed -> {}", stage, next);
        next
    } else {
        tracing::warn!(
            run_id = %state.run_id,
            "{} {} -> supervisor",
            stage,
            status.as_str()
        );
        NodeId::Supervisor
    }
}

/// Successor of the supervisor: the chosen later stage, anything else ends
pub fn route_from_supervisor(state: &SharedState) -> NodeId {
    match state.next_agent {
        Some(node @ (NodeId::Generation | NodeId::Execution | NodeId::Reporting)) => node,
        _ => NodeId::End,
    }
}

/// Successor of any node
pub fn next_node(node: NodeId, state: &SharedState) -> NodeId {
    match node {
        NodeId::Supervisor => route_from_supervisor(state),
        NodeId::End => NodeId::End,
        stage_node => match stage_node.stage() {
            Some(stage) => route(stage, state),
            None => NodeId::End,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Platform, Run};

    fn state() -> SharedState {
        SharedState::new(&Run::new("r", "Log in", Platform::Web), 3)
    }

    #[test]
    fn test_route_advances_on_completion() {
        let mut state = state();
        state
            .set_status(Stage::Planning, AgentStatus::Completed)
            .unwrap();
        assert_eq!(route(Stage::Planning, &state), NodeId::Generation);
    }

    #[test]
    fn test_route_diverts_on_failure() {
        let mut state = state();
        state.set_status(Stage::Execution, AgentStatus::Failed).unwrap();
        assert_eq!(route(Stage::Execution, &state), NodeId::Supervisor);
        // Still pending counts as not completed
        assert_eq!(route(Stage::Generation, &state), NodeId::Supervisor);
    }

    #[test]
    fn test_reporting_always_ends() {
        let mut state = state();
        state.set_status(Stage::Reporting, AgentStatus::Failed).unwrap();
        assert_eq!(route(Stage::Reporting, &state), NodeId::End);
    }

    #[test]
    fn test_route_from_supervisor() {
        let mut state = state();
        assert_eq!(route_from_supervisor(&state), NodeId::End);

        state.next_agent = Some(NodeId::Execution);
        assert_eq!(next_node(NodeId::Supervisor, &state), NodeId::Execution);

        // Never back to planning or to itself
        state.next_agent = Some(NodeId::Planning);
        assert_eq!(route_from_supervisor(&state), NodeId::End);
        state.next_agent = Some(NodeId::Supervisor);
        assert_eq!(route_from_supervisor(&state), NodeId::End);
    }

    #[test]
    fn test_route_is_pure() {
        let state = state();
        let before = state.clone();
        let _ = next_node(NodeId::Planning, &state);
        assert_eq!(state, before);
    }
}
