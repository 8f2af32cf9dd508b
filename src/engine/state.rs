//! Execution state machine shared by workflows and activities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether an execution is a workflow or one of its activities
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Workflow,
    Activity,
}

impl ExecutionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionKind::Workflow => "workflow",
            ExecutionKind::Activity => "activity",
        }
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a unit of work.
///
/// `Scheduled -> Running -> {Completed, Failed, TimedOut}`, plus
/// `Scheduled -> TimedOut` when no worker claims the work before its
/// deadline. Terminal states are final.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Scheduled,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::TimedOut
        )
    }

    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Scheduled, Running)
                | (Scheduled, TimedOut)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Scheduled => "scheduled",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a failed execution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The workflow or activity function returned an error
    Application,
    /// The deadline elapsed before completion
    TimedOut,
}

/// Failure details recorded on a closed execution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn application(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Application,
            message: message.into(),
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::TimedOut,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Application => write!(f, "{}", self.message),
            FailureKind::TimedOut => write!(f, "timed out: {}", self.message),
        }
    }
}

/// What a worker reports when it finishes a task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { value: serde_json::Value },
    Failed { failure: Failure },
    TimedOut { message: String },
}

impl TaskOutcome {
    /// The terminal state this outcome moves an execution into
    pub fn state(&self) -> ExecutionState {
        match self {
            TaskOutcome::Completed { .. } => ExecutionState::Completed,
            TaskOutcome::Failed { .. } => ExecutionState::Failed,
            TaskOutcome::TimedOut { .. } => ExecutionState::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionState::*;

    const ALL: [ExecutionState; 5] = [Scheduled, Running, Completed, Failed, TimedOut];

    #[test]
    fn test_terminal_states_are_final() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {} allowed", from, to);
            }
        }
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(Scheduled.can_transition_to(Running));
        assert!(Scheduled.can_transition_to(TimedOut));
        assert!(!Scheduled.can_transition_to(Completed));
        assert!(!Scheduled.can_transition_to(Failed));

        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(TimedOut));
        assert!(!Running.can_transition_to(Scheduled));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_outcome_wire_format() {
        let outcome = TaskOutcome::Completed {
            value: serde_json::json!("Hello World!"),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "completed", "value": "Hello World!"})
        );
        assert_eq!(outcome.state(), Completed);

        let timed_out: TaskOutcome =
            serde_json::from_value(serde_json::json!({"status": "timed_out", "message": "late"}))
                .unwrap();
        assert_eq!(timed_out.state(), TimedOut);
    }
}
