use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a saga instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    /// Created, no step has run yet
    NotStarted,
    /// Executing steps forward
    Running,
    /// Finished every step
    Completed,
    /// Undoing completed steps in reverse order
    Compensating,
    /// Every completed step was undone after a failure
    Compensated,
    /// At least one compensation failed
    Failed,
    /// Cancelled and fully compensated
    Aborted,
}

impl SagaState {
    /// Terminal states are never resumed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Compensated | SagaState::Failed | SagaState::Aborted
        )
    }

    /// Checks if a transition to `target` is allowed.
    ///
    /// - NotStarted → Running
    /// - Running → Completed | Compensating
    /// - Compensating → Compensated | Failed | Aborted
    pub fn can_transition_to(&self, target: SagaState) -> bool {
        use SagaState::*;
        matches!(
            (self, target),
            (NotStarted, Running)
                | (Running, Completed)
                | (Running, Compensating)
                | (Compensating, Compensated)
                | (Compensating, Failed)
                | (Compensating, Aborted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::NotStarted => "not_started",
            SagaState::Running => "running",
            SagaState::Completed => "completed",
            SagaState::Compensating => "compensating",
            SagaState::Compensated => "compensated",
            SagaState::Failed => "failed",
            SagaState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!SagaState::NotStarted.is_terminal());
        assert!(!SagaState::Running.is_terminal());
        assert!(!SagaState::Compensating.is_terminal());
        assert!(SagaState::Completed.is_terminal());
        assert!(SagaState::Compensated.is_terminal());
        assert!(SagaState::Failed.is_terminal());
        assert!(SagaState::Aborted.is_terminal());
    }

    #[test]
    fn test_transitions() {
        assert!(SagaState::NotStarted.can_transition_to(SagaState::Running));
        assert!(SagaState::Running.can_transition_to(SagaState::Compensating));
        assert!(SagaState::Compensating.can_transition_to(SagaState::Aborted));
        assert!(!SagaState::Completed.can_transition_to(SagaState::Compensating));
        assert!(!SagaState::NotStarted.can_transition_to(SagaState::Completed));
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&SagaState::NotStarted).unwrap(),
            "\"not_started\""
        );
        let state: SagaState = serde_json::from_str("\"compensating\"").unwrap();
        assert_eq!(state, SagaState::Compensating);
    }
}
