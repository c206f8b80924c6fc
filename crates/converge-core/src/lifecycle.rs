use crate::progress::OperationStatus;
use crate::CoreError;

/// Check that a scheduler may move a logical operation from `from` to `to`.
///
/// Only an in-progress operation moves; terminal states are final.
pub fn validate_transition(from: OperationStatus, to: OperationStatus) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (
            OperationStatus::InProgress,
            OperationStatus::InProgress | OperationStatus::Success | OperationStatus::Failed
        )
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(validate_transition(OperationStatus::InProgress, OperationStatus::InProgress).is_ok());
        assert!(validate_transition(OperationStatus::InProgress, OperationStatus::Success).is_ok());
        assert!(validate_transition(OperationStatus::InProgress, OperationStatus::Failed).is_ok());
    }

    #[test]
    fn terminal_states_are_final() {
        for to in [
            OperationStatus::InProgress,
            OperationStatus::Success,
            OperationStatus::Failed,
        ] {
            assert!(validate_transition(OperationStatus::Success, to).is_err());
            assert!(validate_transition(OperationStatus::Failed, to).is_err());
        }
    }

    #[test]
    fn error_names_both_states() {
        let err = validate_transition(OperationStatus::Failed, OperationStatus::Success).unwrap_err();
        assert_eq!(err.to_string(), "invalid state transition: failed -> success");
    }
}
