//! Task lifecycle transition table.
//!
//! Pure lookups only. Every status change in the system goes through
//! [`transition`], and the stored event log can be replayed through it to
//! reconstruct a task's current status.

use crate::types::{TaskAction, TaskEvent, TaskStatus};

/// The requested action is not defined for the current status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid transition: {from} + {action}. Allowed actions: {}", allowed_list(.from))]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub action: TaskAction,
}

fn allowed_list(status: &TaskStatus) -> String {
    let allowed = allowed_actions(*status);
    if allowed.is_empty() {
        "none".to_string()
    } else {
        allowed
            .iter()
            .map(TaskAction::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Next status for `(current, action)`, if the pair is in the table.
pub fn next_status(current: TaskStatus, action: TaskAction) -> Option<TaskStatus> {
    use TaskAction as A;
    use TaskStatus as S;

    match (current, action) {
        (S::Draft, A::Post) => Some(S::Posted),
        (S::Posted, A::Match) => Some(S::Matched),
        (S::Posted, A::Claim) => Some(S::InProgress),
        (S::Matched, A::Escrow) => Some(S::Escrowed),
        (S::Escrowed, A::Accept) => Some(S::Accepted),
        (S::Accepted, A::Start) => Some(S::InProgress),
        (S::InProgress, A::SubmitProof) => Some(S::ProofSubmitted),
        (S::InProgress, A::Timeout) => Some(S::TimedOut),
        (S::ProofSubmitted, A::Verify) => Some(S::Verified),
        (S::ProofSubmitted, A::RejectProof) => Some(S::ProofRejected),
        (S::ProofSubmitted, A::Timeout) => Some(S::TimedOut),
        (S::Verified, A::Pay) => Some(S::Paid),
        (S::Paid, A::Close) => Some(S::Closed),
        (S::TimedOut, A::Refund) => Some(S::Refunded),
        (S::ProofRejected, A::RetryProof) => Some(S::ProofSubmitted),
        (S::ProofRejected, A::Timeout) => Some(S::TimedOut),
        _ => None,
    }
}

/// Apply `action` to `current`.
pub fn transition(current: TaskStatus, action: TaskAction) -> Result<TaskStatus, InvalidTransition> {
    next_status(current, action).ok_or(InvalidTransition {
        from: current,
        action,
    })
}

/// Actions defined for `status`, in table order.
pub fn allowed_actions(status: TaskStatus) -> Vec<TaskAction> {
    TaskAction::ALL
        .into_iter()
        .filter(|action| next_status(status, *action).is_some())
        .collect()
}

/// True when no action leaves `status`.
pub fn is_terminal(status: TaskStatus) -> bool {
    allowed_actions(status).is_empty()
}

/// Divergence found while replaying an event log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("event {event_id}: recorded from-status {recorded} but replay is at {expected}")]
    FromMismatch {
        event_id: i64,
        recorded: TaskStatus,
        expected: TaskStatus,
    },
    #[error("event {event_id}: recorded to-status {recorded} but table yields {expected}")]
    ToMismatch {
        event_id: i64,
        recorded: TaskStatus,
        expected: TaskStatus,
    },
    #[error("event {event_id}: {source}")]
    Invalid {
        event_id: i64,
        source: InvalidTransition,
    },
    #[error("event {event_id}: annotation changes status {from} -> {to}")]
    AnnotationMoved {
        event_id: i64,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// Replay an ordered event log from DRAFT and return the resulting status.
///
/// Annotation events are checked to leave the status unchanged and are
/// otherwise skipped.
pub fn replay<'a, I>(events: I) -> Result<TaskStatus, ReplayError>
where
    I: IntoIterator<Item = &'a TaskEvent>,
{
    let mut status = TaskStatus::Draft;

    for event in events {
        if event.from_status != status {
            return Err(ReplayError::FromMismatch {
                event_id: event.id,
                recorded: event.from_status,
                expected: status,
            });
        }

        match event.action.transition() {
            Some(action) => {
                let next = transition(status, action).map_err(|source| ReplayError::Invalid {
                    event_id: event.id,
                    source,
                })?;
                if next != event.to_status {
                    return Err(ReplayError::ToMismatch {
                        event_id: event.id,
                        recorded: event.to_status,
                        expected: next,
                    });
                }
                status = next;
            }
            None => {
                if event.to_status != event.from_status {
                    return Err(ReplayError::AnnotationMoved {
                        event_id: event.id,
                        from: event.from_status,
                        to: event.to_status,
                    });
                }
            }
        }
    }

    Ok(status)
}
