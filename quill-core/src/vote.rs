//! Vote values and the transition state machine.
//!
//! The state machine is pure: given the voter's existing vote (if any) and
//! the requested value, it decides what the ledger must write and by how
//! much the post's aggregate score moves. Keeping it free of I/O makes the
//! score invariant directly testable.

use crate::error::{ValidationError, VoteError};
use serde::{Deserialize, Serialize};

/// A vote value: +1 (upvote) or -1 (downvote).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteValue {
    Up,
    Down,
}

impl VoteValue {
    /// Numeric contribution to a post's aggregate score.
    pub fn as_delta(self) -> i64 {
        match self {
            VoteValue::Up => 1,
            VoteValue::Down => -1,
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            VoteValue::Up => VoteValue::Down,
            VoteValue::Down => VoteValue::Up,
        }
    }
}

impl TryFrom<i32> for VoteValue {
    type Error = ValidationError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            1 => Ok(VoteValue::Up),
            -1 => Ok(VoteValue::Down),
            other => Err(ValidationError::InvalidValue {
                field: "value".to_string(),
                reason: format!("vote value must be 1 or -1, got {}", other),
            }),
        }
    }
}

impl std::fmt::Display for VoteValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_delta())
    }
}

/// What the ledger must do to apply a requested vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VotePlan {
    /// No prior vote: insert a row, adjust points by the vote's value.
    FirstVote { delta: i64 },
    /// Prior vote with the opposite value: update the row in place, adjust
    /// points by 2 * new value (old contribution removed, new one added).
    Revote { delta: i64 },
}

impl VotePlan {
    pub fn delta(self) -> i64 {
        match self {
            VotePlan::FirstVote { delta } | VotePlan::Revote { delta } => delta,
        }
    }
}

/// Decide the transition for a requested vote against the voter's existing
/// vote on the same post.
///
/// Re-submitting an identical vote is rejected rather than treated as a
/// silent no-op: it signals a client bug or a double-submit race, and the
/// caller should be able to tell it apart from a changed mind.
pub fn plan_vote(existing: Option<VoteValue>, requested: VoteValue) -> Result<VotePlan, VoteError> {
    match existing {
        None => Ok(VotePlan::FirstVote {
            delta: requested.as_delta(),
        }),
        Some(current) if current == requested => Err(VoteError::DuplicateVote {
            value: requested,
        }),
        Some(_) => Ok(VotePlan::Revote {
            delta: 2 * requested.as_delta(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_vote_up() {
        let plan = plan_vote(None, VoteValue::Up).unwrap();
        assert_eq!(plan, VotePlan::FirstVote { delta: 1 });
    }

    #[test]
    fn test_first_vote_down() {
        let plan = plan_vote(None, VoteValue::Down).unwrap();
        assert_eq!(plan, VotePlan::FirstVote { delta: -1 });
    }

    #[test]
    fn test_duplicate_vote_rejected() {
        let result = plan_vote(Some(VoteValue::Up), VoteValue::Up);
        assert!(matches!(result, Err(VoteError::DuplicateVote { .. })));

        let result = plan_vote(Some(VoteValue::Down), VoteValue::Down);
        assert!(matches!(result, Err(VoteError::DuplicateVote { .. })));
    }

    #[test]
    fn test_flip_up_to_down_moves_points_by_minus_two() {
        let plan = plan_vote(Some(VoteValue::Up), VoteValue::Down).unwrap();
        assert_eq!(plan, VotePlan::Revote { delta: -2 });
    }

    #[test]
    fn test_flip_down_to_up_moves_points_by_plus_two() {
        let plan = plan_vote(Some(VoteValue::Down), VoteValue::Up).unwrap();
        assert_eq!(plan, VotePlan::Revote { delta: 2 });
    }

    #[test]
    fn test_try_from_raw_value() {
        assert_eq!(VoteValue::try_from(1).unwrap(), VoteValue::Up);
        assert_eq!(VoteValue::try_from(-1).unwrap(), VoteValue::Down);
        assert!(VoteValue::try_from(0).is_err());
        assert!(VoteValue::try_from(2).is_err());
        assert!(VoteValue::try_from(-5).is_err());
    }
}
