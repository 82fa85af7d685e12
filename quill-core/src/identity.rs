//! Identity types for Quill entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User identifier. Sequential, assigned by storage.
pub type UserId = i64;

/// Post identifier. Sequential, assigned by storage.
pub type PostId = i64;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Composite key identifying at most one vote row: a user casts at most
/// one vote per post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoteKey {
    pub user_id: UserId,
    pub post_id: PostId,
}

impl VoteKey {
    pub fn new(user_id: UserId, post_id: PostId) -> Self {
        Self { user_id, post_id }
    }
}

impl std::fmt::Display for VoteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.user_id, self.post_id)
    }
}
