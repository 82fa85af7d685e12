//! Core entity structures

use crate::{PostId, Timestamp, UserId, VoteKey, VoteValue};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// User account. `password_hash` is an argon2 digest; the plaintext never
/// reaches storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl User {
    /// Create a new user record. The id is assigned by storage on insert;
    /// callers pass the placeholder 0 through `NewUser` instead.
    pub fn new(id: UserId, username: String, email: String, password_hash: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            username,
            email,
            password_hash,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Insert payload for users. Storage assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

/// Post - user-authored content with a denormalized aggregate score.
///
/// `points` is mutated only by the vote ledger and always equals the sum of
/// all current vote values for the post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub creator_id: UserId,
    pub title: String,
    pub text: String,
    pub points: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Post {
    pub fn new(id: PostId, creator_id: UserId, title: String, text: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            creator_id,
            title,
            text,
            points: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Leading excerpt shown in listings.
    pub fn text_snippet(&self) -> &str {
        match self.text.char_indices().nth(50) {
            Some((idx, _)) => &self.text[..idx],
            None => &self.text,
        }
    }
}

/// Insert payload for posts. Storage assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPost {
    pub creator_id: UserId,
    pub title: String,
    pub text: String,
}

/// Update payload for posts. Only the title/text are editable; `points`
/// changes go through the vote ledger exclusively.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostUpdate {
    pub title: Option<String>,
    pub text: Option<String>,
}

/// Vote - one row per (user, post) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub user_id: UserId,
    pub post_id: PostId,
    pub value: VoteValue,
}

impl Vote {
    pub fn new(user_id: UserId, post_id: PostId, value: VoteValue) -> Self {
        Self {
            user_id,
            post_id,
            value,
        }
    }

    pub fn key(&self) -> VoteKey {
        VoteKey::new(self.user_id, self.post_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_new_starts_at_zero_points() {
        let post = Post::new(1, 7, "title".to_string(), "text".to_string());
        assert_eq!(post.points, 0);
        assert_eq!(post.creator_id, 7);
    }

    #[test]
    fn test_text_snippet_short_text() {
        let post = Post::new(1, 1, "t".to_string(), "short".to_string());
        assert_eq!(post.text_snippet(), "short");
    }

    #[test]
    fn test_text_snippet_truncates_at_50_chars() {
        let text = "a".repeat(120);
        let post = Post::new(1, 1, "t".to_string(), text);
        assert_eq!(post.text_snippet().len(), 50);
    }

    #[test]
    fn test_text_snippet_multibyte_boundary() {
        let text = "é".repeat(60);
        let post = Post::new(1, 1, "t".to_string(), text);
        assert_eq!(post.text_snippet().chars().count(), 50);
    }

    #[test]
    fn test_vote_key_roundtrip() {
        let vote = Vote::new(3, 9, VoteValue::Up);
        assert_eq!(vote.key(), VoteKey::new(3, 9));
    }
}
