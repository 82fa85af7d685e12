//! Quill Core - Entity Types and Vote Transition Logic
//!
//! Pure data structures plus the vote transition state machine. All other
//! crates depend on this. No I/O lives here - storage and transport are
//! layered on top in quill-storage and quill-api.

pub mod entities;
pub mod error;
pub mod identity;
pub mod vote;

pub use entities::{NewPost, NewUser, Post, PostUpdate, User, Vote};
pub use error::{
    CoreError, CoreResult, StorageError, ValidationError, VoteError,
};
pub use identity::{PostId, Timestamp, UserId, VoteKey};
pub use vote::{plan_vote, VotePlan, VoteValue};

/// Entity type discriminator for polymorphic references and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum EntityType {
    User,
    Post,
    Vote,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityType::User => write!(f, "user"),
            EntityType::Post => write!(f, "post"),
            EntityType::Vote => write!(f, "vote"),
        }
    }
}
