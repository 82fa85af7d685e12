//! Vote ledger: the single writer of vote rows and post scores.
//!
//! `cast_vote` owns the invariant that each (user, post) pair has at most
//! one current vote and that a post's stored `points` always equals the sum
//! of its current vote values. Each call runs as one transactional scope:
//! the vote row write and the points adjustment land together or not at
//! all. Transient storage conflicts are retried a bounded number of times
//! with backoff before being surfaced.

use crate::{Storage, VoteScope};
use quill_core::{plan_vote, PostId, UserId, VoteError, VotePlan, VoteValue};
use std::sync::Arc;
use std::time::Duration;

/// Attempts per cast, counting the first.
const MAX_ATTEMPTS: u32 = 3;

/// Base backoff between attempts; doubles per retry.
const BASE_BACKOFF: Duration = Duration::from_millis(10);

/// Outcome of a successful cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteReceipt {
    pub post_id: PostId,
    /// The post's aggregate score after this vote.
    pub points: i64,
    /// The value this vote replaced, if the voter had one.
    pub previous: Option<VoteValue>,
}

/// Applies vote state transitions against a [`Storage`] backend.
#[derive(Clone)]
pub struct VoteLedger {
    store: Arc<dyn Storage>,
}

impl VoteLedger {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self { store }
    }

    /// Cast `value` by `user_id` on `post_id`.
    ///
    /// Fails with `UserNotFound`/`PostNotFound` for dangling references,
    /// `DuplicateVote` when the identical vote is already in place, and
    /// `Conflict` when storage contention persists past the retry budget.
    pub async fn cast_vote(
        &self,
        user_id: UserId,
        post_id: PostId,
        value: VoteValue,
    ) -> Result<VoteReceipt, VoteError> {
        self.store
            .user_get(user_id)
            .await?
            .ok_or(VoteError::UserNotFound(user_id))?;

        let mut attempt: u32 = 0;
        loop {
            match self.try_cast(user_id, post_id, value).await {
                Err(VoteError::Storage(err)) if err.is_transient() => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(VoteError::Conflict {
                            reason: err.to_string(),
                        });
                    }
                    let backoff = BASE_BACKOFF * 2u32.saturating_pow(attempt - 1);
                    tracing::debug!(
                        user_id,
                        post_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying vote after transient storage conflict"
                    );
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn try_cast(
        &self,
        user_id: UserId,
        post_id: PostId,
        value: VoteValue,
    ) -> Result<VoteReceipt, VoteError> {
        let mut scope = self.store.begin_vote_scope(post_id).await?;
        match Self::apply(scope.as_mut(), user_id, post_id, value).await {
            Ok(receipt) => {
                scope.commit().await?;
                tracing::debug!(
                    user_id,
                    post_id,
                    value = %value,
                    points = receipt.points,
                    "vote committed"
                );
                Ok(receipt)
            }
            Err(err) => {
                // Best effort: the scope discards staged writes on drop too.
                let _ = scope.rollback().await;
                Err(err)
            }
        }
    }

    async fn apply(
        scope: &mut dyn VoteScope,
        user_id: UserId,
        post_id: PostId,
        value: VoteValue,
    ) -> Result<VoteReceipt, VoteError> {
        let post = scope
            .post_get()
            .await?
            .ok_or(VoteError::PostNotFound(post_id))?;

        let previous = scope.vote_get(user_id).await?.map(|v| v.value);
        let plan = plan_vote(previous, value)?;

        match plan {
            VotePlan::FirstVote { delta } => {
                scope.vote_insert(user_id, value).await?;
                scope.post_adjust_points(delta).await?;
            }
            VotePlan::Revote { delta } => {
                scope.vote_set_value(user_id, value).await?;
                scope.post_adjust_points(delta).await?;
            }
        }

        Ok(VoteReceipt {
            post_id,
            points: post.points + plan.delta(),
            previous,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;
    use quill_core::{NewPost, NewUser, VoteKey};

    async fn setup() -> (MemoryStorage, VoteLedger) {
        let storage = MemoryStorage::new();
        let ledger = VoteLedger::new(Arc::new(storage.clone()));
        (storage, ledger)
    }

    async fn seed_user(storage: &MemoryStorage, name: &str) -> i64 {
        storage
            .user_insert(&NewUser {
                username: name.to_string(),
                email: format!("{}@example.com", name),
                password_hash: "hash".to_string(),
            })
            .await
            .unwrap()
            .id
    }

    async fn seed_post(storage: &MemoryStorage, creator: i64) -> i64 {
        storage
            .post_insert(&NewPost {
                creator_id: creator,
                title: "a post".to_string(),
                text: "body".to_string(),
            })
            .await
            .unwrap()
            .id
    }

    async fn points(storage: &MemoryStorage, post_id: i64) -> i64 {
        storage.post_get(post_id).await.unwrap().unwrap().points
    }

    #[tokio::test]
    async fn test_first_vote_increments_points() {
        let (storage, ledger) = setup().await;
        let user = seed_user(&storage, "alice").await;
        let post = seed_post(&storage, user).await;

        let receipt = ledger.cast_vote(user, post, VoteValue::Up).await.unwrap();
        assert_eq!(receipt.points, 1);
        assert_eq!(receipt.previous, None);
        assert_eq!(points(&storage, post).await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_vote_rejected_points_unchanged() {
        let (storage, ledger) = setup().await;
        let user = seed_user(&storage, "alice").await;
        let post = seed_post(&storage, user).await;

        ledger.cast_vote(user, post, VoteValue::Up).await.unwrap();
        let err = ledger.cast_vote(user, post, VoteValue::Up).await.unwrap_err();
        assert!(matches!(err, VoteError::DuplicateVote { .. }));
        assert_eq!(points(&storage, post).await, 1);
        assert_eq!(storage.vote_count(), 1);
    }

    #[tokio::test]
    async fn test_flip_changes_points_by_two() {
        let (storage, ledger) = setup().await;
        let user = seed_user(&storage, "alice").await;
        let post = seed_post(&storage, user).await;

        ledger.cast_vote(user, post, VoteValue::Up).await.unwrap();
        let receipt = ledger.cast_vote(user, post, VoteValue::Down).await.unwrap();
        assert_eq!(receipt.points, -1);
        assert_eq!(receipt.previous, Some(VoteValue::Up));
        assert_eq!(points(&storage, post).await, -1);

        let receipt = ledger.cast_vote(user, post, VoteValue::Up).await.unwrap();
        assert_eq!(receipt.points, 1);
        assert_eq!(points(&storage, post).await, 1);

        // Still exactly one vote row for the pair.
        assert_eq!(storage.vote_count(), 1);
        let vote = storage
            .vote_get(VoteKey::new(user, post))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(vote.value, VoteValue::Up);
    }

    #[tokio::test]
    async fn test_two_users_then_flip_then_duplicate() {
        // U1 +1 (0->1); U2 +1 (1->2); U1 flips to -1 (2->0); U2 repeats +1
        // (rejected, stays 0).
        let (storage, ledger) = setup().await;
        let u1 = seed_user(&storage, "u1").await;
        let u2 = seed_user(&storage, "u2").await;
        let post = seed_post(&storage, u1).await;

        ledger.cast_vote(u1, post, VoteValue::Up).await.unwrap();
        assert_eq!(points(&storage, post).await, 1);

        ledger.cast_vote(u2, post, VoteValue::Up).await.unwrap();
        assert_eq!(points(&storage, post).await, 2);

        ledger.cast_vote(u1, post, VoteValue::Down).await.unwrap();
        assert_eq!(points(&storage, post).await, 0);

        let err = ledger.cast_vote(u2, post, VoteValue::Up).await.unwrap_err();
        assert!(matches!(err, VoteError::DuplicateVote { .. }));
        assert_eq!(points(&storage, post).await, 0);
    }

    #[tokio::test]
    async fn test_missing_post_and_user() {
        let (storage, ledger) = setup().await;
        let user = seed_user(&storage, "alice").await;

        let err = ledger.cast_vote(user, 404, VoteValue::Up).await.unwrap_err();
        assert!(matches!(err, VoteError::PostNotFound(404)));

        let post = seed_post(&storage, user).await;
        let err = ledger.cast_vote(404, post, VoteValue::Up).await.unwrap_err();
        assert!(matches!(err, VoteError::UserNotFound(404)));

        assert_eq!(points(&storage, post).await, 0);
        assert_eq!(storage.vote_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_conflict_retried() {
        let (storage, ledger) = setup().await;
        let user = seed_user(&storage, "alice").await;
        let post = seed_post(&storage, user).await;

        storage.fail_next_commits(1);
        let receipt = ledger.cast_vote(user, post, VoteValue::Up).await.unwrap();
        assert_eq!(receipt.points, 1);
        assert_eq!(points(&storage, post).await, 1);
    }

    #[tokio::test]
    async fn test_persistent_conflict_surfaces_after_retry_budget() {
        let (storage, ledger) = setup().await;
        let user = seed_user(&storage, "alice").await;
        let post = seed_post(&storage, user).await;

        storage.fail_next_commits(MAX_ATTEMPTS as usize);
        let err = ledger.cast_vote(user, post, VoteValue::Up).await.unwrap_err();
        assert!(matches!(err, VoteError::Conflict { .. }));
        assert_eq!(points(&storage, post).await, 0);
        assert_eq!(storage.vote_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_votes_no_lost_updates() {
        let (storage, ledger) = setup().await;
        let author = seed_user(&storage, "author").await;
        let post = seed_post(&storage, author).await;

        let mut voters = Vec::new();
        for i in 0..20 {
            voters.push(seed_user(&storage, &format!("voter{}", i)).await);
        }

        let mut handles = Vec::new();
        for (i, user) in voters.iter().copied().enumerate() {
            let ledger = ledger.clone();
            let value = if i % 2 == 0 {
                VoteValue::Up
            } else {
                VoteValue::Down
            };
            handles.push(tokio::spawn(async move {
                ledger.cast_vote(user, post, value).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // 10 up, 10 down.
        assert_eq!(points(&storage, post).await, 0);
        assert_eq!(storage.vote_count(), 20);

        // Half of the voters flip concurrently: each flip moves points by
        // +/-2, net must equal the sum of individual deltas.
        let mut handles = Vec::new();
        for user in voters.iter().copied().take(10) {
            let ledger = ledger.clone();
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                let current = storage
                    .vote_get(VoteKey::new(user, post))
                    .await
                    .unwrap()
                    .unwrap()
                    .value;
                ledger.cast_vote(user, post, current.flipped()).await
            }));
        }
        let mut net = 0i64;
        for handle in handles {
            let receipt = handle.await.unwrap().unwrap();
            net += match receipt.previous.unwrap() {
                VoteValue::Up => -2,
                VoteValue::Down => 2,
            };
        }
        assert_eq!(points(&storage, post).await, net);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_points_equal_sum_of_final_votes() {
        let (storage, ledger) = setup().await;
        let author = seed_user(&storage, "author").await;
        let post = seed_post(&storage, author).await;

        let mut handles = Vec::new();
        for i in 0..12 {
            let user = seed_user(&storage, &format!("v{}", i)).await;
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let first = if i % 3 == 0 {
                    VoteValue::Down
                } else {
                    VoteValue::Up
                };
                ledger.cast_vote(user, post, first).await.unwrap();
                if i % 2 == 0 {
                    ledger.cast_vote(user, post, first.flipped()).await.unwrap();
                }
                (user, i)
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Recompute the invariant from the vote rows themselves.
        let mut expected = 0i64;
        for i in 0..12i64 {
            let first = if i % 3 == 0 {
                VoteValue::Down
            } else {
                VoteValue::Up
            };
            let last = if i % 2 == 0 { first.flipped() } else { first };
            expected += last.as_delta();
        }
        assert_eq!(points(&storage, post).await, expected);
    }
}
