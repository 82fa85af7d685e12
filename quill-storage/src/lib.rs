//! Quill Storage - Storage Traits, Vote Ledger, and Batched Lookup
//!
//! Defines the storage abstraction layer for Quill entities and the two
//! request-serving components built on top of it: the vote ledger
//! (read-modify-write of a post's aggregate score under a transactional
//! scope) and the batch loader (per-request coalescing of point lookups).
//! The PostgreSQL implementation lives in quill-api.

pub mod ledger;
pub mod loader;

pub use ledger::{VoteLedger, VoteReceipt};
pub use loader::{BatchError, BatchFetch, BatchLoader, UserByIdFetcher, VoteByKeyFetcher};

use async_trait::async_trait;
use quill_core::{
    EntityType, NewPost, NewUser, Post, PostId, PostUpdate, StorageError, Timestamp, User, UserId,
    Vote, VoteKey, VoteValue,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Result of a paginated post listing: newest first, `has_more` when rows
/// remain past the requested page.
#[derive(Debug, Clone, PartialEq)]
pub struct PostPage {
    pub posts: Vec<Post>,
    pub has_more: bool,
}

// ============================================================================
// STORAGE TRAITS
// ============================================================================

/// Storage trait for Quill entities.
///
/// Point reads, grouped reads (one round trip for many keys), and writes.
/// Vote mutations never go through this trait directly: they pass through
/// a [`VoteScope`] so the vote row and the post's points move together.
#[async_trait]
pub trait Storage: Send + Sync {
    // === User Operations ===

    /// Get a user by id.
    async fn user_get(&self, id: UserId) -> Result<Option<User>, StorageError>;

    /// Fetch many users in one grouped query. Order is unspecified; absent
    /// ids are simply missing from the result.
    async fn user_get_by_ids(&self, ids: &[UserId]) -> Result<Vec<User>, StorageError>;

    /// Get a user by exact username.
    async fn user_get_by_username(&self, username: &str) -> Result<Option<User>, StorageError>;

    /// Get a user by exact email.
    async fn user_get_by_email(&self, email: &str) -> Result<Option<User>, StorageError>;

    /// Insert a new user. Fails with `AlreadyExists` on username/email
    /// collision; the constraint name tells the caller which field.
    async fn user_insert(&self, user: &NewUser) -> Result<User, StorageError>;

    /// Replace a user's password hash.
    async fn user_set_password(&self, id: UserId, password_hash: &str)
        -> Result<(), StorageError>;

    // === Post Operations ===

    /// Get a post by id.
    async fn post_get(&self, id: PostId) -> Result<Option<Post>, StorageError>;

    /// Insert a new post.
    async fn post_insert(&self, post: &NewPost) -> Result<Post, StorageError>;

    /// Update a post's title/text.
    async fn post_update(&self, id: PostId, update: PostUpdate) -> Result<Post, StorageError>;

    /// Delete a post and its votes. Returns false when the post is absent.
    async fn post_delete(&self, id: PostId) -> Result<bool, StorageError>;

    /// List posts newest first, starting strictly after `cursor` when given.
    /// Fetches up to `limit + 1` rows to compute `has_more`.
    async fn post_list(
        &self,
        limit: usize,
        cursor: Option<Timestamp>,
    ) -> Result<PostPage, StorageError>;

    // === Vote Operations ===

    /// Get the vote for one (user, post) pair.
    async fn vote_get(&self, key: VoteKey) -> Result<Option<Vote>, StorageError>;

    /// Fetch many votes in one grouped query, keyed by (user, post).
    async fn vote_get_by_keys(&self, keys: &[VoteKey]) -> Result<Vec<Vote>, StorageError>;

    /// Open a transactional scope for mutating votes on one post. Writers
    /// of the same post serialize on this scope; other posts are untouched.
    async fn begin_vote_scope(&self, post_id: PostId) -> Result<Box<dyn VoteScope>, StorageError>;
}

/// Transactional scope for one cast-vote operation.
///
/// All reads see committed state as of the scope opening; all writes are
/// applied atomically on `commit` or discarded on `rollback`. Dropping a
/// scope without committing discards its writes.
#[async_trait]
pub trait VoteScope: Send {
    /// The post under mutation, row-locked for the scope's lifetime.
    async fn post_get(&mut self) -> Result<Option<Post>, StorageError>;

    /// The caller's existing vote on the post, if any.
    async fn vote_get(&mut self, user_id: UserId) -> Result<Option<Vote>, StorageError>;

    /// Stage a new vote row.
    async fn vote_insert(&mut self, user_id: UserId, value: VoteValue)
        -> Result<(), StorageError>;

    /// Stage an in-place value change on the existing vote row.
    async fn vote_set_value(
        &mut self,
        user_id: UserId,
        value: VoteValue,
    ) -> Result<(), StorageError>;

    /// Stage a points adjustment on the post.
    async fn post_adjust_points(&mut self, delta: i64) -> Result<(), StorageError>;

    /// Commit every staged write atomically.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Discard every staged write.
    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

// ============================================================================
// IN-MEMORY STORAGE
// ============================================================================

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    posts: HashMap<PostId, Post>,
    votes: HashMap<VoteKey, Vote>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    tables: RwLock<Tables>,
    post_locks: Mutex<HashMap<PostId, Arc<tokio::sync::Mutex<()>>>>,
    next_user_id: AtomicI64,
    next_post_id: AtomicI64,
    user_batch_fetches: AtomicUsize,
    vote_batch_fetches: AtomicUsize,
    commit_faults: AtomicUsize,
}

/// In-memory storage for tests.
///
/// Vote scopes take a per-post async lock, stage their writes, and apply
/// them on commit, mirroring the row-locked transaction the PostgreSQL
/// implementation runs. Grouped-fetch counters and injectable commit
/// faults exist so tests can assert batching and retry behavior.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<MemoryInner>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many grouped user fetches have run.
    pub fn user_batch_fetches(&self) -> usize {
        self.inner.user_batch_fetches.load(Ordering::SeqCst)
    }

    /// How many grouped vote fetches have run.
    pub fn vote_batch_fetches(&self) -> usize {
        self.inner.vote_batch_fetches.load(Ordering::SeqCst)
    }

    /// Make the next `n` vote-scope commits fail with a transient conflict.
    pub fn fail_next_commits(&self, n: usize) {
        self.inner.commit_faults.store(n, Ordering::SeqCst);
    }

    /// Count of stored users.
    pub fn user_count(&self) -> usize {
        self.inner.tables.read().unwrap().users.len()
    }

    /// Count of stored posts.
    pub fn post_count(&self) -> usize {
        self.inner.tables.read().unwrap().posts.len()
    }

    /// Count of stored votes.
    pub fn vote_count(&self) -> usize {
        self.inner.tables.read().unwrap().votes.len()
    }

    fn post_lock(&self, post_id: PostId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.post_locks.lock().unwrap();
        locks
            .entry(post_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    // === User Operations ===

    async fn user_get(&self, id: UserId) -> Result<Option<User>, StorageError> {
        let tables = self.inner.tables.read().unwrap();
        Ok(tables.users.get(&id).cloned())
    }

    async fn user_get_by_ids(&self, ids: &[UserId]) -> Result<Vec<User>, StorageError> {
        self.inner.user_batch_fetches.fetch_add(1, Ordering::SeqCst);
        let tables = self.inner.tables.read().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| tables.users.get(id).cloned())
            .collect())
    }

    async fn user_get_by_username(&self, username: &str) -> Result<Option<User>, StorageError> {
        let tables = self.inner.tables.read().unwrap();
        Ok(tables
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn user_get_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        let tables = self.inner.tables.read().unwrap();
        Ok(tables.users.values().find(|u| u.email == email).cloned())
    }

    async fn user_insert(&self, user: &NewUser) -> Result<User, StorageError> {
        let mut tables = self.inner.tables.write().unwrap();
        if tables.users.values().any(|u| u.username == user.username) {
            return Err(StorageError::AlreadyExists {
                entity: EntityType::User,
                constraint: "users_username_key".to_string(),
            });
        }
        if tables.users.values().any(|u| u.email == user.email) {
            return Err(StorageError::AlreadyExists {
                entity: EntityType::User,
                constraint: "users_email_key".to_string(),
            });
        }
        let id = self.inner.next_user_id.fetch_add(1, Ordering::SeqCst) + 1;
        let created = User::new(
            id,
            user.username.clone(),
            user.email.clone(),
            user.password_hash.clone(),
        );
        tables.users.insert(id, created.clone());
        Ok(created)
    }

    async fn user_set_password(
        &self,
        id: UserId,
        password_hash: &str,
    ) -> Result<(), StorageError> {
        let mut tables = self.inner.tables.write().unwrap();
        let user = tables.users.get_mut(&id).ok_or(StorageError::NotFound {
            entity: EntityType::User,
            id,
        })?;
        user.password_hash = password_hash.to_string();
        user.updated_at = chrono::Utc::now();
        Ok(())
    }

    // === Post Operations ===

    async fn post_get(&self, id: PostId) -> Result<Option<Post>, StorageError> {
        let tables = self.inner.tables.read().unwrap();
        Ok(tables.posts.get(&id).cloned())
    }

    async fn post_insert(&self, post: &NewPost) -> Result<Post, StorageError> {
        let mut tables = self.inner.tables.write().unwrap();
        if !tables.users.contains_key(&post.creator_id) {
            return Err(StorageError::NotFound {
                entity: EntityType::User,
                id: post.creator_id,
            });
        }
        let id = self.inner.next_post_id.fetch_add(1, Ordering::SeqCst) + 1;
        let created = Post::new(id, post.creator_id, post.title.clone(), post.text.clone());
        tables.posts.insert(id, created.clone());
        Ok(created)
    }

    async fn post_update(&self, id: PostId, update: PostUpdate) -> Result<Post, StorageError> {
        let mut tables = self.inner.tables.write().unwrap();
        let post = tables.posts.get_mut(&id).ok_or(StorageError::NotFound {
            entity: EntityType::Post,
            id,
        })?;
        if let Some(title) = update.title {
            post.title = title;
        }
        if let Some(text) = update.text {
            post.text = text;
        }
        post.updated_at = chrono::Utc::now();
        Ok(post.clone())
    }

    async fn post_delete(&self, id: PostId) -> Result<bool, StorageError> {
        let mut tables = self.inner.tables.write().unwrap();
        if tables.posts.remove(&id).is_none() {
            return Ok(false);
        }
        tables.votes.retain(|key, _| key.post_id != id);
        Ok(true)
    }

    async fn post_list(
        &self,
        limit: usize,
        cursor: Option<Timestamp>,
    ) -> Result<PostPage, StorageError> {
        let tables = self.inner.tables.read().unwrap();
        let mut posts: Vec<Post> = tables
            .posts
            .values()
            .filter(|p| cursor.map(|c| p.created_at < c).unwrap_or(true))
            .cloned()
            .collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let has_more = posts.len() > limit;
        posts.truncate(limit);
        Ok(PostPage { posts, has_more })
    }

    // === Vote Operations ===

    async fn vote_get(&self, key: VoteKey) -> Result<Option<Vote>, StorageError> {
        let tables = self.inner.tables.read().unwrap();
        Ok(tables.votes.get(&key).copied())
    }

    async fn vote_get_by_keys(&self, keys: &[VoteKey]) -> Result<Vec<Vote>, StorageError> {
        self.inner.vote_batch_fetches.fetch_add(1, Ordering::SeqCst);
        let tables = self.inner.tables.read().unwrap();
        Ok(keys
            .iter()
            .filter_map(|key| tables.votes.get(key).copied())
            .collect())
    }

    async fn begin_vote_scope(&self, post_id: PostId) -> Result<Box<dyn VoteScope>, StorageError> {
        let guard = self.post_lock(post_id).lock_owned().await;
        Ok(Box::new(MemoryVoteScope {
            inner: Arc::clone(&self.inner),
            post_id,
            staged: Vec::new(),
            _guard: guard,
        }))
    }
}

/// Staged write inside a [`MemoryVoteScope`].
#[derive(Debug, Clone)]
enum Staged {
    InsertVote(Vote),
    SetVoteValue(VoteKey, VoteValue),
    AdjustPoints(i64),
}

struct MemoryVoteScope {
    inner: Arc<MemoryInner>,
    post_id: PostId,
    staged: Vec<Staged>,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

#[async_trait]
impl VoteScope for MemoryVoteScope {
    async fn post_get(&mut self) -> Result<Option<Post>, StorageError> {
        let tables = self.inner.tables.read().unwrap();
        Ok(tables.posts.get(&self.post_id).cloned())
    }

    async fn vote_get(&mut self, user_id: UserId) -> Result<Option<Vote>, StorageError> {
        let tables = self.inner.tables.read().unwrap();
        Ok(tables
            .votes
            .get(&VoteKey::new(user_id, self.post_id))
            .copied())
    }

    async fn vote_insert(
        &mut self,
        user_id: UserId,
        value: VoteValue,
    ) -> Result<(), StorageError> {
        self.staged
            .push(Staged::InsertVote(Vote::new(user_id, self.post_id, value)));
        Ok(())
    }

    async fn vote_set_value(
        &mut self,
        user_id: UserId,
        value: VoteValue,
    ) -> Result<(), StorageError> {
        self.staged.push(Staged::SetVoteValue(
            VoteKey::new(user_id, self.post_id),
            value,
        ));
        Ok(())
    }

    async fn post_adjust_points(&mut self, delta: i64) -> Result<(), StorageError> {
        self.staged.push(Staged::AdjustPoints(delta));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        if self.inner.commit_faults.load(Ordering::SeqCst) > 0 {
            self.inner.commit_faults.fetch_sub(1, Ordering::SeqCst);
            return Err(StorageError::Conflict {
                reason: "injected commit fault".to_string(),
            });
        }

        let mut tables = self.inner.tables.write().unwrap();
        for write in &self.staged {
            match write {
                Staged::InsertVote(vote) => {
                    tables.votes.insert(vote.key(), *vote);
                }
                Staged::SetVoteValue(key, value) => {
                    if let Some(vote) = tables.votes.get_mut(key) {
                        vote.value = *value;
                    }
                }
                Staged::AdjustPoints(delta) => {
                    if let Some(post) = tables.posts.get_mut(&self.post_id) {
                        post.points += delta;
                        post.updated_at = chrono::Utc::now();
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        // Staged writes and the post lock drop together.
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::NewUser;

    async fn seed_user(storage: &MemoryStorage, name: &str) -> User {
        storage
            .user_insert(&NewUser {
                username: name.to_string(),
                email: format!("{}@example.com", name),
                password_hash: "hash".to_string(),
            })
            .await
            .unwrap()
    }

    async fn seed_post(storage: &MemoryStorage, creator: UserId, title: &str) -> Post {
        storage
            .post_insert(&NewPost {
                creator_id: creator,
                title: title.to_string(),
                text: format!("{} body", title),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_user_insert_get() {
        let storage = MemoryStorage::new();
        let user = seed_user(&storage, "alice").await;

        let fetched = storage.user_get(user.id).await.unwrap();
        assert_eq!(fetched.unwrap().username, "alice");

        let by_name = storage.user_get_by_username("alice").await.unwrap();
        assert_eq!(by_name.unwrap().id, user.id);

        let by_email = storage.user_get_by_email("alice@example.com").await.unwrap();
        assert_eq!(by_email.unwrap().id, user.id);
    }

    #[tokio::test]
    async fn test_user_insert_duplicate_username() {
        let storage = MemoryStorage::new();
        seed_user(&storage, "alice").await;

        let result = storage
            .user_insert(&NewUser {
                username: "alice".to_string(),
                email: "other@example.com".to_string(),
                password_hash: "hash".to_string(),
            })
            .await;

        match result {
            Err(StorageError::AlreadyExists { constraint, .. }) => {
                assert!(constraint.contains("username"));
            }
            other => panic!("expected AlreadyExists, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_user_insert_duplicate_email() {
        let storage = MemoryStorage::new();
        seed_user(&storage, "alice").await;

        let result = storage
            .user_insert(&NewUser {
                username: "bob".to_string(),
                email: "alice@example.com".to_string(),
                password_hash: "hash".to_string(),
            })
            .await;

        match result {
            Err(StorageError::AlreadyExists { constraint, .. }) => {
                assert!(constraint.contains("email"));
            }
            other => panic!("expected AlreadyExists, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_post_insert_requires_creator() {
        let storage = MemoryStorage::new();
        let result = storage
            .post_insert(&NewPost {
                creator_id: 99,
                title: "t".to_string(),
                text: "x".to_string(),
            })
            .await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_post_update_and_delete() {
        let storage = MemoryStorage::new();
        let user = seed_user(&storage, "alice").await;
        let post = seed_post(&storage, user.id, "first").await;

        let updated = storage
            .post_update(
                post.id,
                PostUpdate {
                    title: Some("renamed".to_string()),
                    text: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "renamed");
        assert_eq!(updated.text, "first body");

        assert!(storage.post_delete(post.id).await.unwrap());
        assert!(!storage.post_delete(post.id).await.unwrap());
        assert!(storage.post_get(post.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_post_delete_cascades_votes() {
        let storage = MemoryStorage::new();
        let user = seed_user(&storage, "alice").await;
        let post = seed_post(&storage, user.id, "first").await;

        let mut scope = storage.begin_vote_scope(post.id).await.unwrap();
        scope.vote_insert(user.id, VoteValue::Up).await.unwrap();
        scope.post_adjust_points(1).await.unwrap();
        scope.commit().await.unwrap();
        assert_eq!(storage.vote_count(), 1);

        storage.post_delete(post.id).await.unwrap();
        assert_eq!(storage.vote_count(), 0);
    }

    #[tokio::test]
    async fn test_post_list_newest_first_with_cursor() {
        let storage = MemoryStorage::new();
        let user = seed_user(&storage, "alice").await;
        for i in 0..5 {
            seed_post(&storage, user.id, &format!("post {}", i)).await;
        }

        let page = storage.post_list(3, None).await.unwrap();
        assert_eq!(page.posts.len(), 3);
        assert!(page.has_more);
        // Newest first: ids descend with insertion order here.
        assert!(page.posts[0].id > page.posts[1].id);

        let cursor = page.posts.last().unwrap().created_at;
        let rest = storage.post_list(10, Some(cursor)).await.unwrap();
        assert!(!rest.has_more);
        for post in &rest.posts {
            assert!(post.created_at < cursor);
        }
    }

    #[tokio::test]
    async fn test_vote_scope_commit_applies_staged_writes() {
        let storage = MemoryStorage::new();
        let user = seed_user(&storage, "alice").await;
        let post = seed_post(&storage, user.id, "first").await;

        let mut scope = storage.begin_vote_scope(post.id).await.unwrap();
        assert!(scope.post_get().await.unwrap().is_some());
        assert!(scope.vote_get(user.id).await.unwrap().is_none());
        scope.vote_insert(user.id, VoteValue::Up).await.unwrap();
        scope.post_adjust_points(1).await.unwrap();
        scope.commit().await.unwrap();

        let post = storage.post_get(post.id).await.unwrap().unwrap();
        assert_eq!(post.points, 1);
        let vote = storage
            .vote_get(VoteKey::new(user.id, post.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(vote.value, VoteValue::Up);
    }

    #[tokio::test]
    async fn test_vote_scope_rollback_discards_staged_writes() {
        let storage = MemoryStorage::new();
        let user = seed_user(&storage, "alice").await;
        let post = seed_post(&storage, user.id, "first").await;

        let mut scope = storage.begin_vote_scope(post.id).await.unwrap();
        scope.vote_insert(user.id, VoteValue::Down).await.unwrap();
        scope.post_adjust_points(-1).await.unwrap();
        scope.rollback().await.unwrap();

        let post = storage.post_get(post.id).await.unwrap().unwrap();
        assert_eq!(post.points, 0);
        assert_eq!(storage.vote_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_scope_releases_post_and_discards_writes() {
        // A scope dropped without commit or rollback (the caller was
        // cancelled) must not block later scopes on the same post or
        // leave any staged write behind.
        let storage = MemoryStorage::new();
        let user = seed_user(&storage, "alice").await;
        let post = seed_post(&storage, user.id, "first").await;

        let mut scope = storage.begin_vote_scope(post.id).await.unwrap();
        scope.vote_insert(user.id, VoteValue::Up).await.unwrap();
        scope.post_adjust_points(1).await.unwrap();
        drop(scope);

        let mut scope = storage.begin_vote_scope(post.id).await.unwrap();
        assert_eq!(scope.post_get().await.unwrap().unwrap().points, 0);
        assert!(scope.vote_get(user.id).await.unwrap().is_none());
        scope.rollback().await.unwrap();
        assert_eq!(storage.vote_count(), 0);
    }

    #[tokio::test]
    async fn test_vote_scope_injected_fault_consumed_once() {
        let storage = MemoryStorage::new();
        let user = seed_user(&storage, "alice").await;
        let post = seed_post(&storage, user.id, "first").await;

        storage.fail_next_commits(1);

        let mut scope = storage.begin_vote_scope(post.id).await.unwrap();
        scope.vote_insert(user.id, VoteValue::Up).await.unwrap();
        scope.post_adjust_points(1).await.unwrap();
        let err = scope.commit().await.unwrap_err();
        assert!(err.is_transient());

        // Faults are consumed; the retry goes through.
        let mut scope = storage.begin_vote_scope(post.id).await.unwrap();
        scope.vote_insert(user.id, VoteValue::Up).await.unwrap();
        scope.post_adjust_points(1).await.unwrap();
        scope.commit().await.unwrap();
        assert_eq!(storage.post_get(post.id).await.unwrap().unwrap().points, 1);
    }

    #[tokio::test]
    async fn test_grouped_fetch_counters() {
        let storage = MemoryStorage::new();
        let alice = seed_user(&storage, "alice").await;
        let bob = seed_user(&storage, "bob").await;

        assert_eq!(storage.user_batch_fetches(), 0);
        let users = storage.user_get_by_ids(&[alice.id, bob.id, 999]).await.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(storage.user_batch_fetches(), 1);

        let votes = storage
            .vote_get_by_keys(&[VoteKey::new(alice.id, 1)])
            .await
            .unwrap();
        assert!(votes.is_empty());
        assert_eq!(storage.vote_batch_fetches(), 1);
    }
}
