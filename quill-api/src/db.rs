//! Database Connection Pool and PostgreSQL Storage
//!
//! Connection pooling via deadpool-postgres, plus the PostgreSQL
//! implementation of the storage traits. Vote scopes map onto row-locked
//! transactions: `BEGIN`, `SELECT ... FOR UPDATE` on the post row, the
//! staged writes, then `COMMIT`. Writers of the same post queue on the row
//! lock; other posts proceed in parallel.

use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use quill_core::{
    EntityType, NewPost, NewUser, Post, PostId, PostUpdate, StorageError, Timestamp, User, UserId,
    Vote, VoteKey, VoteValue,
};
use quill_storage::{PostPage, Storage, VoteScope};
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};

use crate::error::{ApiError, ApiResult};

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Connection timeout
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "quill".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    /// Create a new database configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("QUILL_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("QUILL_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5432),
            dbname: std::env::var("QUILL_DB_NAME").unwrap_or_else(|_| "quill".to_string()),
            user: std::env::var("QUILL_DB_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("QUILL_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("QUILL_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(16),
            timeout: Duration::from_secs(
                std::env::var("QUILL_DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> ApiResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| ApiError::database_error(format!("Failed to create pool: {}", e)))?;

        Ok(pool)
    }
}

// ============================================================================
// ROW CONVERSION
// ============================================================================

fn row_to_user(row: &Row) -> User {
    User {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_post(row: &Row) -> Post {
    Post {
        id: row.get("id"),
        creator_id: row.get("creator_id"),
        title: row.get("title"),
        text: row.get("text"),
        points: row.get("points"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_vote(row: &Row) -> Result<Vote, StorageError> {
    let raw: i16 = row.get("value");
    let value = VoteValue::try_from(raw as i32).map_err(|_| StorageError::QueryFailed {
        reason: format!("vote row holds invalid value {}", raw),
    })?;
    Ok(Vote {
        user_id: row.get("user_id"),
        post_id: row.get("post_id"),
        value,
    })
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

fn entity_for_constraint(constraint: &str) -> EntityType {
    if constraint.starts_with("users") {
        EntityType::User
    } else if constraint.starts_with("posts") {
        EntityType::Post
    } else {
        EntityType::Vote
    }
}

/// Map a driver error into the storage taxonomy. Serialization failures
/// and deadlocks become transient conflicts the ledger can retry.
fn map_pg_error(err: tokio_postgres::Error) -> StorageError {
    if let Some(db_err) = err.as_db_error() {
        let code = db_err.code();
        if code == &SqlState::T_R_SERIALIZATION_FAILURE || code == &SqlState::T_R_DEADLOCK_DETECTED
        {
            return StorageError::Conflict {
                reason: db_err.message().to_string(),
            };
        }
        if code == &SqlState::UNIQUE_VIOLATION {
            let constraint = db_err.constraint().unwrap_or_default().to_string();
            return StorageError::AlreadyExists {
                entity: entity_for_constraint(&constraint),
                constraint,
            };
        }
        return StorageError::QueryFailed {
            reason: db_err.message().to_string(),
        };
    }
    if err.is_closed() {
        return StorageError::ConnectionFailed {
            reason: err.to_string(),
        };
    }
    StorageError::QueryFailed {
        reason: err.to_string(),
    }
}

fn map_pool_error(err: deadpool_postgres::PoolError) -> StorageError {
    StorageError::ConnectionFailed {
        reason: err.to_string(),
    }
}

// ============================================================================
// POSTGRES STORAGE
// ============================================================================

const SELECT_USER: &str =
    "SELECT id, username, email, password_hash, created_at, updated_at FROM users";
const SELECT_POST: &str =
    "SELECT id, creator_id, title, text, points, created_at, updated_at FROM posts";

/// PostgreSQL-backed storage.
#[derive(Clone)]
pub struct PgStorage {
    pool: Pool,
}

impl PgStorage {
    /// Create a new storage instance with the given pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create a new storage instance from configuration.
    pub fn from_config(config: &DbConfig) -> ApiResult<Self> {
        let pool = config.create_pool()?;
        Ok(Self::new(pool))
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    /// Verify pool connectivity with a trivial query.
    pub async fn health_check(&self) -> ApiResult<()> {
        let conn = self.pool.get().await?;
        conn.query_one("SELECT 1", &[]).await?;
        Ok(())
    }

    async fn get_conn(&self) -> Result<Object, StorageError> {
        self.pool.get().await.map_err(map_pool_error)
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn user_get(&self, id: UserId) -> Result<Option<User>, StorageError> {
        let conn = self.get_conn().await?;
        let query = format!("{} WHERE id = $1", SELECT_USER);
        let row = conn
            .query_opt(query.as_str(), &[&id])
            .await
            .map_err(map_pg_error)?;
        Ok(row.as_ref().map(row_to_user))
    }

    async fn user_get_by_ids(&self, ids: &[UserId]) -> Result<Vec<User>, StorageError> {
        let conn = self.get_conn().await?;
        let ids = ids.to_vec();
        let query = format!("{} WHERE id = ANY($1)", SELECT_USER);
        let rows = conn
            .query(query.as_str(), &[&ids])
            .await
            .map_err(map_pg_error)?;
        Ok(rows.iter().map(row_to_user).collect())
    }

    async fn user_get_by_username(&self, username: &str) -> Result<Option<User>, StorageError> {
        let conn = self.get_conn().await?;
        let query = format!("{} WHERE username = $1", SELECT_USER);
        let row = conn
            .query_opt(query.as_str(), &[&username])
            .await
            .map_err(map_pg_error)?;
        Ok(row.as_ref().map(row_to_user))
    }

    async fn user_get_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        let conn = self.get_conn().await?;
        let query = format!("{} WHERE email = $1", SELECT_USER);
        let row = conn
            .query_opt(query.as_str(), &[&email])
            .await
            .map_err(map_pg_error)?;
        Ok(row.as_ref().map(row_to_user))
    }

    async fn user_insert(&self, user: &NewUser) -> Result<User, StorageError> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO users (username, email, password_hash) \
                 VALUES ($1, $2, $3) \
                 RETURNING id, username, email, password_hash, created_at, updated_at",
                &[&user.username, &user.email, &user.password_hash],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(row_to_user(&row))
    }

    async fn user_set_password(
        &self,
        id: UserId,
        password_hash: &str,
    ) -> Result<(), StorageError> {
        let conn = self.get_conn().await?;
        let updated = conn
            .execute(
                "UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1",
                &[&id, &password_hash],
            )
            .await
            .map_err(map_pg_error)?;
        if updated == 0 {
            return Err(StorageError::NotFound {
                entity: EntityType::User,
                id,
            });
        }
        Ok(())
    }

    async fn post_get(&self, id: PostId) -> Result<Option<Post>, StorageError> {
        let conn = self.get_conn().await?;
        let query = format!("{} WHERE id = $1", SELECT_POST);
        let row = conn
            .query_opt(query.as_str(), &[&id])
            .await
            .map_err(map_pg_error)?;
        Ok(row.as_ref().map(row_to_post))
    }

    async fn post_insert(&self, post: &NewPost) -> Result<Post, StorageError> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO posts (creator_id, title, text) \
                 VALUES ($1, $2, $3) \
                 RETURNING id, creator_id, title, text, points, created_at, updated_at",
                &[&post.creator_id, &post.title, &post.text],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(row_to_post(&row))
    }

    async fn post_update(&self, id: PostId, update: PostUpdate) -> Result<Post, StorageError> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt(
                "UPDATE posts SET title = COALESCE($2, title), \
                 text = COALESCE($3, text), updated_at = NOW() \
                 WHERE id = $1 \
                 RETURNING id, creator_id, title, text, points, created_at, updated_at",
                &[&id, &update.title, &update.text],
            )
            .await
            .map_err(map_pg_error)?;
        match row {
            Some(row) => Ok(row_to_post(&row)),
            None => Err(StorageError::NotFound {
                entity: EntityType::Post,
                id,
            }),
        }
    }

    async fn post_delete(&self, id: PostId) -> Result<bool, StorageError> {
        // Votes go with the post via ON DELETE CASCADE.
        let conn = self.get_conn().await?;
        let deleted = conn
            .execute("DELETE FROM posts WHERE id = $1", &[&id])
            .await
            .map_err(map_pg_error)?;
        Ok(deleted > 0)
    }

    async fn post_list(
        &self,
        limit: usize,
        cursor: Option<Timestamp>,
    ) -> Result<PostPage, StorageError> {
        let conn = self.get_conn().await?;
        // One extra row answers has_more without a second query.
        let fetch = (limit + 1) as i64;
        let query = format!(
            "{} WHERE ($1::timestamptz IS NULL OR created_at < $1) \
             ORDER BY created_at DESC, id DESC LIMIT $2",
            SELECT_POST
        );
        let rows = conn
            .query(query.as_str(), &[&cursor, &fetch])
            .await
            .map_err(map_pg_error)?;

        let mut posts: Vec<Post> = rows.iter().map(row_to_post).collect();
        let has_more = posts.len() > limit;
        posts.truncate(limit);
        Ok(PostPage { posts, has_more })
    }

    async fn vote_get(&self, key: VoteKey) -> Result<Option<Vote>, StorageError> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt(
                "SELECT user_id, post_id, value FROM votes \
                 WHERE user_id = $1 AND post_id = $2",
                &[&key.user_id, &key.post_id],
            )
            .await
            .map_err(map_pg_error)?;
        row.as_ref().map(row_to_vote).transpose()
    }

    async fn vote_get_by_keys(&self, keys: &[VoteKey]) -> Result<Vec<Vote>, StorageError> {
        let conn = self.get_conn().await?;
        let user_ids: Vec<i64> = keys.iter().map(|k| k.user_id).collect();
        let post_ids: Vec<i64> = keys.iter().map(|k| k.post_id).collect();
        let rows = conn
            .query(
                "SELECT v.user_id, v.post_id, v.value FROM votes v \
                 JOIN unnest($1::bigint[], $2::bigint[]) AS k(user_id, post_id) \
                 ON v.user_id = k.user_id AND v.post_id = k.post_id",
                &[&user_ids, &post_ids],
            )
            .await
            .map_err(map_pg_error)?;
        rows.iter().map(row_to_vote).collect()
    }

    async fn begin_vote_scope(&self, post_id: PostId) -> Result<Box<dyn VoteScope>, StorageError> {
        let conn = self.get_conn().await?;
        conn.batch_execute("BEGIN").await.map_err(map_pg_error)?;
        Ok(Box::new(PgVoteScope {
            conn: Some(conn),
            post_id,
        }))
    }
}

// ============================================================================
// POSTGRES VOTE SCOPE
// ============================================================================

/// One cast-vote transaction. The first `post_get` takes a `FOR UPDATE`
/// row lock, serializing concurrent casts on the same post until commit
/// or rollback releases it.
///
/// The connection is held as an `Option` so that `Drop` can detect a
/// scope abandoned mid-transaction (the request future was cancelled)
/// and roll it back before the connection returns to the pool. Without
/// that, the next checkout would execute inside the stale transaction,
/// still holding the row lock.
struct PgVoteScope {
    conn: Option<Object>,
    post_id: PostId,
}

impl PgVoteScope {
    fn conn(&self) -> Result<&Object, StorageError> {
        self.conn.as_ref().ok_or_else(|| StorageError::ConnectionFailed {
            reason: "vote transaction already finished".to_string(),
        })
    }
}

impl Drop for PgVoteScope {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let post_id = self.post_id;
            tokio::spawn(async move {
                if let Err(err) = conn.batch_execute("ROLLBACK").await {
                    tracing::warn!(
                        post_id,
                        error = %err,
                        "failed to roll back abandoned vote transaction"
                    );
                }
            });
        }
    }
}

#[async_trait]
impl VoteScope for PgVoteScope {
    async fn post_get(&mut self) -> Result<Option<Post>, StorageError> {
        let query = format!("{} WHERE id = $1 FOR UPDATE", SELECT_POST);
        let row = self
            .conn()?
            .query_opt(query.as_str(), &[&self.post_id])
            .await
            .map_err(map_pg_error)?;
        Ok(row.as_ref().map(row_to_post))
    }

    async fn vote_get(&mut self, user_id: UserId) -> Result<Option<Vote>, StorageError> {
        let row = self
            .conn()?
            .query_opt(
                "SELECT user_id, post_id, value FROM votes \
                 WHERE user_id = $1 AND post_id = $2",
                &[&user_id, &self.post_id],
            )
            .await
            .map_err(map_pg_error)?;
        row.as_ref().map(row_to_vote).transpose()
    }

    async fn vote_insert(
        &mut self,
        user_id: UserId,
        value: VoteValue,
    ) -> Result<(), StorageError> {
        let raw = value.as_delta() as i16;
        self.conn()?
            .execute(
                "INSERT INTO votes (user_id, post_id, value) VALUES ($1, $2, $3)",
                &[&user_id, &self.post_id, &raw],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn vote_set_value(
        &mut self,
        user_id: UserId,
        value: VoteValue,
    ) -> Result<(), StorageError> {
        let raw = value.as_delta() as i16;
        self.conn()?
            .execute(
                "UPDATE votes SET value = $3 WHERE user_id = $1 AND post_id = $2",
                &[&user_id, &self.post_id, &raw],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn post_adjust_points(&mut self, delta: i64) -> Result<(), StorageError> {
        self.conn()?
            .execute(
                "UPDATE posts SET points = points + $2, updated_at = NOW() WHERE id = $1",
                &[&self.post_id, &delta],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        match self.conn.take() {
            Some(conn) => conn.batch_execute("COMMIT").await.map_err(map_pg_error),
            None => Err(StorageError::ConnectionFailed {
                reason: "vote transaction already finished".to_string(),
            }),
        }
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        match self.conn.take() {
            Some(conn) => conn.batch_execute("ROLLBACK").await.map_err(map_pg_error),
            None => Err(StorageError::ConnectionFailed {
                reason: "vote transaction already finished".to_string(),
            }),
        }
    }
}
