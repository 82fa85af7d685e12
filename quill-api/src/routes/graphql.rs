//! GraphQL API Routes
//!
//! This module implements the GraphQL endpoint using async-graphql.
//! It provides Query and Mutation resolvers for posts, users, and votes.
//!
//! Endpoints:
//! - POST /graphql - Execute GraphQL queries/mutations
//! - GET /graphql/playground - GraphiQL playground
//!
//! Per-request machinery: the handler resolves the session cookie into a
//! [`RequestSession`] and constructs fresh [`Loaders`], both injected into
//! the request context. Field resolvers that fan out (post creator, the
//! requester's vote per post) go through the loaders so one page of posts
//! costs one grouped query per entity type.

use async_graphql::{
    ComplexObject, Context, EmptySubscription, InputObject, Object, Result as GqlResult, Schema,
    SimpleObject, ID,
};
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use quill_core::{NewPost, NewUser, Post, PostId, PostUpdate, StorageError, User, UserId, VoteKey, VoteValue};
use quill_storage::{BatchLoader, Storage, UserByIdFetcher, VoteByKeyFetcher, VoteReceipt};
use std::sync::Arc;

use crate::password;
use crate::session::{
    clear_session_cookie, session_cookie, session_id_from_cookies, RequestSession, SessionCommand,
};
use crate::state::AppState;
use crate::validation::{validate_password, validate_register, FieldError};

/// Maximum page size for post listings. Larger requests are clamped, not
/// rejected.
const POSTS_PAGE_CAP: usize = 50;

// ============================================================================
// PER-REQUEST LOADERS
// ============================================================================

/// Batched lookups for one request. Constructed fresh per request so the
/// result caches never outlive it.
pub struct Loaders {
    pub users: BatchLoader<UserByIdFetcher>,
    pub votes: BatchLoader<VoteByKeyFetcher>,
}

impl Loaders {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            users: BatchLoader::new(UserByIdFetcher::new(Arc::clone(&storage))),
            votes: BatchLoader::new(VoteByKeyFetcher::new(storage)),
        }
    }
}

// ============================================================================
// GRAPHQL TYPES
// ============================================================================

/// GraphQL user object. The email field resolves to the empty string for
/// anyone but the account owner.
#[derive(Debug, Clone, SimpleObject)]
#[graphql(complex)]
pub struct GqlUser {
    pub id: ID,
    pub username: String,
    pub created_at: String,
    pub updated_at: String,
    #[graphql(skip)]
    user_id: UserId,
    #[graphql(skip)]
    raw_email: String,
}

#[ComplexObject]
impl GqlUser {
    /// The account email, visible only to its owner.
    async fn email(&self, ctx: &Context<'_>) -> String {
        let viewer = ctx
            .data_opt::<Arc<RequestSession>>()
            .and_then(|s| s.current_user());
        if viewer == Some(self.user_id) {
            self.raw_email.clone()
        } else {
            String::new()
        }
    }
}

impl From<User> for GqlUser {
    fn from(u: User) -> Self {
        Self {
            id: ID(u.id.to_string()),
            username: u.username,
            created_at: u.created_at.to_rfc3339(),
            updated_at: u.updated_at.to_rfc3339(),
            user_id: u.id,
            raw_email: u.email,
        }
    }
}

/// GraphQL post object.
#[derive(Debug, Clone, SimpleObject)]
#[graphql(complex)]
pub struct GqlPost {
    pub id: ID,
    pub title: String,
    pub text: String,
    pub points: i64,
    pub creator_id: ID,
    pub created_at: String,
    pub updated_at: String,
    #[graphql(skip)]
    post_id: PostId,
    #[graphql(skip)]
    creator_user_id: UserId,
    #[graphql(skip)]
    snippet: String,
}

#[ComplexObject]
impl GqlPost {
    /// Listing preview of the body, truncated on a character boundary.
    async fn text_snippet(&self) -> &str {
        &self.snippet
    }

    /// The post's author, fetched through the user loader.
    async fn creator(&self, ctx: &Context<'_>) -> GqlResult<GqlUser> {
        let loaders = ctx.data::<Loaders>()?;
        match loaders.users.load(self.creator_user_id).await {
            Ok(Some(user)) => Ok(user.into()),
            Ok(None) => Err(async_graphql::Error::new("Creator not found")),
            Err(e) => Err(async_graphql::Error::new(e.to_string())),
        }
    }

    /// The requester's vote on this post: 1, -1, or null when not voted
    /// (or not logged in). Fetched through the vote loader.
    async fn vote_status(&self, ctx: &Context<'_>) -> GqlResult<Option<i32>> {
        let session = ctx.data::<Arc<RequestSession>>()?;
        let Some(user_id) = session.current_user() else {
            return Ok(None);
        };
        let loaders = ctx.data::<Loaders>()?;
        let vote = loaders
            .votes
            .load(VoteKey::new(user_id, self.post_id))
            .await
            .map_err(|e| async_graphql::Error::new(e.to_string()))?;
        Ok(vote.map(|v| v.value.as_delta() as i32))
    }
}

impl From<Post> for GqlPost {
    fn from(p: Post) -> Self {
        let snippet = p.text_snippet().to_string();
        Self {
            id: ID(p.id.to_string()),
            title: p.title,
            text: p.text,
            points: p.points,
            creator_id: ID(p.creator_id.to_string()),
            created_at: p.created_at.to_rfc3339(),
            updated_at: p.updated_at.to_rfc3339(),
            post_id: p.id,
            creator_user_id: p.creator_id,
            snippet,
        }
    }
}

/// A validation failure attached to one input field.
#[derive(Debug, Clone, SimpleObject)]
pub struct GqlFieldError {
    pub field: String,
    pub message: String,
}

impl From<FieldError> for GqlFieldError {
    fn from(e: FieldError) -> Self {
        Self {
            field: e.field,
            message: e.message,
        }
    }
}

/// Account-mutation result: either field errors or the affected user,
/// never both.
#[derive(Debug, Clone, SimpleObject)]
pub struct UserResponse {
    pub errors: Option<Vec<GqlFieldError>>,
    pub user: Option<GqlUser>,
}

impl UserResponse {
    fn ok(user: User) -> Self {
        Self {
            errors: None,
            user: Some(user.into()),
        }
    }

    fn from_field_errors(errors: Vec<FieldError>) -> Self {
        Self {
            errors: Some(errors.into_iter().map(Into::into).collect()),
            user: None,
        }
    }

    fn field_error(field: &str, message: &str) -> Self {
        Self::from_field_errors(vec![FieldError::new(field, message)])
    }
}

/// One page of posts, newest first.
#[derive(Debug, Clone, SimpleObject)]
pub struct PaginatedPosts {
    pub posts: Vec<GqlPost>,
    pub has_more: bool,
}

/// Result of a cast vote: the post's new score and the value the vote
/// replaced, if any.
#[derive(Debug, Clone, SimpleObject)]
pub struct GqlVoteReceipt {
    pub post_id: ID,
    pub points: i64,
    pub previous_value: Option<i32>,
}

impl From<VoteReceipt> for GqlVoteReceipt {
    fn from(r: VoteReceipt) -> Self {
        Self {
            post_id: ID(r.post_id.to_string()),
            points: r.points,
            previous_value: r.previous.map(|v| v.as_delta() as i32),
        }
    }
}

// ============================================================================
// INPUT TYPES
// ============================================================================

/// Input for registering an account.
#[derive(Debug, Clone, InputObject)]
pub struct RegisterInput {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Input for creating a post.
#[derive(Debug, Clone, InputObject)]
pub struct PostInput {
    pub title: String,
    pub text: String,
}

// ============================================================================
// RESOLVER HELPERS
// ============================================================================

fn parse_id(id: &ID) -> GqlResult<i64> {
    id.0.parse::<i64>()
        .map_err(|_| async_graphql::Error::new("Invalid id"))
}

fn require_user(ctx: &Context<'_>) -> GqlResult<UserId> {
    let session = ctx.data::<Arc<RequestSession>>()?;
    session
        .current_user()
        .ok_or_else(|| async_graphql::Error::new("Not authenticated"))
}

fn storage_err(e: StorageError) -> async_graphql::Error {
    async_graphql::Error::new(e.to_string())
}

// ============================================================================
// QUERY ROOT
// ============================================================================

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// The currently logged-in user, or null.
    async fn me(&self, ctx: &Context<'_>) -> GqlResult<Option<GqlUser>> {
        let session = ctx.data::<Arc<RequestSession>>()?;
        let Some(user_id) = session.current_user() else {
            return Ok(None);
        };
        let state = ctx.data::<AppState>()?;
        let user = state.storage.user_get(user_id).await.map_err(storage_err)?;
        Ok(user.map(Into::into))
    }

    /// Get a post by id.
    async fn post(&self, ctx: &Context<'_>, id: ID) -> GqlResult<Option<GqlPost>> {
        let state = ctx.data::<AppState>()?;
        let post_id = parse_id(&id)?;
        let post = state.storage.post_get(post_id).await.map_err(storage_err)?;
        Ok(post.map(Into::into))
    }

    /// List posts newest first. `cursor` is the `createdAt` of the last
    /// post of the previous page; the page starts strictly after it.
    async fn posts(
        &self,
        ctx: &Context<'_>,
        limit: i32,
        cursor: Option<String>,
    ) -> GqlResult<PaginatedPosts> {
        let state = ctx.data::<AppState>()?;

        let limit = (limit.max(1) as usize).min(POSTS_PAGE_CAP);
        let cursor = cursor
            .map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|ts| ts.with_timezone(&Utc))
                    .map_err(|_| async_graphql::Error::new("Invalid cursor"))
            })
            .transpose()?;

        let page = state
            .storage
            .post_list(limit, cursor)
            .await
            .map_err(storage_err)?;
        Ok(PaginatedPosts {
            posts: page.posts.into_iter().map(Into::into).collect(),
            has_more: page.has_more,
        })
    }
}

// ============================================================================
// MUTATION ROOT
// ============================================================================

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    /// Register an account and log it in.
    async fn register(&self, ctx: &Context<'_>, input: RegisterInput) -> GqlResult<UserResponse> {
        let state = ctx.data::<AppState>()?;
        let session = ctx.data::<Arc<RequestSession>>()?;

        let errors = validate_register(&input.username, &input.email, &input.password);
        if !errors.is_empty() {
            return Ok(UserResponse::from_field_errors(errors));
        }

        let password_hash = password::hash_password(&input.password)
            .map_err(|e| async_graphql::Error::new(e.message))?;

        let new_user = NewUser {
            username: input.username,
            email: input.email,
            password_hash,
        };
        match state.storage.user_insert(&new_user).await {
            Ok(user) => {
                tracing::info!(user_id = user.id, username = %user.username, "user registered");
                session.log_in(user.id);
                Ok(UserResponse::ok(user))
            }
            Err(StorageError::AlreadyExists { constraint, .. }) => {
                if constraint.contains("email") {
                    Ok(UserResponse::field_error("email", "Email already in use"))
                } else {
                    Ok(UserResponse::field_error(
                        "username",
                        "Username already taken",
                    ))
                }
            }
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Log in with a username or email.
    async fn login(
        &self,
        ctx: &Context<'_>,
        username_or_email: String,
        password: String,
    ) -> GqlResult<UserResponse> {
        let state = ctx.data::<AppState>()?;
        let session = ctx.data::<Arc<RequestSession>>()?;

        let user = if username_or_email.contains('@') {
            state.storage.user_get_by_email(&username_or_email).await
        } else {
            state
                .storage
                .user_get_by_username(&username_or_email)
                .await
        }
        .map_err(storage_err)?;

        let Some(user) = user else {
            return Ok(UserResponse::field_error(
                "usernameOrEmail",
                "That user doesn't exist",
            ));
        };

        let valid = password::verify_password(&user.password_hash, &password)
            .map_err(|e| async_graphql::Error::new(e.message))?;
        if !valid {
            return Ok(UserResponse::field_error("password", "Incorrect password"));
        }

        session.log_in(user.id);
        Ok(UserResponse::ok(user))
    }

    /// Destroy the current session.
    async fn logout(&self, ctx: &Context<'_>) -> GqlResult<bool> {
        let session = ctx.data::<Arc<RequestSession>>()?;
        session.log_out();
        Ok(true)
    }

    /// Start a password reset. Always returns true so the response does
    /// not reveal whether the email exists.
    async fn forgot_password(&self, ctx: &Context<'_>, email: String) -> GqlResult<bool> {
        let state = ctx.data::<AppState>()?;

        let Some(user) = state
            .storage
            .user_get_by_email(&email)
            .await
            .map_err(storage_err)?
        else {
            return Ok(true);
        };

        let token = state
            .sessions
            .create_reset_token(user.id, state.config.reset_token_ttl)
            .await;
        let link = format!(
            "<a href=\"{}/change-password/{}\">reset password</a>",
            state.config.frontend_url, token
        );
        state
            .mailer
            .send(&email, "Reset your password", &link)
            .await
            .map_err(|e| async_graphql::Error::new(e.message))?;
        Ok(true)
    }

    /// Complete a password reset with a token from the reset email. Logs
    /// the user in on success.
    async fn change_password(
        &self,
        ctx: &Context<'_>,
        token: String,
        new_password: String,
    ) -> GqlResult<UserResponse> {
        let state = ctx.data::<AppState>()?;
        let session = ctx.data::<Arc<RequestSession>>()?;

        let errors = validate_password("newPassword", &new_password);
        if !errors.is_empty() {
            return Ok(UserResponse::from_field_errors(errors));
        }

        let Some(user_id) = state.sessions.consume_reset_token(&token).await else {
            return Ok(UserResponse::field_error("token", "Token expired"));
        };

        let Some(user) = state.storage.user_get(user_id).await.map_err(storage_err)? else {
            return Ok(UserResponse::field_error("token", "User no longer exists"));
        };

        let password_hash = password::hash_password(&new_password)
            .map_err(|e| async_graphql::Error::new(e.message))?;
        state
            .storage
            .user_set_password(user.id, &password_hash)
            .await
            .map_err(storage_err)?;

        session.log_in(user.id);
        Ok(UserResponse::ok(user))
    }

    /// Create a post. Requires login.
    async fn create_post(&self, ctx: &Context<'_>, input: PostInput) -> GqlResult<GqlPost> {
        let user_id = require_user(ctx)?;
        let state = ctx.data::<AppState>()?;

        let post = state
            .storage
            .post_insert(&NewPost {
                creator_id: user_id,
                title: input.title,
                text: input.text,
            })
            .await
            .map_err(storage_err)?;
        Ok(post.into())
    }

    /// Update a post's title and text. Only the creator may update; null
    /// when the post does not exist.
    async fn update_post(
        &self,
        ctx: &Context<'_>,
        id: ID,
        title: Option<String>,
        text: Option<String>,
    ) -> GqlResult<Option<GqlPost>> {
        let user_id = require_user(ctx)?;
        let state = ctx.data::<AppState>()?;
        let post_id = parse_id(&id)?;

        let Some(post) = state.storage.post_get(post_id).await.map_err(storage_err)? else {
            return Ok(None);
        };
        if post.creator_id != user_id {
            return Err(async_graphql::Error::new("Not authorized"));
        }

        let updated = state
            .storage
            .post_update(post_id, PostUpdate { title, text })
            .await
            .map_err(storage_err)?;
        Ok(Some(updated.into()))
    }

    /// Delete a post and its votes. Only the creator may delete; false
    /// when the post does not exist.
    async fn delete_post(&self, ctx: &Context<'_>, id: ID) -> GqlResult<bool> {
        let user_id = require_user(ctx)?;
        let state = ctx.data::<AppState>()?;
        let post_id = parse_id(&id)?;

        let Some(post) = state.storage.post_get(post_id).await.map_err(storage_err)? else {
            return Ok(false);
        };
        if post.creator_id != user_id {
            return Err(async_graphql::Error::new("Not authorized"));
        }

        state
            .storage
            .post_delete(post_id)
            .await
            .map_err(storage_err)
    }

    /// Cast a vote on a post: 1 for up, -1 for down. Re-casting the same
    /// value is rejected; casting the opposite value flips the vote.
    async fn vote(&self, ctx: &Context<'_>, post_id: ID, value: i32) -> GqlResult<GqlVoteReceipt> {
        let user_id = require_user(ctx)?;
        let state = ctx.data::<AppState>()?;
        let post_id = parse_id(&post_id)?;

        let value = VoteValue::try_from(value)
            .map_err(|_| async_graphql::Error::new("Vote value must be 1 or -1"))?;

        let receipt = state
            .ledger
            .cast_vote(user_id, post_id, value)
            .await
            .map_err(|e| async_graphql::Error::new(e.to_string()))?;
        Ok(receipt.into())
    }
}

// ============================================================================
// SCHEMA & HANDLERS
// ============================================================================

/// The GraphQL schema type.
pub type QuillSchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

/// Create the GraphQL schema with the shared application state.
pub fn create_schema(state: AppState) -> QuillSchema {
    Schema::build(QueryRoot, MutationRoot, EmptySubscription)
        .data(state)
        .finish()
}

/// Router state for the GraphQL endpoint.
#[derive(Clone)]
pub struct GraphqlState {
    pub schema: QuillSchema,
    pub app: AppState,
}

async fn resolve_session(app: &AppState, headers: &HeaderMap) -> RequestSession {
    let session_id = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| session_id_from_cookies(&app.config, cookies));

    let Some(session_id) = session_id else {
        return RequestSession::anonymous();
    };
    match app.sessions.get(&session_id).await {
        Some(user_id) => RequestSession::authenticated(session_id, user_id),
        None => RequestSession::anonymous(),
    }
}

fn append_set_cookie(response: &mut Response, cookie: &str) {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
}

/// Handler for GraphQL requests.
///
/// Resolves the session cookie before execution and applies any staged
/// login/logout to the response afterwards.
pub async fn graphql_handler(
    State(state): State<GraphqlState>,
    headers: HeaderMap,
    req: GraphQLRequest,
) -> Response {
    let session = Arc::new(resolve_session(&state.app, &headers).await);
    let loaders = Loaders::new(Arc::clone(&state.app.storage));

    let request = req
        .into_inner()
        .data(Arc::clone(&session))
        .data(loaders);
    let gql_response = state.schema.execute(request).await;
    let mut response = GraphQLResponse::from(gql_response).into_response();

    match session.command() {
        Some(SessionCommand::LogIn(user_id)) => {
            // A login replaces any session the request arrived with.
            if let Some(old) = session.session_id() {
                state.app.sessions.destroy(old).await;
            }
            let sid = state
                .app
                .sessions
                .create(user_id, state.app.config.session_ttl)
                .await;
            append_set_cookie(&mut response, &session_cookie(&state.app.config, &sid));
        }
        Some(SessionCommand::LogOut) => {
            if let Some(old) = session.session_id() {
                state.app.sessions.destroy(old).await;
            }
            append_set_cookie(&mut response, &clear_session_cookie(&state.app.config));
        }
        None => {}
    }
    response
}

/// Handler for GraphiQL playground.
pub async fn graphiql_handler() -> impl IntoResponse {
    Html(
        async_graphql::http::GraphiQLSource::build()
            .endpoint("/graphql")
            .finish(),
    )
}

// ============================================================================
// ROUTER SETUP
// ============================================================================

/// Create the GraphQL routes router.
pub fn create_router(app: AppState) -> Router {
    let schema = create_schema(app.clone());
    let state = GraphqlState { schema, app };

    Router::new()
        .route("/", post(graphql_handler))
        .route("/playground", get(graphiql_handler))
        .with_state(state)
}
