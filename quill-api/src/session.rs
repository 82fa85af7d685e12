//! Session Management
//!
//! Cookie-backed sessions: the client holds an opaque session id in the
//! session cookie and the server maps it to a user id. The store behind
//! the mapping is a trait so deployments can swap the in-memory store for
//! Redis or Postgres without touching the resolvers.
//!
//! Password-reset tokens live in the same store. They are single use:
//! consuming a token removes it.

use async_trait::async_trait;
use quill_core::UserId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::ApiConfig;

// ============================================================================
// SESSION STORE
// ============================================================================

/// Server-side session and reset-token storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session for the user and return its opaque id.
    async fn create(&self, user_id: UserId, ttl: Duration) -> String;

    /// Resolve a session id to a user id, if the session is live.
    async fn get(&self, session_id: &str) -> Option<UserId>;

    /// Destroy a session. Destroying an unknown id is a no-op.
    async fn destroy(&self, session_id: &str);

    /// Create a single-use password-reset token for the user.
    async fn create_reset_token(&self, user_id: UserId, ttl: Duration) -> String;

    /// Consume a reset token, returning its user if the token is live.
    /// The token is removed whether or not the caller completes the reset.
    async fn consume_reset_token(&self, token: &str) -> Option<UserId>;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    user_id: UserId,
    expires_at: Instant,
}

impl Entry {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// In-memory session store for development and tests.
///
/// Sessions do not survive a restart. Expired entries are dropped lazily
/// on lookup.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Entry>>,
    reset_tokens: RwLock<HashMap<String, Entry>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, user_id: UserId, ttl: Duration) -> String {
        let session_id = Uuid::new_v4().to_string();
        let entry = Entry {
            user_id,
            expires_at: Instant::now() + ttl,
        };
        self.sessions.write().await.insert(session_id.clone(), entry);
        session_id
    }

    async fn get(&self, session_id: &str) -> Option<UserId> {
        {
            let sessions = self.sessions.read().await;
            match sessions.get(session_id) {
                Some(entry) if entry.live() => return Some(entry.user_id),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: drop the entry.
        self.sessions.write().await.remove(session_id);
        None
    }

    async fn destroy(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    async fn create_reset_token(&self, user_id: UserId, ttl: Duration) -> String {
        let token = Uuid::new_v4().to_string();
        let entry = Entry {
            user_id,
            expires_at: Instant::now() + ttl,
        };
        self.reset_tokens.write().await.insert(token.clone(), entry);
        token
    }

    async fn consume_reset_token(&self, token: &str) -> Option<UserId> {
        let entry = self.reset_tokens.write().await.remove(token)?;
        entry.live().then_some(entry.user_id)
    }
}

// ============================================================================
// PER-REQUEST SESSION
// ============================================================================

/// Session change requested by a resolver, applied to the HTTP response
/// after GraphQL execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    LogIn(UserId),
    LogOut,
}

#[derive(Debug, Default)]
struct RequestSessionState {
    user_id: Option<UserId>,
    command: Option<SessionCommand>,
}

/// The request's view of its session.
///
/// Built by the HTTP handler from the session cookie and injected into the
/// GraphQL context. Resolvers read the current user and stage login/logout;
/// a login is visible to later resolvers in the same request.
#[derive(Debug)]
pub struct RequestSession {
    session_id: Option<String>,
    state: Mutex<RequestSessionState>,
}

impl RequestSession {
    /// Session for a request carrying no (or an unknown) session cookie.
    pub fn anonymous() -> Self {
        Self {
            session_id: None,
            state: Mutex::new(RequestSessionState::default()),
        }
    }

    /// Session for a request whose cookie resolved to a user.
    pub fn authenticated(session_id: String, user_id: UserId) -> Self {
        Self {
            session_id: Some(session_id),
            state: Mutex::new(RequestSessionState {
                user_id: Some(user_id),
                command: None,
            }),
        }
    }

    /// The session id from the request cookie, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// The user the request is acting as, reflecting any login or logout
    /// staged earlier in the same request.
    pub fn current_user(&self) -> Option<UserId> {
        self.state.lock().unwrap().user_id
    }

    /// Stage a login for the given user.
    pub fn log_in(&self, user_id: UserId) {
        let mut state = self.state.lock().unwrap();
        state.user_id = Some(user_id);
        state.command = Some(SessionCommand::LogIn(user_id));
    }

    /// Stage a logout.
    pub fn log_out(&self) {
        let mut state = self.state.lock().unwrap();
        state.user_id = None;
        state.command = Some(SessionCommand::LogOut);
    }

    /// The staged session change, if any.
    pub fn command(&self) -> Option<SessionCommand> {
        self.state.lock().unwrap().command
    }
}

// ============================================================================
// COOKIE HELPERS
// ============================================================================

/// `Set-Cookie` value establishing a session.
pub fn session_cookie(config: &ApiConfig, session_id: &str) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        config.session_cookie,
        session_id,
        config.session_ttl.as_secs()
    );
    if config.cookie_secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// `Set-Cookie` value clearing the session cookie.
pub fn clear_session_cookie(config: &ApiConfig) -> String {
    format!(
        "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
        config.session_cookie
    )
}

/// Extract the session id from a `Cookie` header value.
pub fn session_id_from_cookies(config: &ApiConfig, cookie_header: &str) -> Option<String> {
    cookie_header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == config.session_cookie && !value.is_empty()).then(|| value.to_string())
    })
}
