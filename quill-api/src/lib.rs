//! Quill API - GraphQL Layer
//!
//! HTTP surface of Quill: an axum server exposing a GraphQL schema over
//! the storage and ledger layers, with cookie sessions, Argon2 password
//! hashing, and a PostgreSQL storage backend.

pub mod config;
pub mod db;
pub mod error;
pub mod mailer;
pub mod password;
pub mod routes;
pub mod session;
pub mod state;
pub mod telemetry;
pub mod validation;

pub use config::ApiConfig;
pub use db::{DbConfig, PgStorage};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use mailer::{LogMailer, Mailer};
pub use routes::create_api_router;
pub use session::{InMemorySessionStore, RequestSession, SessionStore};
pub use state::AppState;
