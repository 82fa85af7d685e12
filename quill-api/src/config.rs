//! API Configuration Module
//!
//! Configuration for CORS, sessions, and pagination limits. Loaded from
//! environment variables with sensible defaults for development.

use std::time::Duration;

// ============================================================================
// API CONFIGURATION
// ============================================================================

/// API configuration for CORS, sessions, and pagination.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Allowed CORS origins (comma-separated in env var).
    /// Empty means allow all origins (dev mode).
    pub cors_origins: Vec<String>,

    /// Name of the session cookie.
    pub session_cookie: String,

    /// Session lifetime.
    pub session_ttl: Duration,

    /// Password-reset token lifetime.
    pub reset_token_ttl: Duration,

    /// Mark the session cookie `Secure` (HTTPS only).
    pub cookie_secure: bool,

    /// Base URL used in password-reset links.
    pub frontend_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            cors_origins: Vec::new(), // Empty = allow all
            session_cookie: "qid".to_string(),
            session_ttl: Duration::from_secs(60 * 60 * 24 * 365), // 1 year
            reset_token_ttl: Duration::from_secs(60 * 60 * 24 * 3), // 3 days
            cookie_secure: false,
            frontend_url: "http://localhost:3000".to_string(),
        }
    }
}

impl ApiConfig {
    /// Create ApiConfig from environment variables.
    ///
    /// Environment variables:
    /// - `QUILL_CORS_ORIGINS`: Comma-separated allowed origins (empty = allow all)
    /// - `QUILL_SESSION_COOKIE`: Session cookie name (default: "qid")
    /// - `QUILL_SESSION_TTL_SECS`: Session lifetime (default: 1 year)
    /// - `QUILL_RESET_TOKEN_TTL_SECS`: Reset token lifetime (default: 3 days)
    /// - `QUILL_COOKIE_SECURE`: "true" or "false" (default: false)
    /// - `QUILL_FRONTEND_URL`: Base URL for reset links
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cors_origins = std::env::var("QUILL_CORS_ORIGINS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let session_cookie =
            std::env::var("QUILL_SESSION_COOKIE").unwrap_or(defaults.session_cookie);

        let session_ttl = std::env::var("QUILL_SESSION_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.session_ttl);

        let reset_token_ttl = std::env::var("QUILL_RESET_TOKEN_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.reset_token_ttl);

        let cookie_secure = std::env::var("QUILL_COOKIE_SECURE")
            .ok()
            .map(|s| s.to_lowercase() == "true")
            .unwrap_or(false);

        let frontend_url = std::env::var("QUILL_FRONTEND_URL").unwrap_or(defaults.frontend_url);

        Self {
            cors_origins,
            session_cookie,
            session_ttl,
            reset_token_ttl,
            cookie_secure,
            frontend_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ApiConfig::default();
        assert_eq!(config.session_cookie, "qid");
        assert!(config.cors_origins.is_empty());
        assert_eq!(config.reset_token_ttl, Duration::from_secs(259200));
    }
}
