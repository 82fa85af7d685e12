//! Outbound Mail
//!
//! The password-reset flow needs to deliver a link out of band. The trait
//! keeps delivery swappable; the default implementation writes the mail to
//! the log, which is what development and tests want.

use async_trait::async_trait;

use crate::error::ApiResult;

/// Outbound mail delivery.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> ApiResult<()>;
}

/// Mailer that logs instead of sending. The reset link ends up in the
/// server log, where a developer can copy it.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> ApiResult<()> {
        tracing::info!(%to, %subject, body = %html, "outbound mail");
        Ok(())
    }
}
