//! Shared Application State
//!
//! Everything a request handler needs: the storage backend, the vote
//! ledger built on it, sessions, mail, and configuration. Cloning is
//! cheap; all members are behind `Arc`.

use quill_storage::{Storage, VoteLedger};
use std::sync::Arc;

use crate::config::ApiConfig;
use crate::mailer::Mailer;
use crate::session::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub ledger: VoteLedger,
    pub sessions: Arc<dyn SessionStore>,
    pub mailer: Arc<dyn Mailer>,
    pub config: Arc<ApiConfig>,
}

impl AppState {
    pub fn new(
        storage: Arc<dyn Storage>,
        sessions: Arc<dyn SessionStore>,
        mailer: Arc<dyn Mailer>,
        config: ApiConfig,
    ) -> Self {
        let ledger = VoteLedger::new(Arc::clone(&storage));
        Self {
            storage,
            ledger,
            sessions,
            mailer,
            config: Arc::new(config),
        }
    }
}
