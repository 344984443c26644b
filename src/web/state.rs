use std::sync::Arc;

use crate::config::AppConfig;
use crate::engine::Engine;
use crate::session::SessionStore;

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub engine: Arc<Engine>,
    pub sessions: SessionStore,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, engine: Engine) -> Self {
        let sessions = SessionStore::new(
            config.history.max_turns,
            config.sessions.max_sessions,
            config.sessions.idle_timeout(),
        );
        Self {
            config,
            engine: Arc::new(engine),
            sessions,
            startup_time: chrono::Utc::now(),
        }
    }
}
