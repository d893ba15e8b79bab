//! Application state shared across handlers.

use crate::auth::TokenValidator;
use crate::jobs::manager::JobManager;
use std::sync::Arc;
use volprov_core::AppConfig;

/// State handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub manager: Arc<JobManager>,
    pub tokens: Option<Arc<TokenValidator>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        manager: Arc<JobManager>,
        tokens: Option<TokenValidator>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            manager,
            tokens: tokens.map(Arc::new),
        }
    }
}
