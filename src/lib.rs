pub mod client;
pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::services::attempt_service::AttemptService;
use crate::services::content_service::ContentService;
use crate::store::postgres::{PgAttemptStore, PgContentStore};
use crate::store::{AttemptStore, ContentStore};

#[derive(Clone)]
pub struct AppState {
    pub attempt_service: AttemptService,
    pub content_service: ContentService,
}

impl AppState {
    pub fn new(pool: PgPool) -> Self {
        let config = crate::config::get_config();
        Self::with_stores(
            Arc::new(PgAttemptStore::new(pool.clone())),
            Arc::new(PgContentStore::new(pool)),
            Duration::from_secs(config.content_cache_ttl_secs),
        )
    }

    /// Wire the services over any store pair; tests run on the in-memory
    /// stores with no database behind them.
    pub fn with_stores(
        attempts: Arc<dyn AttemptStore>,
        content: Arc<dyn ContentStore>,
        cache_ttl: Duration,
    ) -> Self {
        let content_service = ContentService::new(content, cache_ttl);
        let attempt_service = AttemptService::new(attempts, content_service.clone());
        Self {
            attempt_service,
            content_service,
        }
    }
}
