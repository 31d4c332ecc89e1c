use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::dto::content_dto::TryoutView;
use crate::error::{Error, Result};
use crate::models::tryout::{Subtest, Tryout};
use crate::services::cache::TtlCache;
use crate::store::ContentStore;

/// Read side for tryout content. Every save and submit needs the subtest
/// list, so lookups go through a short TTL cache instead of hitting the
/// store each time. Only successful lookups are cached.
#[derive(Clone)]
pub struct ContentService {
    store: Arc<dyn ContentStore>,
    tryouts: Arc<TtlCache<Uuid, Tryout>>,
    subtests: Arc<TtlCache<Uuid, Vec<Subtest>>>,
}

impl ContentService {
    pub fn new(store: Arc<dyn ContentStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            tryouts: Arc::new(TtlCache::new(cache_ttl)),
            subtests: Arc::new(TtlCache::new(cache_ttl)),
        }
    }

    pub async fn tryout(&self, tryout_id: Uuid) -> Result<Tryout> {
        if let Some(hit) = self.tryouts.get(&tryout_id) {
            return Ok(hit);
        }
        let tryout = self
            .store
            .fetch_tryout(tryout_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Tryout {tryout_id} not found")))?;
        self.tryouts.insert(tryout_id, tryout.clone());
        Ok(tryout)
    }

    /// Subtests in position order, with full question banks (answer keys
    /// included). Never hand this to a client directly; use `public_view`.
    pub async fn subtests(&self, tryout_id: Uuid) -> Result<Vec<Subtest>> {
        if let Some(hit) = self.subtests.get(&tryout_id) {
            return Ok(hit);
        }
        let subtests = self.store.fetch_subtests(tryout_id).await?;
        if subtests.is_empty() {
            tracing::warn!("Tryout {} has no subtests configured", tryout_id);
        }
        self.subtests.insert(tryout_id, subtests.clone());
        Ok(subtests)
    }

    pub async fn public_view(&self, tryout_id: Uuid) -> Result<TryoutView> {
        let tryout = self.tryout(tryout_id).await?;
        let subtests = self.subtests(tryout_id).await?;
        Ok(TryoutView::build(&tryout, &subtests))
    }

    /// Drop entries whose TTL has lapsed. `get` already skips stale hits;
    /// this just keeps the maps from accumulating dead tryouts.
    pub fn purge_caches(&self) {
        self.tryouts.purge_expired();
        self.subtests.purge_expired();
    }
}
