//! Read-only stats snapshot, served through a [`TtlCache`].

use std::sync::Arc;
use std::time::Duration;

use dripcast_core::config::StatsConfig;

use crate::cache::TtlCache;
use crate::persistence::{Stats, StoreResult, TaskStore};

pub struct StatsReporter {
    store: Arc<TaskStore>,
    cache: TtlCache<Stats>,
}

impl StatsReporter {
    pub fn new(store: Arc<TaskStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: TtlCache::new(ttl),
        }
    }

    pub fn from_config(store: Arc<TaskStore>, config: &StatsConfig) -> Self {
        Self::new(store, Duration::from_secs(config.cache_ttl_secs))
    }

    /// Aggregate counts, at most `ttl` old.
    pub async fn snapshot(&self) -> StoreResult<Stats> {
        self.cache
            .get_or_refresh(|| async {
                tracing::debug!("📊 Refreshing stats snapshot");
                self.store.stats()
            })
            .await
    }

    /// Drop the cached snapshot so the next read hits the store.
    pub async fn invalidate(&self) {
        self.cache.invalidate().await;
    }
}
