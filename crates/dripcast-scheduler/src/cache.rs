//! Single-value cache with an explicit expiry.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

/// A value plus its expiry time, refreshed by one writer at a time.
///
/// The async mutex is held across the refresh, so concurrent readers that
/// find the entry stale wait for the in-flight refresh instead of starting
/// their own.
pub struct TtlCache<T> {
    ttl: Duration,
    entry: Mutex<Option<Entry<T>>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    /// Return the cached value, or run `refresh` and cache its result.
    ///
    /// A failed refresh leaves the previous entry (if any) untouched.
    pub async fn get_or_refresh<F, Fut, E>(&self, refresh: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut guard = self.entry.lock().await;
        if let Some(entry) = guard.as_ref()
            && entry.expires_at > Instant::now()
        {
            return Ok(entry.value.clone());
        }

        let value = refresh().await?;
        *guard = Some(Entry {
            value: value.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        Ok(value)
    }

    /// The cached value if it has not expired.
    pub async fn peek(&self) -> Option<T> {
        let guard = self.entry.lock().await;
        guard
            .as_ref()
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    pub async fn invalidate(&self) {
        *self.entry.lock().await = None;
    }
}
