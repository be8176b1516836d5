//! Bounded, time-limited cache of bearer token verification results.
//!
//! Entries carry their own TTL (derived by the gateway from the verifier's
//! expiry) and the cache is capacity-bounded with LRU eviction. A background
//! sweeper runs moka's pending maintenance so expired entries are reclaimed
//! even when no requests arrive.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::policy::EvictionPolicy;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::verifier::VerificationResult;

pub const DEFAULT_CAPACITY: u64 = 100_000;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct CachedVerification {
    result: VerificationResult,
    ttl: Duration,
}

struct VerificationExpiry;

impl moka::Expiry<String, CachedVerification> for VerificationExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedVerification,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    // A re-set token takes the TTL of its new result.
    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedVerification,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Concurrent map from token to its last verification result.
///
/// `TokenCache` is cheap to share behind an `Arc`; all methods take `&self`.
pub struct TokenCache {
    entries: Cache<String, CachedVerification>,
    cancel_token: CancellationToken,
    /// Wrapped in `Mutex` so `shutdown()` can take ownership via `&self`.
    sweeper_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl TokenCache {
    pub fn new(max_capacity: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(VerificationExpiry)
            .build();
        Self {
            entries,
            cancel_token: CancellationToken::new(),
            sweeper_handle: Mutex::new(None),
        }
    }

    /// Returns the cached result, or `None` when absent or past its TTL.
    pub async fn get(&self, token: &str) -> Option<VerificationResult> {
        self.entries.get(token).await.map(|cached| cached.result)
    }

    /// Caches `result` for `ttl`. A zero TTL is not stored.
    pub async fn set(&self, token: &str, result: VerificationResult, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        self.entries
            .insert(token.to_owned(), CachedVerification { result, ttl })
            .await;
    }

    pub async fn delete(&self, token: &str) {
        self.entries.invalidate(token).await;
    }

    /// Approximate number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Runs pending evictions now.
    pub async fn sweep(&self) {
        self.entries.run_pending_tasks().await;
    }

    /// Spawns the periodic sweeper. Calling it again replaces nothing; the
    /// first sweeper keeps running until [`shutdown`](Self::shutdown).
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let mut slot = self.sweeper_handle.lock();
        if slot.is_some() {
            return;
        }

        let cache = Arc::clone(self);
        let token = self.cancel_token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; consume it so we start
            // with a full interval wait.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("token cache sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        cache.sweep().await;
                        tracing::trace!(entries = cache.entry_count(), "token cache swept");
                    }
                }
            }
        });
        *slot = Some(handle);
    }

    /// Stops the sweeper, if running, and drops every cached entry.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.sweeper_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "token cache sweeper panicked");
            }
        }
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    fn valid_for(user: &str, lifetime: Duration) -> VerificationResult {
        VerificationResult {
            token: format!("token-{user}"),
            valid: true,
            user_id: user.to_string(),
            expires_at: SystemTime::now() + lifetime,
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trip() {
        let cache = TokenCache::new(100);
        let result = valid_for("alice", Duration::from_secs(60));
        cache.set("abc", result.clone(), Duration::from_secs(60)).await;

        assert_eq!(cache.get("abc").await, Some(result));
        assert_eq!(cache.get("other").await, None);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = TokenCache::new(100);
        cache
            .set("short", valid_for("bob", Duration::from_millis(50)), Duration::from_millis(50))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.get("short").await, None);
    }

    #[tokio::test]
    async fn delete_and_zero_ttl() {
        let cache = TokenCache::new(100);
        cache.set("gone", valid_for("carol", Duration::from_secs(60)), Duration::from_secs(60)).await;
        cache.delete("gone").await;
        assert_eq!(cache.get("gone").await, None);

        cache.set("never", valid_for("dave", Duration::ZERO), Duration::ZERO).await;
        assert_eq!(cache.get("never").await, None);
    }

    #[tokio::test]
    async fn sweeper_reclaims_expired_entries_and_stops() {
        let cache = Arc::new(TokenCache::new(100));
        cache.start_sweeper(Duration::from_millis(20));
        cache
            .set("t", valid_for("erin", Duration::from_millis(30)), Duration::from_millis(30))
            .await;
        cache.sweep().await;
        assert_eq!(cache.entry_count(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.entry_count(), 0);

        cache.shutdown().await;
        assert!(cache.sweeper_handle.lock().is_none());
    }
}
