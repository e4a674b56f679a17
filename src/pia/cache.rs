use std::{
    future::Future,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

/// How long a token handed out by the PIA token endpoint is reused
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Holds at most one PIA API token together with its expiry.
///
/// The cache is owned by whoever builds the client and shared through an `Arc`,
/// so several clients created from the same config reuse one token.
#[derive(Debug)]
pub struct TokenCache {
    ttl: Duration,
    entry: Mutex<Option<CachedToken>>,
}

#[derive(Debug)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl TokenCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    /// Returns the cached token, or stores and returns the one produced by `fetch`
    /// when the cache is empty or expired.
    ///
    /// The lock is held while `fetch` runs, so concurrent callers on a cold cache
    /// wait for a single exchange. A failed fetch leaves the cache empty.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, fetch: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        let mut entry = self.entry.lock().await;
        if let Some(cached) = entry.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.token.clone());
            }
        }

        *entry = None;
        let token = fetch().await?;
        *entry = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        Ok(token)
    }

    /// Forgets the cached token, e.g. after the API rejected it
    pub async fn clear(&self) {
        self.entry.lock().await.take();
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TTL)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Hands out `token-<n>` and counts how often it was called
    struct Issuer(AtomicUsize);

    impl Issuer {
        fn new() -> Self {
            Self(AtomicUsize::new(0))
        }

        async fn issue(&self) -> Result<String, ()> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("token-{n}"))
        }

        fn calls(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn reuses_token_within_ttl() {
        let cache = TokenCache::default();
        let issuer = Issuer::new();
        assert_eq!(cache.get_or_try_insert_with(|| issuer.issue()).await, Ok("token-1".into()));
        assert_eq!(cache.get_or_try_insert_with(|| issuer.issue()).await, Ok("token-1".into()));
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test]
    async fn expires_after_ttl() {
        let cache = TokenCache::new(Duration::from_millis(20));
        let issuer = Issuer::new();
        cache.get_or_try_insert_with(|| issuer.issue()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get_or_try_insert_with(|| issuer.issue()).await, Ok("token-2".into()));
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache = TokenCache::default();
        let failed: Result<String, &str> = cache.get_or_try_insert_with(|| async { Err("401") }).await;
        assert_eq!(failed, Err("401"));

        let issuer = Issuer::new();
        assert_eq!(cache.get_or_try_insert_with(|| issuer.issue()).await, Ok("token-1".into()));
    }

    #[tokio::test]
    async fn concurrent_cold_lookups_fetch_once() {
        let cache = TokenCache::default();
        let issuer = &Issuer::new();
        let slow_issue = move || async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            issuer.issue().await
        };

        let (first, second) = tokio::join!(
            cache.get_or_try_insert_with(slow_issue),
            cache.get_or_try_insert_with(slow_issue),
        );
        assert_eq!(first, Ok("token-1".into()));
        assert_eq!(second, Ok("token-1".into()));
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test]
    async fn clear_forces_a_new_fetch() {
        let cache = TokenCache::default();
        let issuer = Issuer::new();
        cache.get_or_try_insert_with(|| issuer.issue()).await.unwrap();
        cache.clear().await;
        assert_eq!(cache.get_or_try_insert_with(|| issuer.issue()).await, Ok("token-2".into()));
    }
}
