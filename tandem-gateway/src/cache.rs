//! Short-TTL response cache for read-heavy GETs.
//!
//! Keys are hashed over `(route, query, subject)` so one subject's cached
//! view never leaks to another, and no key embeds user data.

use std::time::Duration;

use tandem_substrate::Substrate;

use crate::auth::cache_identifier;

/// Hard ceiling on response cache TTLs.
const MAX_TTL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ResponseCache {
    substrate: Substrate,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(substrate: Substrate, ttl: Duration) -> Self {
        Self {
            substrate,
            ttl: ttl.min(MAX_TTL),
        }
    }

    fn key(route: &str, query: &str, subject: &str) -> String {
        format!(
            "cache:{route}:{}",
            cache_identifier(&[route, query, subject])
        )
    }

    pub async fn get(&self, route: &str, query: &str, subject: &str) -> Option<String> {
        self.substrate
            .get(&Self::key(route, query, subject))
            .await
            .ok()
            .flatten()
    }

    pub async fn put(&self, route: &str, query: &str, subject: &str, body: &str) {
        let _ = self
            .substrate
            .set_ttl(&Self::key(route, query, subject), body, self.ttl)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(store: &str, ttl: Duration) -> ResponseCache {
        ResponseCache::new(Substrate::connect(&format!("mem://{store}")).unwrap(), ttl)
    }

    #[tokio::test]
    async fn test_roundtrip_and_subject_scoping() {
        let cache = cache("cache-scope", Duration::from_secs(5));
        cache.put("/v1/x", "a=1", "u1", "{\"ok\":true}").await;

        assert_eq!(
            cache.get("/v1/x", "a=1", "u1").await.as_deref(),
            Some("{\"ok\":true}")
        );
        assert!(cache.get("/v1/x", "a=1", "u2").await.is_none());
        assert!(cache.get("/v1/x", "a=2", "u1").await.is_none());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = cache("cache-ttl", Duration::from_millis(30));
        cache.put("/v1/x", "", "u1", "stale").await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get("/v1/x", "", "u1").await.is_none());
    }

    #[test]
    fn test_ttl_is_capped() {
        let substrate = Substrate::connect("mem://cache-cap").unwrap();
        let cache = ResponseCache::new(substrate, Duration::from_secs(3600));
        assert_eq!(cache.ttl, MAX_TTL);
    }
}
