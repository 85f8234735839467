//! The public substrate handle.
//!
//! [`Substrate`] is a cheap-to-clone handle onto one logical store. All
//! operations are async and return `Result` even on the in-process backend
//! so callers are written against the real failure contract: reads can be
//! retried with [`retrying`], write failures surface as `Unavailable`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tandem_core::{BackoffPolicy, Fault};

use crate::memory::{attach, Entry, MemoryStore, Ring};
use crate::pubsub::Subscription;

/// Substrate failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstrateError {
    /// The backend is unreachable or the URL names no known backend.
    Unavailable(String),
}

impl std::fmt::Display for SubstrateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(reason) => write!(f, "substrate unavailable: {reason}"),
        }
    }
}

impl std::error::Error for SubstrateError {}

impl From<SubstrateError> for Fault {
    fn from(e: SubstrateError) -> Self {
        Fault::unavailable(e.to_string())
    }
}

/// Aggregate counts for health output.
#[derive(Debug, Clone, Default)]
pub struct SubstrateStats {
    pub kv_keys: usize,
    pub hash_keys: usize,
    pub set_keys: usize,
    pub counter_keys: usize,
    pub active_channels: usize,
}

/// Handle onto one logical store. Clone freely; clones share the backend.
#[derive(Clone, Debug)]
pub struct Substrate {
    store: Arc<MemoryStore>,
    url: String,
}

impl Substrate {
    /// Connect to the substrate named by `url`.
    ///
    /// `mem://<name>` attaches to a named process-wide store; any other
    /// scheme is `Unavailable` (startup maps that to exit code 2).
    pub fn connect(url: &str) -> Result<Self, SubstrateError> {
        match url.split_once("://") {
            Some(("mem", name)) if !name.is_empty() => Ok(Self {
                store: attach(name),
                url: url.to_string(),
            }),
            _ => Err(SubstrateError::Unavailable(format!(
                "no backend for url {url:?}"
            ))),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    // ------------------------------------------------------------------
    // KV
    // ------------------------------------------------------------------

    pub async fn get(&self, key: &str) -> Result<Option<String>, SubstrateError> {
        let tables = self.store.tables.read().await;
        Ok(tables
            .kv
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), SubstrateError> {
        self.set_opt(key, value, None).await
    }

    pub async fn set_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), SubstrateError> {
        self.set_opt(key, value, Some(ttl)).await
    }

    async fn set_opt(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), SubstrateError> {
        let mut tables = self.store.tables.write().await;
        tables
            .kv
            .insert(key.to_string(), Entry::new(value.to_string(), ttl));
        Ok(())
    }

    /// Set only if the key is absent (or expired). The lease primitive.
    pub async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, SubstrateError> {
        let mut tables = self.store.tables.write().await;
        if tables.kv.get(key).is_some_and(|e| e.live()) {
            return Ok(false);
        }
        tables
            .kv
            .insert(key.to_string(), Entry::new(value.to_string(), ttl));
        Ok(true)
    }

    /// Delete a key from every keyspace. Returns whether anything existed.
    pub async fn del(&self, key: &str) -> Result<bool, SubstrateError> {
        let mut tables = self.store.tables.write().await;
        let mut existed = tables.kv.remove(key).is_some_and(|e| e.live());
        existed |= tables.hashes.remove(key).is_some_and(|e| e.live());
        existed |= tables.sets.remove(key).is_some_and(|e| e.live());
        existed |= tables.counters.remove(key).is_some_and(|e| e.live());
        existed |= tables.rings.remove(key).is_some();
        Ok(existed)
    }

    /// Delete a KV entry only if it still holds `expected`.
    ///
    /// Guarded release: a holder that lost its lease cannot clobber the
    /// next holder's value.
    pub async fn del_if(&self, key: &str, expected: &str) -> Result<bool, SubstrateError> {
        let mut tables = self.store.tables.write().await;
        let matches = tables
            .kv
            .get(key)
            .is_some_and(|e| e.live() && e.value == expected);
        if matches {
            tables.kv.remove(key);
        }
        Ok(matches)
    }

    pub async fn exists(&self, key: &str) -> Result<bool, SubstrateError> {
        let tables = self.store.tables.read().await;
        Ok(tables.kv.get(key).is_some_and(|e| e.live())
            || tables.hashes.get(key).is_some_and(|e| e.live())
            || tables.sets.get(key).is_some_and(|e| e.live())
            || tables.counters.get(key).is_some_and(|e| e.live()))
    }

    /// Refresh the TTL of a live key in any keyspace.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, SubstrateError> {
        let mut tables = self.store.tables.write().await;
        let deadline = Some(Instant::now() + ttl);
        let mut touched = false;
        if let Some(e) = tables.kv.get_mut(key).filter(|e| e.live()) {
            e.expires_at = deadline;
            touched = true;
        }
        if let Some(e) = tables.hashes.get_mut(key).filter(|e| e.live()) {
            e.expires_at = deadline;
            touched = true;
        }
        if let Some(e) = tables.sets.get_mut(key).filter(|e| e.live()) {
            e.expires_at = deadline;
            touched = true;
        }
        if let Some(e) = tables.counters.get_mut(key).filter(|e| e.live()) {
            e.expires_at = deadline;
            touched = true;
        }
        Ok(touched)
    }

    /// Extend the TTL of a KV entry only while it still holds `expected`.
    /// The lease renewal primitive.
    pub async fn expire_if(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, SubstrateError> {
        let mut tables = self.store.tables.write().await;
        match tables.kv.get_mut(key) {
            Some(e) if e.live() && e.value == expected => {
                e.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remaining TTL of a live key, `None` when absent or unbounded.
    pub async fn ttl_of(&self, key: &str) -> Result<Option<Duration>, SubstrateError> {
        let tables = self.store.tables.read().await;
        let kv_deadline = tables
            .kv
            .get(key)
            .filter(|e| e.live())
            .and_then(|e| e.expires_at);
        // Counters answer too, for rate-limit retry_after.
        let counter_deadline = tables
            .counters
            .get(key)
            .filter(|e| e.live())
            .and_then(|e| e.expires_at);
        Ok(kv_deadline
            .or(counter_deadline)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    // ------------------------------------------------------------------
    // Hash
    // ------------------------------------------------------------------

    pub async fn hset(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> Result<(), SubstrateError> {
        let mut tables = self.store.tables.write().await;
        let entry = tables.hashes.entry(key.to_string()).or_insert_with(|| {
            Entry::new(HashMap::new(), None)
        });
        if !entry.live() {
            entry.value.clear();
            entry.expires_at = None;
        }
        for (field, value) in fields {
            entry.value.insert((*field).to_string(), value.clone());
        }
        if let Some(ttl) = ttl {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, SubstrateError> {
        let tables = self.store.tables.read().await;
        Ok(tables
            .hashes
            .get(key)
            .filter(|e| e.live())
            .and_then(|e| e.value.get(field).cloned()))
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, SubstrateError> {
        let tables = self.store.tables.read().await;
        Ok(tables
            .hashes
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.clone())
            .unwrap_or_default())
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<bool, SubstrateError> {
        let mut tables = self.store.tables.write().await;
        Ok(tables
            .hashes
            .get_mut(key)
            .filter(|e| e.live())
            .is_some_and(|e| e.value.remove(field).is_some()))
    }

    // ------------------------------------------------------------------
    // Set
    // ------------------------------------------------------------------

    pub async fn sadd(&self, key: &str, member: &str) -> Result<bool, SubstrateError> {
        let mut tables = self.store.tables.write().await;
        let entry = tables
            .sets
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Default::default(), None));
        if !entry.live() {
            entry.value.clear();
            entry.expires_at = None;
        }
        Ok(entry.value.insert(member.to_string()))
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<bool, SubstrateError> {
        let mut tables = self.store.tables.write().await;
        let removed = tables
            .sets
            .get_mut(key)
            .filter(|e| e.live())
            .is_some_and(|e| e.value.remove(member));
        // Empty sets carry no information; drop them.
        if tables.sets.get(key).is_some_and(|e| e.value.is_empty()) {
            tables.sets.remove(key);
        }
        Ok(removed)
    }

    /// Members in sorted order so callers observe deterministic listings.
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, SubstrateError> {
        let tables = self.store.tables.read().await;
        let mut members: Vec<String> = tables
            .sets
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    pub async fn scard(&self, key: &str) -> Result<usize, SubstrateError> {
        let tables = self.store.tables.read().await;
        Ok(tables
            .sets
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.len())
            .unwrap_or(0))
    }

    // ------------------------------------------------------------------
    // Counter
    // ------------------------------------------------------------------

    /// Atomic increment. The first increment of a (fresh or expired) key
    /// arms the window TTL, so a burst shares one window.
    pub async fn incr(&self, key: &str, window: Duration) -> Result<i64, SubstrateError> {
        let mut tables = self.store.tables.write().await;
        let entry = tables.counters.entry(key.to_string()).or_insert_with(|| {
            Entry::new(0, Some(window))
        });
        if !entry.live() {
            *entry = Entry::new(0, Some(window));
        }
        entry.value += 1;
        Ok(entry.value)
    }

    // ------------------------------------------------------------------
    // Frame ring
    // ------------------------------------------------------------------

    /// Append a sequenced payload to a bounded ring, evicting the oldest.
    pub async fn ring_push(
        &self,
        key: &str,
        seq: u64,
        payload: Arc<Vec<u8>>,
        cap: usize,
    ) -> Result<(), SubstrateError> {
        if cap == 0 {
            return Ok(());
        }
        let mut tables = self.store.tables.write().await;
        let ring = tables.rings.entry(key.to_string()).or_insert_with(Ring::default);
        ring.entries.push_back((seq, payload));
        while ring.entries.len() > cap {
            ring.entries.pop_front();
        }
        Ok(())
    }

    /// All buffered payloads with `seq >= from_seq`, oldest first.
    pub async fn ring_range(
        &self,
        key: &str,
        from_seq: u64,
    ) -> Result<Vec<(u64, Arc<Vec<u8>>)>, SubstrateError> {
        let tables = self.store.tables.read().await;
        Ok(tables
            .rings
            .get(key)
            .map(|ring| {
                ring.entries
                    .iter()
                    .filter(|(seq, _)| *seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    // ------------------------------------------------------------------
    // Pub/Sub
    // ------------------------------------------------------------------

    /// Publish to a channel; returns how many subscribers received it.
    pub async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize, SubstrateError> {
        Ok(self.store.channels.publish(channel, Arc::new(payload)).await)
    }

    pub async fn subscribe(&self, channel: &str) -> Result<Subscription, SubstrateError> {
        Ok(self.store.channels.subscribe(channel).await)
    }

    // ------------------------------------------------------------------
    // Batches, scans, stats
    // ------------------------------------------------------------------

    /// Apply a batch under one write guard; no interleaving is observable.
    pub async fn exec(&self, batch: Batch) -> Result<(), SubstrateError> {
        let mut tables = self.store.tables.write().await;
        for op in batch.ops {
            match op {
                BatchOp::Set { key, value, ttl } => {
                    tables.kv.insert(key, Entry::new(value, ttl));
                }
                BatchOp::Del { key } => {
                    tables.kv.remove(&key);
                    tables.hashes.remove(&key);
                    tables.sets.remove(&key);
                    tables.counters.remove(&key);
                    tables.rings.remove(&key);
                }
                BatchOp::HSet { key, fields, ttl } => {
                    let entry = tables
                        .hashes
                        .entry(key)
                        .or_insert_with(|| Entry::new(HashMap::new(), None));
                    if !entry.live() {
                        entry.value.clear();
                        entry.expires_at = None;
                    }
                    for (field, value) in fields {
                        entry.value.insert(field, value);
                    }
                    if let Some(ttl) = ttl {
                        entry.expires_at = Some(Instant::now() + ttl);
                    }
                }
                BatchOp::HDel { key, field } => {
                    if let Some(e) = tables.hashes.get_mut(&key) {
                        e.value.remove(&field);
                    }
                }
                BatchOp::SAdd { key, member } => {
                    let entry = tables
                        .sets
                        .entry(key)
                        .or_insert_with(|| Entry::new(Default::default(), None));
                    if !entry.live() {
                        entry.value.clear();
                        entry.expires_at = None;
                    }
                    entry.value.insert(member);
                }
                BatchOp::SRem { key, member } => {
                    let emptied = match tables.sets.get_mut(&key) {
                        Some(e) => {
                            e.value.remove(&member);
                            e.value.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        tables.sets.remove(&key);
                    }
                }
            }
        }
        tables.sweep();
        Ok(())
    }

    /// Live keys (any keyspace) starting with `prefix`, sorted.
    pub async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, SubstrateError> {
        let tables = self.store.tables.read().await;
        let mut keys: Vec<String> = tables
            .kv
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.live())
            .map(|(k, _)| k.clone())
            .chain(
                tables
                    .hashes
                    .iter()
                    .filter(|(k, e)| k.starts_with(prefix) && e.live())
                    .map(|(k, _)| k.clone()),
            )
            .chain(
                tables
                    .sets
                    .iter()
                    .filter(|(k, e)| k.starts_with(prefix) && e.live())
                    .map(|(k, _)| k.clone()),
            )
            .chain(
                tables
                    .counters
                    .iter()
                    .filter(|(k, e)| k.starts_with(prefix) && e.live())
                    .map(|(k, _)| k.clone()),
            )
            .chain(
                tables
                    .rings
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned(),
            )
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    pub async fn stats(&self) -> SubstrateStats {
        let tables = self.store.tables.read().await;
        SubstrateStats {
            kv_keys: tables.kv.values().filter(|e| e.live()).count(),
            hash_keys: tables.hashes.values().filter(|e| e.live()).count(),
            set_keys: tables.sets.values().filter(|e| e.live()).count(),
            counter_keys: tables.counters.values().filter(|e| e.live()).count(),
            active_channels: self.store.channels.active_channels().await,
        }
    }
}

/// One batched mutation.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    HSet {
        key: String,
        fields: Vec<(String, String)>,
        ttl: Option<Duration>,
    },
    HDel {
        key: String,
        field: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
}

/// A multi-op mutation applied atomically by [`Substrate::exec`].
#[derive(Debug, Clone, Default)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value: value.into(),
            ttl: None,
        });
        self
    }

    pub fn set_ttl(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value: value.into(),
            ttl: Some(ttl),
        });
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Del { key: key.into() });
        self
    }

    pub fn hset(
        mut self,
        key: impl Into<String>,
        fields: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> Self {
        self.ops.push(BatchOp::HSet {
            key: key.into(),
            fields,
            ttl,
        });
        self
    }

    pub fn hdel(mut self, key: impl Into<String>, field: impl Into<String>) -> Self {
        self.ops.push(BatchOp::HDel {
            key: key.into(),
            field: field.into(),
        });
        self
    }

    pub fn sadd(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn srem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Retry an idempotent read with bounded exponential backoff.
///
/// Writes must NOT be wrapped here; their failures propagate.
pub async fn retrying<T, F, Fut>(mut op: F) -> Result<T, SubstrateError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, SubstrateError>>,
{
    let policy = BackoffPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(400),
        jitter: true,
    };
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if policy.should_retry(attempt) => {
                log::debug!("substrate read failed (attempt {attempt}): {e}; retrying");
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(name: &str) -> Substrate {
        Substrate::connect(&format!("mem://{name}")).unwrap()
    }

    #[test]
    fn test_connect_unknown_scheme_unavailable() {
        let err = Substrate::connect("redis://localhost:6379").unwrap_err();
        assert!(matches!(err, SubstrateError::Unavailable(_)));
        assert!(Substrate::connect("mem://").is_err());
    }

    #[tokio::test]
    async fn test_kv_roundtrip_and_delete() {
        let sub = fresh("store-kv");
        sub.set("k", "v").await.unwrap();
        assert_eq!(sub.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(sub.del("k").await.unwrap());
        assert!(!sub.del("k").await.unwrap());
        assert_eq!(sub.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_kv_ttl_expires() {
        let sub = fresh("store-ttl");
        sub.set_ttl("k", "v", Duration::from_millis(20)).await.unwrap();
        assert!(sub.exists("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!sub.exists("k").await.unwrap());
        assert_eq!(sub.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_nx_respects_live_holder() {
        let sub = fresh("store-nx");
        assert!(sub
            .set_nx("lease", "a", Some(Duration::from_millis(30)))
            .await
            .unwrap());
        assert!(!sub.set_nx("lease", "b", None).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Expired holder no longer blocks acquisition.
        assert!(sub.set_nx("lease", "b", None).await.unwrap());
        assert_eq!(sub.get("lease").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_del_if_and_expire_if_are_guarded() {
        let sub = fresh("store-guard");
        sub.set("lease", "token-a").await.unwrap();
        assert!(!sub.del_if("lease", "token-b").await.unwrap());
        assert!(sub
            .expire_if("lease", "token-a", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!sub
            .expire_if("lease", "token-b", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(sub.del_if("lease", "token-a").await.unwrap());
        assert_eq!(sub.get("lease").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_hash_fields() {
        let sub = fresh("store-hash");
        sub.hset("h", &[("a", "1".into()), ("b", "2".into())], None)
            .await
            .unwrap();
        assert_eq!(sub.hget("h", "a").await.unwrap().as_deref(), Some("1"));
        let all = sub.hgetall("h").await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(sub.hdel("h", "a").await.unwrap());
        assert!(!sub.hdel("h", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_membership_sorted() {
        let sub = fresh("store-set");
        assert!(sub.sadd("s", "b").await.unwrap());
        assert!(sub.sadd("s", "a").await.unwrap());
        assert!(!sub.sadd("s", "a").await.unwrap());
        assert_eq!(sub.smembers("s").await.unwrap(), vec!["a", "b"]);
        assert_eq!(sub.scard("s").await.unwrap(), 2);
        sub.srem("s", "a").await.unwrap();
        sub.srem("s", "b").await.unwrap();
        // Emptied sets disappear entirely.
        assert!(!sub.exists("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_counter_window() {
        let sub = fresh("store-ctr");
        assert_eq!(sub.incr("c", Duration::from_millis(40)).await.unwrap(), 1);
        assert_eq!(sub.incr("c", Duration::from_millis(40)).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(60)).await;
        // New window restarts the count.
        assert_eq!(sub.incr("c", Duration::from_millis(40)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ring_bounded_and_range() {
        let sub = fresh("store-ring");
        for seq in 0u64..6 {
            sub.ring_push("r", seq, Arc::new(vec![seq as u8]), 4)
                .await
                .unwrap();
        }
        let all = sub.ring_range("r", 0).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all.first().unwrap().0, 2);
        let tail = sub.ring_range("r", 4).await.unwrap();
        assert_eq!(tail.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_batch_is_atomic_under_concurrent_reads() {
        let sub = fresh("store-batch");
        let batch = Batch::new()
            .hset(
                "signaling:clients:c1".to_string(),
                vec![("room".into(), "r1".into())],
                None,
            )
            .sadd("signaling:rooms:r1:members", "c1")
            .sadd("signaling:rooms", "r1");
        sub.exec(batch).await.unwrap();

        assert_eq!(
            sub.hget("signaling:clients:c1", "room").await.unwrap().as_deref(),
            Some("r1")
        );
        assert_eq!(sub.smembers("signaling:rooms").await.unwrap(), vec!["r1"]);
        assert_eq!(sub.scard("signaling:rooms:r1:members").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scan_prefix_spans_keyspaces() {
        let sub = fresh("store-scan");
        sub.set("sim:config:s1", "{}").await.unwrap();
        sub.hset("sim:state:s1", &[("frame", "0".into())], None)
            .await
            .unwrap();
        sub.sadd("sim:index", "s1").await.unwrap();
        let keys = sub.scan_prefix("sim:").await.unwrap();
        assert_eq!(keys, vec!["sim:config:s1", "sim:index", "sim:state:s1"]);
    }

    #[tokio::test]
    async fn test_retrying_eventually_succeeds() {
        let mut failures = 2;
        let result = retrying(|| {
            let fail = failures > 0;
            if fail {
                failures -= 1;
            }
            async move {
                if fail {
                    Err(SubstrateError::Unavailable("transient".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }
}
