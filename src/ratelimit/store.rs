//! Quota store: the collection of per-(endpoint, client) limiters.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, trace};

use super::bucket::TokenBucket;
use super::key::{EndpointKey, LimiterKey};
use super::policy::{PolicyTable, RatePolicy};

/// Shared handle to a single limiter entry.
pub type LimiterHandle = Arc<LimiterEntry>;

/// One token bucket plus its liveness bookkeeping.
pub struct LimiterEntry {
    state: Mutex<EntryState>,
}

struct EntryState {
    bucket: TokenBucket,
    last_access: Instant,
}

impl LimiterEntry {
    fn new(policy: &RatePolicy, now: Instant) -> Self {
        Self {
            state: Mutex::new(EntryState {
                bucket: TokenBucket::new(policy.refill_per_second(), policy.burst_size, now),
                last_access: now,
            }),
        }
    }

    /// Take one token at `now`. Atomic with respect to other callers of the same entry.
    pub fn try_acquire(&self, now: Instant) -> bool {
        self.state.lock().bucket.try_consume(now)
    }

    /// Tokens available at `now`.
    pub fn available_tokens(&self, now: Instant) -> f64 {
        self.state.lock().bucket.available(now)
    }

    pub fn last_access(&self) -> Instant {
        self.state.lock().last_access
    }

    fn touch(&self, now: Instant) {
        let mut state = self.state.lock();
        if now > state.last_access {
            state.last_access = now;
        }
    }
}

/// Owns every limiter entry and the policy table they are built from.
///
/// Structural changes (insert on first use, removal by [`QuotaStore::sweep`])
/// are serialized by one lock over the whole map; bucket updates are guarded
/// per entry.
pub struct QuotaStore {
    policies: PolicyTable,
    entries: RwLock<HashMap<LimiterKey, LimiterHandle>>,
}

impl QuotaStore {
    pub fn new(policies: PolicyTable) -> Self {
        Self {
            policies,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The policy in force for `endpoint`.
    pub fn policy(&self, endpoint: &EndpointKey) -> &RatePolicy {
        self.policies.resolve(endpoint)
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Return the limiter for `key`, creating a full one on first use.
    ///
    /// The entry's last-access time is bumped to `now` either way. Concurrent
    /// first requests for the same key all observe the same entry.
    pub fn resolve(&self, key: &LimiterKey, now: Instant) -> LimiterHandle {
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(key) {
                entry.touch(now);
                return Arc::clone(entry);
            }
        }

        let mut entries = self.entries.write();
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            let policy = self.policies.resolve(&key.endpoint);
            debug!(
                key = %key,
                requests_per_minute = policy.requests_per_minute,
                burst_size = policy.burst_size,
                "Creating new limiter entry"
            );
            Arc::new(LimiterEntry::new(policy, now))
        });
        entry.touch(now);
        Arc::clone(entry)
    }

    /// Remove every entry idle for longer than its endpoint's TTL.
    ///
    /// Returns the number of entries evicted. An entry whose check panics is
    /// kept and the sweep moves on to the rest.
    pub fn sweep(&self, now: Instant) -> usize {
        self.sweep_where(|key, entry| self.is_idle(key, entry, now))
    }

    fn is_idle(&self, key: &LimiterKey, entry: &LimiterEntry, now: Instant) -> bool {
        let ttl = self.policies.resolve(&key.endpoint).ttl();
        now.saturating_duration_since(entry.last_access()) > ttl
    }

    /// Evict every entry for which `is_idle` holds, isolating panics per entry.
    fn sweep_where<F>(&self, is_idle: F) -> usize
    where
        F: Fn(&LimiterKey, &LimiterEntry) -> bool,
    {
        let mut entries = self.entries.write();
        let before = entries.len();

        entries.retain(|key, entry| {
            match panic::catch_unwind(AssertUnwindSafe(|| is_idle(key, &**entry))) {
                Ok(true) => {
                    trace!(key = %key, "Evicting idle limiter entry");
                    false
                }
                Ok(false) => true,
                Err(_) => {
                    error!(key = %key, "Panic while sweeping limiter entry, keeping it");
                    true
                }
            }
        });

        before - entries.len()
    }

    /// Look up an entry without creating it or touching its timestamp.
    pub fn get(&self, key: &LimiterKey) -> Option<LimiterHandle> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &LimiterKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Get the number of live entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::key::ClientKey;
    use std::time::Duration;

    fn key(endpoint: &str, client: &str) -> LimiterKey {
        LimiterKey::new(EndpointKey::from_raw(endpoint), ClientKey::new(client))
    }

    #[test]
    fn test_resolve_creates_once() {
        let store = QuotaStore::new(PolicyTable::default());
        let now = Instant::now();
        let k = key("GET:/a", "10.0.0.1");

        let first = store.resolve(&k, now);
        let second = store.resolve(&k, now);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_new_entry_uses_endpoint_policy() {
        let table = PolicyTable::new(RatePolicy::new(60, 5, 5))
            .with_endpoint("GET:/big", RatePolicy::new(60, 20, 5));
        let store = QuotaStore::new(table);
        let now = Instant::now();

        let big = store.resolve(&key("GET:/big", "c"), now);
        let other = store.resolve(&key("GET:/small", "c"), now);

        assert_eq!(big.available_tokens(now), 20.0);
        assert_eq!(other.available_tokens(now), 5.0);
    }

    #[test]
    fn test_resolve_touches_last_access() {
        let store = QuotaStore::new(PolicyTable::default());
        let start = Instant::now();
        let k = key("GET:/a", "c");

        store.resolve(&k, start);
        let later = start + Duration::from_secs(30);
        store.resolve(&k, later);

        assert_eq!(store.get(&k).unwrap().last_access(), later);
    }

    #[test]
    fn test_last_access_never_moves_backwards() {
        let store = QuotaStore::new(PolicyTable::default());
        let start = Instant::now();
        let later = start + Duration::from_secs(30);
        let k = key("GET:/a", "c");

        store.resolve(&k, later);
        store.resolve(&k, start);

        assert_eq!(store.get(&k).unwrap().last_access(), later);
    }

    #[test]
    fn test_sweep_evicts_only_idle_entries() {
        let table = PolicyTable::new(RatePolicy::new(100, 50, 5))
            .with_endpoint("GET:/long", RatePolicy::new(100, 50, 30));
        let store = QuotaStore::new(table);
        let start = Instant::now();

        store.resolve(&key("GET:/short", "idle"), start);
        store.resolve(&key("GET:/long", "idle"), start);
        store.resolve(&key("GET:/short", "busy"), start + Duration::from_secs(4 * 60));

        let evicted = store.sweep(start + Duration::from_secs(6 * 60));

        assert_eq!(evicted, 1);
        assert!(!store.contains(&key("GET:/short", "idle")));
        assert!(store.contains(&key("GET:/long", "idle")));
        assert!(store.contains(&key("GET:/short", "busy")));
    }

    #[test]
    fn test_sweep_at_exact_ttl_keeps_entry() {
        let store = QuotaStore::new(PolicyTable::new(RatePolicy::new(100, 50, 5)));
        let start = Instant::now();
        store.resolve(&key("GET:/a", "c"), start);

        assert_eq!(store.sweep(start + Duration::from_secs(5 * 60)), 0);
        assert_eq!(store.sweep(start + Duration::from_secs(5 * 60 + 1)), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_recreated_entry_starts_full() {
        let store = QuotaStore::new(PolicyTable::new(RatePolicy::new(0, 2, 1)));
        let start = Instant::now();
        let k = key("GET:/a", "c");

        let entry = store.resolve(&k, start);
        assert!(entry.try_acquire(start));
        assert!(entry.try_acquire(start));
        assert!(!entry.try_acquire(start));

        let later = start + Duration::from_secs(120);
        assert_eq!(store.sweep(later), 1);

        let fresh = store.resolve(&k, later);
        assert!(!Arc::ptr_eq(&entry, &fresh));
        assert_eq!(fresh.available_tokens(later), 2.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_access_creates_one_entry() {
        let store = Arc::new(QuotaStore::new(PolicyTable::default()));
        let now = Instant::now();
        let k = key("GET:/race", "10.0.0.1");

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let store = Arc::clone(&store);
                let k = k.clone();
                tokio::spawn(async move { store.resolve(&k, now) })
            })
            .collect();

        let handles: Vec<LimiterHandle> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(store.len(), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    }

    #[test]
    fn test_sweep_survives_a_panicking_entry() {
        let store = QuotaStore::new(PolicyTable::new(RatePolicy::new(100, 50, 1)));
        let start = Instant::now();
        for client in ["a", "b", "c"] {
            store.resolve(&key("GET:/x", client), start);
        }

        let later = start + Duration::from_secs(120);
        let evicted = store.sweep_where(|k, entry| {
            if k.client.as_str() == "b" {
                panic!("broken entry");
            }
            store.is_idle(k, entry, later)
        });

        assert_eq!(evicted, 2);
        assert!(!store.contains(&key("GET:/x", "a")));
        assert!(store.contains(&key("GET:/x", "b")));
        assert!(!store.contains(&key("GET:/x", "c")));

        // The store is still usable afterwards
        assert_eq!(store.sweep(later), 1);
        assert!(store.is_empty());
    }
}
