//! In-memory set of watched IPs with TTL eviction.
//!
//! One [`WatchEntry`] per IP. Local observations create or refresh entries;
//! remote (peer-replicated) observations may only create them. This keeps
//! replicated data from extending the freshness clock of an entry we already
//! track and bounds replication to one hop.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

/// A watched IP and the domain it was last resolved for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEntry {
    /// Resolved address. Identity of the entry.
    pub ip: IpAddr,
    /// Most recent domain that resolved to `ip`.
    pub domain: String,
    /// Time of the most recent local observation.
    #[serde(with = "unix_millis")]
    pub last_seen: SystemTime,
}

impl WatchEntry {
    /// Create an entry.
    pub fn new(ip: IpAddr, domain: impl Into<String>, last_seen: SystemTime) -> Self {
        Self {
            ip,
            domain: domain.into(),
            last_seen,
        }
    }

    /// Time elapsed since `last_seen`. Zero if `last_seen` is in the future.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_seen).unwrap_or(Duration::ZERO)
    }

    /// Whether the entry is eligible for eviction at `now`.
    pub fn is_expired(&self, now: SystemTime, ttl: Duration) -> bool {
        self.age(now) >= ttl
    }
}

/// Where an observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Seen directly in local DNS traffic.
    Local,
    /// Replicated from a peer.
    Remote,
}

/// Result of [`EntryCache::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    /// New entry created.
    Added,
    /// Existing entry's domain and `last_seen` updated.
    Refreshed,
    /// Nothing changed.
    Ignored,
}

/// Thread-safe IP → entry map.
#[derive(Debug, Clone)]
pub struct EntryCache {
    inner: Arc<RwLock<CacheInner>>,
}

#[derive(Debug)]
struct CacheInner {
    ttl: Duration,
    entries: HashMap<IpAddr, WatchEntry>,
}

impl EntryCache {
    /// Create an empty cache whose entries live for `ttl` after their last
    /// local observation.
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheInner {
                ttl,
                entries: HashMap::new(),
            })),
        }
    }

    /// Entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.inner.read().ttl
    }

    /// Record that `ip` resolved for `domain` at `seen`.
    ///
    /// `seen` is clamped to the current time, so a producer clock running
    /// ahead cannot pin an entry. A local observation older than the entry's
    /// `last_seen` still counts as a refresh but moves nothing backwards.
    /// Remote observations never touch an existing entry, and a remote
    /// observation that is already older than the TTL is ignored.
    pub fn observe(&self, ip: IpAddr, domain: &str, seen: SystemTime, origin: Origin) -> Observed {
        let now = SystemTime::now();
        let seen = seen.min(now);
        let mut inner = self.inner.write();

        if let Some(entry) = inner.entries.get_mut(&ip) {
            return match origin {
                Origin::Local => {
                    if seen >= entry.last_seen {
                        if entry.domain != domain {
                            entry.domain = domain.to_string();
                        }
                        entry.last_seen = seen;
                    }
                    trace!(%ip, domain, "refreshed entry");
                    Observed::Refreshed
                }
                Origin::Remote => Observed::Ignored,
            };
        }

        if origin == Origin::Remote && now.duration_since(seen).unwrap_or(Duration::ZERO) >= inner.ttl {
            debug!(%ip, domain, "ignoring stale remote entry");
            return Observed::Ignored;
        }

        inner
            .entries
            .insert(ip, WatchEntry::new(ip, domain, seen));
        debug!(%ip, domain, ?origin, "added entry");
        Observed::Added
    }

    /// Seed an entry restored from persistent storage, keeping its
    /// `last_seen`. Returns `false` if the IP is already present.
    pub fn restore(&self, entry: WatchEntry) -> bool {
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&entry.ip) {
            return false;
        }
        inner.entries.insert(entry.ip, entry);
        true
    }

    /// Remove an entry unconditionally, without an expiry notification.
    pub fn evict(&self, ip: &IpAddr) -> Option<WatchEntry> {
        let removed = self.inner.write().entries.remove(ip);
        if removed.is_some() {
            debug!(%ip, "evicted entry");
        }
        removed
    }

    /// Remove and return every entry whose TTL has elapsed at `now`.
    ///
    /// Removal happens under the write lock, so each entry is returned by
    /// exactly one call. Callers run their notifications after this returns.
    pub fn expire(&self, now: SystemTime) -> Vec<WatchEntry> {
        let mut inner = self.inner.write();
        let ttl = inner.ttl;

        let expired: Vec<IpAddr> = inner
            .entries
            .values()
            .filter(|e| e.is_expired(now, ttl))
            .map(|e| e.ip)
            .collect();

        expired
            .iter()
            .filter_map(|ip| inner.entries.remove(ip))
            .collect()
    }

    /// Current entry for `ip`.
    pub fn get(&self, ip: &IpAddr) -> Option<WatchEntry> {
        self.inner.read().entries.get(ip).cloned()
    }

    /// Point-in-time copy of all entries, ordered by IP.
    pub fn snapshot(&self) -> Vec<WatchEntry> {
        let mut entries: Vec<WatchEntry> = self.inner.read().entries.values().cloned().collect();
        entries.sort_by(|a, b| a.ip.cmp(&b.ip));
        entries
    }

    /// Number of entries.
    pub fn count(&self) -> usize {
        self.inner.read().entries.len()
    }
}

/// `SystemTime` as integer milliseconds since the Unix epoch.
pub mod unix_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    /// Convert to milliseconds since the epoch. Times before it map to 0.
    pub fn to_millis(time: SystemTime) -> u64 {
        time.duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Convert from milliseconds since the epoch.
    pub fn from_millis(millis: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(millis)
    }

    /// Serialize as a `u64`.
    pub fn serialize<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(to_millis(*time))
    }

    /// Deserialize from a `u64`.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
        u64::deserialize(deserializer).map(from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_local_observe_adds_then_refreshes() {
        let cache = EntryCache::new(TTL);
        let t0 = SystemTime::now() - Duration::from_secs(10);

        assert_eq!(
            cache.observe(ip("1.2.3.4"), "a.example", t0, Origin::Local),
            Observed::Added
        );
        let t1 = t0 + Duration::from_secs(5);
        assert_eq!(
            cache.observe(ip("1.2.3.4"), "b.example", t1, Origin::Local),
            Observed::Refreshed
        );

        let entry = cache.get(&ip("1.2.3.4")).unwrap();
        assert_eq!(entry.domain, "b.example");
        assert_eq!(entry.last_seen, t1);
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn test_local_future_timestamp_is_clamped() {
        let cache = EntryCache::new(TTL);
        let future = SystemTime::now() + Duration::from_secs(3600);

        cache.observe(ip("1.2.3.4"), "a.example", future, Origin::Local);
        let entry = cache.get(&ip("1.2.3.4")).unwrap();
        assert!(entry.last_seen <= SystemTime::now());

        // Expires on schedule instead of an hour late.
        assert_eq!(cache.expire(SystemTime::now() + TTL).len(), 1);
    }

    #[test]
    fn test_local_out_of_order_never_moves_back() {
        let cache = EntryCache::new(TTL);
        let newer = SystemTime::now() - Duration::from_secs(5);
        let older = newer - Duration::from_secs(20);

        cache.observe(ip("1.2.3.4"), "new.example", newer, Origin::Local);
        assert_eq!(
            cache.observe(ip("1.2.3.4"), "old.example", older, Origin::Local),
            Observed::Refreshed
        );

        let entry = cache.get(&ip("1.2.3.4")).unwrap();
        assert_eq!(entry.last_seen, newer);
        assert_eq!(entry.domain, "new.example");
    }

    #[test]
    fn test_remote_observe_never_mutates_existing() {
        let cache = EntryCache::new(TTL);
        let t0 = SystemTime::now() - Duration::from_secs(30);
        cache.observe(ip("1.2.3.4"), "a.example", t0, Origin::Local);

        let result = cache.observe(ip("1.2.3.4"), "other.example", SystemTime::now(), Origin::Remote);

        assert_eq!(result, Observed::Ignored);
        let entry = cache.get(&ip("1.2.3.4")).unwrap();
        assert_eq!(entry.last_seen, t0);
        assert_eq!(entry.domain, "a.example");
    }

    #[test]
    fn test_remote_observe_adds_absent_with_its_timestamp() {
        let cache = EntryCache::new(TTL);
        let seen = SystemTime::now() - Duration::from_secs(10);

        assert_eq!(
            cache.observe(ip("::1"), "v6.example", seen, Origin::Remote),
            Observed::Added
        );
        assert_eq!(cache.get(&ip("::1")).unwrap().last_seen, seen);
    }

    #[test]
    fn test_remote_observe_ignores_stale_and_clamps_future() {
        let cache = EntryCache::new(TTL);
        let stale = SystemTime::now() - Duration::from_secs(120);
        assert_eq!(
            cache.observe(ip("10.0.0.1"), "a.example", stale, Origin::Remote),
            Observed::Ignored
        );
        assert_eq!(cache.count(), 0);

        let future = SystemTime::now() + Duration::from_secs(3600);
        cache.observe(ip("10.0.0.2"), "a.example", future, Origin::Remote);
        assert!(cache.get(&ip("10.0.0.2")).unwrap().last_seen <= SystemTime::now());
    }

    #[test]
    fn test_expire_removes_exactly_once() {
        let cache = EntryCache::new(TTL);
        let t0 = SystemTime::now() - TTL;
        cache.observe(ip("1.1.1.1"), "old.example", t0, Origin::Local);
        cache.observe(ip("2.2.2.2"), "new.example", t0 + Duration::from_secs(30), Origin::Local);

        let now = t0 + TTL;
        let expired = cache.expire(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].ip, ip("1.1.1.1"));
        assert!(cache.snapshot().iter().all(|e| e.ip != ip("1.1.1.1")));

        assert!(cache.expire(now).is_empty());
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn test_refresh_extends_lifetime() {
        let cache = EntryCache::new(TTL);
        let t0 = SystemTime::now() - TTL;
        cache.observe(ip("1.1.1.1"), "a.example", t0, Origin::Local);
        cache.observe(ip("1.1.1.1"), "a.example", t0 + Duration::from_secs(50), Origin::Local);

        assert!(cache.expire(t0 + TTL).is_empty());
        assert_eq!(cache.expire(t0 + Duration::from_secs(110)).len(), 1);
    }

    #[test]
    fn test_zero_ttl_expires_on_next_sweep() {
        let cache = EntryCache::new(Duration::ZERO);
        let t0 = SystemTime::now();
        cache.observe(ip("1.1.1.1"), "a.example", t0, Origin::Local);

        assert_eq!(cache.expire(t0).len(), 1);
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn test_evict_and_restore() {
        let cache = EntryCache::new(TTL);
        let entry = WatchEntry::new(ip("1.1.1.1"), "a.example", SystemTime::now());

        assert!(cache.restore(entry.clone()));
        assert!(!cache.restore(entry.clone()));
        assert_eq!(cache.evict(&entry.ip), Some(entry.clone()));
        assert_eq!(cache.evict(&entry.ip), None);
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let cache = EntryCache::new(TTL);
        let now = SystemTime::now();
        for addr in ["10.0.0.3", "10.0.0.1", "10.0.0.2"] {
            cache.observe(ip(addr), "a.example", now, Origin::Local);
        }

        let ips: Vec<IpAddr> = cache.snapshot().into_iter().map(|e| e.ip).collect();
        assert_eq!(ips, vec![ip("10.0.0.1"), ip("10.0.0.2"), ip("10.0.0.3")]);
    }

    #[test]
    fn test_concurrent_observe_adds_once() {
        let cache = EntryCache::new(TTL);
        let now = SystemTime::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .filter(|_| {
                            cache.observe(ip("9.9.9.9"), "a.example", now, Origin::Local)
                                == Observed::Added
                        })
                        .count()
                })
            })
            .collect();

        let added: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(added, 1);
    }

    #[test]
    fn test_entry_serializes_millis() {
        let entry = WatchEntry::new(
            ip("1.2.3.4"),
            "a.example",
            unix_millis::from_millis(1_700_000_000_123),
        );
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(
            json,
            r#"{"ip":"1.2.3.4","domain":"a.example","last_seen":1700000000123}"#
        );
    }
}
