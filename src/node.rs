//! The core pipeline.
//!
//! ```text
//! observation ──▶ DomainMatcher ──▶ EntryCache(Local) ──▶ announce, put, broadcast
//! peer frame  ───────────────────▶ EntryCache(Remote) ─▶ announce, put
//! sweeper     ───────────────────▶ EntryCache.expire ──▶ withdraw, delete
//! ```
//!
//! [`Node`] is a cheap handle; every collaborator is owned here and passed in
//! at construction. All side effects run under a shared gate that
//! [`Node::close`] takes exclusively, so nothing reaches the route controller
//! or the store after close returns.
//!
//! Cache changes and the route/store calls that follow them are serialized
//! per IP. Without that, a sweep withdrawing an expired entry could land
//! after an observation re-added and announced the same IP.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{EntryCache, Observed, Origin, WatchEntry};
use crate::error::{LoadError, StoreError};
use crate::events::{EventSink, TracingSink};
use crate::matcher::{normalize, DomainMatcher, LoadStats};
use crate::metrics::{self, RouteAction, Timer};
use crate::peer::{PeerRegistry, PeerSnapshot, ReplicaHandler};
use crate::routes::RouteController;
use crate::store::DurableStore;

const IP_LOCK_STRIPES: usize = 64;

/// Which local observations are broadcast to peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastPolicy {
    /// Every matching local observation, new or refreshed.
    #[default]
    EveryObservation,
    /// Only observations that created a new entry.
    AddedOnly,
}

/// Core tunables.
#[derive(Debug, Clone, Copy)]
pub struct NodeOptions {
    /// Entry lifetime after its last local observation.
    pub ttl: Duration,
    /// Broadcast policy.
    pub broadcast: BroadcastPolicy,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            broadcast: BroadcastPolicy::default(),
        }
    }
}

/// Read-only counters for the stats command.
#[derive(Debug, Clone)]
pub struct Stats {
    /// Cached (announced) IPs.
    pub entries: usize,
    /// Watched domains.
    pub domains: usize,
    /// Peer links.
    pub peers: Vec<PeerSnapshot>,
}

/// Outcome of seeding the cache from the durable store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    /// Entries seeded into the cache.
    pub loaded: usize,
    /// Entries dropped because their TTL had elapsed.
    pub expired: usize,
    /// Entries dropped because their domain is no longer watched.
    pub vanished: usize,
}

/// Builder for [`Node`].
pub struct NodeBuilder {
    matcher: Arc<DomainMatcher>,
    routes: Arc<dyn RouteController>,
    store: Option<Arc<dyn DurableStore>>,
    events: Arc<dyn EventSink>,
    options: NodeOptions,
}

impl NodeBuilder {
    /// Persist entries to `store`.
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Report events to `events` instead of the default [`TracingSink`].
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Override the default options.
    pub fn options(mut self, options: NodeOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the node.
    pub fn build(self) -> Node {
        Node {
            inner: Arc::new(NodeInner {
                cache: EntryCache::new(self.options.ttl),
                matcher: self.matcher,
                routes: self.routes,
                store: self.store,
                events: self.events,
                peers: Arc::new(PeerRegistry::new()),
                policy: self.options.broadcast,
                ip_locks: IpLocks::new(IP_LOCK_STRIPES),
                closed: RwLock::new(false),
            }),
        }
    }
}

/// Handle to the core. Clones share state.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    matcher: Arc<DomainMatcher>,
    cache: EntryCache,
    routes: Arc<dyn RouteController>,
    store: Option<Arc<dyn DurableStore>>,
    events: Arc<dyn EventSink>,
    peers: Arc<PeerRegistry>,
    policy: BroadcastPolicy,
    ip_locks: IpLocks,
    closed: RwLock<bool>,
}

/// Striped async locks keyed by IP.
struct IpLocks {
    stripes: Vec<Mutex<()>>,
}

impl IpLocks {
    fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock(&self, ip: IpAddr) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        ip.hash(&mut hasher);
        let index = (hasher.finish() % self.stripes.len() as u64) as usize;
        self.stripes[index].lock().await
    }
}

impl Node {
    /// Start building a node around a matcher and a route controller.
    pub fn builder(matcher: Arc<DomainMatcher>, routes: Arc<dyn RouteController>) -> NodeBuilder {
        NodeBuilder {
            matcher,
            routes,
            store: None,
            events: Arc::new(TracingSink),
            options: NodeOptions::default(),
        }
    }

    /// The watch-list matcher.
    pub fn matcher(&self) -> &Arc<DomainMatcher> {
        &self.inner.matcher
    }

    /// The entry cache.
    pub fn cache(&self) -> &EntryCache {
        &self.inner.cache
    }

    /// Peer links, shared with the replication engine.
    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.inner.peers
    }

    /// Handle a DNS observation from the local observation source.
    ///
    /// Returns `None` if the domain is not watched or the node is closed.
    pub async fn on_observation(
        &self,
        ip: IpAddr,
        domain: &str,
        seen: SystemTime,
    ) -> Option<Observed> {
        let inner = &self.inner;
        let domain = normalize(domain);
        if !inner.matcher.is_match(&domain) {
            inner.events.on_unmatched(ip, &domain);
            return None;
        }

        let closed = inner.closed.read().await;
        if *closed {
            return None;
        }

        let _ip_lock = inner.ip_locks.lock(ip).await;
        let result = inner.cache.observe(ip, &domain, seen, Origin::Local);
        let entry = inner
            .cache
            .get(&ip)
            .unwrap_or_else(|| WatchEntry::new(ip, domain, seen));
        inner.events.on_observed(&entry, Origin::Local, result);

        // Announce on refresh too; it is idempotent and repairs a route lost
        // to an earlier controller failure.
        self.announce(ip).await;
        self.persist(&entry);

        if result == Observed::Added || inner.policy == BroadcastPolicy::EveryObservation {
            inner.peers.broadcast(&entry);
        }

        Some(result)
    }

    /// Apply entries replicated from a peer. Returns how many were added.
    ///
    /// Added entries are announced and persisted like local ones but are
    /// never broadcast.
    pub async fn apply_remote(&self, entries: Vec<WatchEntry>) -> usize {
        let inner = &self.inner;
        let closed = inner.closed.read().await;
        if *closed {
            return 0;
        }

        let mut added = 0;
        for entry in entries {
            let _ip_lock = inner.ip_locks.lock(entry.ip).await;
            let result = inner
                .cache
                .observe(entry.ip, &entry.domain, entry.last_seen, Origin::Remote);
            inner.events.on_observed(&entry, Origin::Remote, result);

            if result == Observed::Added {
                let stored = inner.cache.get(&entry.ip).unwrap_or(entry);
                self.announce(stored.ip).await;
                self.persist(&stored);
                added += 1;
            }
        }
        added
    }

    /// Expire entries whose TTL elapsed at `now`, withdrawing their routes.
    /// Returns the number expired.
    ///
    /// An IP observed again between expiry and its withdrawal keeps its
    /// route and stored record.
    pub async fn sweep(&self, now: SystemTime) -> usize {
        let inner = &self.inner;
        let closed = inner.closed.read().await;
        if *closed {
            return 0;
        }

        let expired = inner.cache.expire(now);
        for entry in &expired {
            inner.events.on_expired(entry);

            let _ip_lock = inner.ip_locks.lock(entry.ip).await;
            if inner.cache.get(&entry.ip).is_some() {
                debug!(ip = %entry.ip, "entry came back before withdrawal");
                continue;
            }
            self.withdraw(entry.ip).await;
            self.forget(entry.ip);
        }
        expired.len()
    }

    /// Run [`Node::sweep`] every `interval` until `cancel` fires.
    pub async fn run_sweeper(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("sweeper shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let expired = self.sweep(SystemTime::now()).await;
                    if expired > 0 {
                        debug!(expired, remaining = self.inner.cache.count(), "swept cache");
                    }
                }
            }
        }
    }

    /// Seed the cache from the durable store.
    ///
    /// Stored entries that have outlived the TTL or whose domain is no
    /// longer watched are deleted. The rest are cached and re-announced.
    pub async fn restore(&self) -> Result<RestoreStats, StoreError> {
        let inner = &self.inner;
        let Some(store) = &inner.store else {
            return Ok(RestoreStats::default());
        };

        let entries = store.fetch_all()?;
        let now = SystemTime::now();
        let ttl = inner.cache.ttl();
        let mut stats = RestoreStats::default();

        for entry in entries {
            if entry.is_expired(now, ttl) {
                self.forget(entry.ip);
                stats.expired += 1;
                continue;
            }
            if !inner.matcher.is_match(&entry.domain) {
                self.forget(entry.ip);
                stats.vanished += 1;
                continue;
            }

            let ip = entry.ip;
            let _ip_lock = inner.ip_locks.lock(ip).await;
            if inner.cache.restore(entry) {
                self.announce(ip).await;
                stats.loaded += 1;
            }
        }

        info!(
            loaded = stats.loaded,
            expired = stats.expired,
            vanished = stats.vanished,
            "restored cache from store"
        );
        Ok(stats)
    }

    /// Reload the watch-list from `path`. The old list stays active on error.
    pub fn reload(&self, path: &Path) -> Result<LoadStats, LoadError> {
        let result = self.inner.matcher.load_file(path);
        metrics::record_reload(result.is_ok());
        result
    }

    /// Current counters.
    pub fn stats(&self) -> Stats {
        Stats {
            entries: self.inner.cache.count(),
            domains: self.inner.matcher.count(),
            peers: self.inner.peers.snapshot(),
        }
    }

    /// Publish state gauges.
    pub fn emit_metrics(&self) {
        metrics::record_state_counts(
            self.inner.cache.count(),
            self.inner.matcher.count(),
            self.inner.peers.live_count(),
        );
    }

    /// Whether [`Node::close`] has run.
    pub async fn is_closed(&self) -> bool {
        *self.inner.closed.read().await
    }

    /// Stop all side effects and close the store.
    ///
    /// Waits for in-flight observations to finish. Afterwards every entry
    /// point is a no-op.
    pub async fn close(&self) {
        let mut closed = self.inner.closed.write().await;
        if *closed {
            return;
        }
        *closed = true;

        if let Some(store) = &self.inner.store {
            if let Err(e) = store.close() {
                self.inner.events.on_store_error("close", &e);
            }
        }
        debug!("node closed");
    }

    async fn announce(&self, ip: IpAddr) {
        let timer = Timer::start();
        let result = self.inner.routes.announce(ip).await;
        metrics::record_route(RouteAction::Announce, result.is_ok(), timer.elapsed());
        if let Err(e) = result {
            self.inner.events.on_route_error(ip, RouteAction::Announce, &e);
        }
    }

    async fn withdraw(&self, ip: IpAddr) {
        let timer = Timer::start();
        let result = self.inner.routes.withdraw(ip).await;
        metrics::record_route(RouteAction::Withdraw, result.is_ok(), timer.elapsed());
        if let Err(e) = result {
            self.inner.events.on_route_error(ip, RouteAction::Withdraw, &e);
        }
    }

    fn persist(&self, entry: &WatchEntry) {
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.put(entry) {
                self.inner.events.on_store_error("put", &e);
            }
        }
    }

    fn forget(&self, ip: IpAddr) {
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.delete(ip) {
                self.inner.events.on_store_error("delete", &e);
            }
        }
    }
}

#[async_trait]
impl ReplicaHandler for Node {
    fn snapshot(&self) -> Vec<WatchEntry> {
        self.inner.cache.snapshot()
    }

    async fn apply_remote(&self, entries: Vec<WatchEntry>) -> usize {
        Node::apply_remote(self, entries).await
    }
}
