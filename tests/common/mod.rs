//! Shared test infrastructure for dnsroute integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use dnsroute::cache::unix_millis;
use dnsroute::error::{ProtocolError, RouteError, StoreError};
use dnsroute::events::{EventSink, PeerStatus};
use dnsroute::metrics::RouteAction;
use dnsroute::peer::{LinkSettings, PeerState};
use dnsroute::{
    DomainMatcher, DurableStore, Node, NodeOptions, Observed, Origin, ReplicationSettings,
    Replicator, RouteController, WatchEntry,
};

// --- Constants ---

pub const WATCHED: &str = "bad.example";

// --- Helpers ---

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// The `n`th address in 10.0.0.0/8.
pub fn nth_ip(n: u32) -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::from(0x0a00_0000 + n))
}

/// An entry stamped `age` in the past, rounded to whole milliseconds.
pub fn entry_aged(ip_str: &str, domain: &str, age: Duration) -> WatchEntry {
    let ms = unix_millis::to_millis(SystemTime::now() - age);
    WatchEntry::new(ip(ip_str), domain, unix_millis::from_millis(ms))
}

/// Poll `cond` every 10ms until it holds or `timeout` elapses.
pub async fn wait_for<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// --- RecordingRoutes ---

/// Route controller that records every call.
#[derive(Default)]
pub struct RecordingRoutes {
    calls: Mutex<Vec<(RouteAction, IpAddr)>>,
    announced: Mutex<HashSet<IpAddr>>,
    fail: AtomicBool,
    withdraw_delay: Mutex<Duration>,
}

impl RecordingRoutes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following call fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Make every following withdraw take `delay` before it lands.
    pub fn set_withdraw_delay(&self, delay: Duration) {
        *self.withdraw_delay.lock().unwrap() = delay;
    }

    pub fn calls(&self, action: RouteAction, ip: IpAddr) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, i)| *a == action && *i == ip)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn is_announced(&self, ip: IpAddr) -> bool {
        self.announced.lock().unwrap().contains(&ip)
    }

    pub fn announced(&self) -> HashSet<IpAddr> {
        self.announced.lock().unwrap().clone()
    }
}

#[async_trait]
impl RouteController for RecordingRoutes {
    async fn announce(&self, ip: IpAddr) -> Result<(), RouteError> {
        self.calls.lock().unwrap().push((RouteAction::Announce, ip));
        if self.fail.load(Ordering::SeqCst) {
            return Err(RouteError::Failed {
                ip,
                status: "exit status: 1".to_string(),
            });
        }
        self.announced.lock().unwrap().insert(ip);
        Ok(())
    }

    async fn withdraw(&self, ip: IpAddr) -> Result<(), RouteError> {
        let delay = *self.withdraw_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().unwrap().push((RouteAction::Withdraw, ip));
        if self.fail.load(Ordering::SeqCst) {
            return Err(RouteError::Failed {
                ip,
                status: "exit status: 1".to_string(),
            });
        }
        self.announced.lock().unwrap().remove(&ip);
        Ok(())
    }
}

// --- MemoryStore ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Put(IpAddr),
    Delete(IpAddr),
    Close,
}

/// In-memory durable store that records every call.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<IpAddr, WatchEntry>>,
    ops: Mutex<Vec<StoreOp>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_entries(entries: Vec<WatchEntry>) -> Arc<Self> {
        let store = Self::default();
        store
            .entries
            .lock()
            .unwrap()
            .extend(entries.into_iter().map(|e| (e.ip, e)));
        Arc::new(store)
    }

    pub fn get(&self, ip: IpAddr) -> Option<WatchEntry> {
        self.entries.lock().unwrap().get(&ip).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn count(&self, op: &StoreOp) -> usize {
        self.ops.lock().unwrap().iter().filter(|o| *o == op).count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DurableStore for MemoryStore {
    fn put(&self, entry: &WatchEntry) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        self.ops.lock().unwrap().push(StoreOp::Put(entry.ip));
        self.entries.lock().unwrap().insert(entry.ip, entry.clone());
        Ok(())
    }

    fn delete(&self, ip: IpAddr) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        self.ops.lock().unwrap().push(StoreOp::Delete(ip));
        self.entries.lock().unwrap().remove(&ip);
        Ok(())
    }

    fn fetch_all(&self) -> Result<Vec<WatchEntry>, StoreError> {
        Ok(self.entries.lock().unwrap().values().cloned().collect())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.ops.lock().unwrap().push(StoreOp::Close);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// --- RecordingSink ---

/// Event sink that keeps what the tests assert on.
#[derive(Default)]
pub struct RecordingSink {
    observed: Mutex<Vec<(IpAddr, Origin, Observed)>>,
    expired: Mutex<Vec<IpAddr>>,
    unmatched: AtomicUsize,
    route_errors: AtomicUsize,
    peer_states: Mutex<Vec<(String, PeerState)>>,
    peer_errors: Mutex<Vec<String>>,
    malformed: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn observed(&self, origin: Origin, result: Observed) -> usize {
        self.observed
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, o, r)| *o == origin && *r == result)
            .count()
    }

    pub fn expired(&self) -> Vec<IpAddr> {
        self.expired.lock().unwrap().clone()
    }

    pub fn unmatched(&self) -> usize {
        self.unmatched.load(Ordering::SeqCst)
    }

    pub fn route_errors(&self) -> usize {
        self.route_errors.load(Ordering::SeqCst)
    }

    pub fn peer_states(&self) -> Vec<(String, PeerState)> {
        self.peer_states.lock().unwrap().clone()
    }

    pub fn live_transitions(&self) -> usize {
        self.peer_states
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| *s == PeerState::Live)
            .count()
    }

    /// Every error a link went down with, as text.
    pub fn peer_errors(&self) -> Vec<String> {
        self.peer_errors.lock().unwrap().clone()
    }

    pub fn malformed(&self) -> usize {
        self.malformed.load(Ordering::SeqCst)
    }
}

impl EventSink for RecordingSink {
    fn on_observed(&self, entry: &WatchEntry, origin: Origin, result: Observed) {
        self.observed
            .lock()
            .unwrap()
            .push((entry.ip, origin, result));
    }

    fn on_unmatched(&self, _ip: IpAddr, _domain: &str) {
        self.unmatched.fetch_add(1, Ordering::SeqCst);
    }

    fn on_expired(&self, entry: &WatchEntry) {
        self.expired.lock().unwrap().push(entry.ip);
    }

    fn on_route_error(&self, _ip: IpAddr, _action: RouteAction, _error: &RouteError) {
        self.route_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_peer_status(&self, status: &PeerStatus<'_>) {
        self.peer_states
            .lock()
            .unwrap()
            .push((status.address.to_string(), status.state));
        if let Some(error) = status.error {
            self.peer_errors.lock().unwrap().push(error.to_string());
        }
    }

    fn on_malformed_frame(&self, _address: &str, _error: &ProtocolError) {
        self.malformed.fetch_add(1, Ordering::SeqCst);
    }
}

// --- Node builder ---

/// A node wired to recording doubles.
pub struct TestNode {
    pub node: Node,
    pub routes: Arc<RecordingRoutes>,
    pub store: Arc<MemoryStore>,
    pub events: Arc<RecordingSink>,
}

impl TestNode {
    pub fn new(domains: &[&str]) -> Self {
        Self::with_options(domains, NodeOptions::default(), MemoryStore::new())
    }

    pub fn with_options(domains: &[&str], options: NodeOptions, store: Arc<MemoryStore>) -> Self {
        let routes = RecordingRoutes::new();
        let events = RecordingSink::new();
        let node = Node::builder(Arc::new(DomainMatcher::from_domains(domains)), routes.clone())
            .store(store.clone())
            .events(events.clone())
            .options(options)
            .build();

        Self {
            node,
            routes,
            store,
            events,
        }
    }

    pub fn has(&self, ip_str: &str) -> bool {
        self.node.cache().get(&ip(ip_str)).is_some()
    }
}

// --- Replication ---

/// Replication settings with timings short enough for tests.
pub fn fast_settings(node_id: &str, listen: bool, peers: Vec<String>) -> ReplicationSettings {
    ReplicationSettings {
        listen: listen.then(|| "127.0.0.1:0".parse::<SocketAddr>().unwrap()),
        peers,
        link: LinkSettings {
            node_id: node_id.to_string(),
            queue_capacity: 64,
            handshake_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_millis(200),
            ..LinkSettings::default()
        },
        connect_timeout: Duration::from_secs(1),
        backoff_min: Duration::from_millis(20),
        backoff_max: Duration::from_millis(200),
    }
}

/// Start replication for `test_node`.
pub async fn replicate(test_node: &TestNode, settings: ReplicationSettings) -> Replicator {
    Replicator::start(
        settings,
        test_node.node.peers().clone(),
        Arc::new(test_node.node.clone()),
        test_node.events.clone(),
    )
    .await
    .expect("replicator failed to start")
}

/// Wait until `node` has at least one live link.
pub async fn wait_live(node: &Node) -> bool {
    let peers = node.peers().clone();
    wait_for(Duration::from_secs(5), || peers.live_count() > 0).await
}
