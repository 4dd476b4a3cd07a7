//! Peer links.
//!
//! A link is one TCP connection to another instance, dialled by us
//! ([`Direction::Outbound`]) or accepted ([`Direction::Inbound`]). Its
//! lifecycle is `Disconnected → Connecting → Syncing → Live`:
//!
//! 1. Both sides send `Hello` and read the other's.
//! 2. The link attaches an [`Outbox`] to the [`PeerRegistry`] (`Syncing`), so
//!    broadcasts made from now on are queued, then sends its own snapshot as
//!    one or more `FullSync` frames, each within `max_frame_size`.
//! 3. When the remote's final `FullSync` has been applied the link is `Live`.
//!
//! Reader and writer run concurrently so two large snapshots crossing each
//! other cannot deadlock on full socket buffers. Any error ends only this
//! link.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::WatchEntry;
use crate::error::PeerError;
use crate::events::{EventSink, PeerStatus};
use crate::metrics;
use crate::protocol::{self, PeerMessage, PROTOCOL_VERSION};

/// Registry key of a link.
pub type LinkId = u64;

/// Connection state of a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No connection; an outbound link is waiting out its backoff.
    Disconnected,
    /// Dialling or exchanging `Hello`.
    Connecting,
    /// Exchanging full snapshots.
    Syncing,
    /// Snapshot absorbed; streaming announces.
    Live,
}

impl PeerState {
    /// Lowercase name used in labels and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            PeerState::Disconnected => "disconnected",
            PeerState::Connecting => "connecting",
            PeerState::Syncing => "syncing",
            PeerState::Live => "live",
        }
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialled a configured peer.
    Outbound,
    /// The peer dialled our listener.
    Inbound,
}

/// Point-in-time view of one link.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    /// Registry key.
    pub id: LinkId,
    /// Remote socket address (configured address for outbound links).
    pub address: String,
    /// Which side dialled.
    pub direction: Direction,
    /// Current state.
    pub state: PeerState,
    /// Remote node id once known.
    pub node_id: Option<String>,
    /// Why the link last went down.
    pub last_error: Option<String>,
    /// Announces waiting to be written.
    pub queued: usize,
}

/// Bounded queue of announces waiting for one link's writer.
///
/// When full, the oldest entry is dropped and the queue is marked overflowed;
/// the writer then resets the link so the next connection starts with a
/// fresh full-sync.
#[derive(Debug)]
pub struct Outbox {
    queue: Mutex<VecDeque<WatchEntry>>,
    capacity: usize,
    overflowed: AtomicBool,
    notify: Notify,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            overflowed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn push(&self, entry: WatchEntry) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                if !self.overflowed.swap(true, Ordering::AcqRel) {
                    metrics::record_queue_overflow();
                }
            }
            queue.push_back(entry);
        }
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<WatchEntry> {
        self.queue.lock().drain(..).collect()
    }

    fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[derive(Debug)]
struct LinkSlot {
    address: String,
    direction: Direction,
    state: PeerState,
    node_id: Option<String>,
    last_error: Option<String>,
    outbox: Option<Arc<Outbox>>,
}

/// All peer links of this instance and their outbound queues.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    links: RwLock<BTreeMap<LinkId, LinkSlot>>,
    next_id: AtomicU64,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, address: String, direction: Direction) -> LinkId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.links.write().insert(
            id,
            LinkSlot {
                address,
                direction,
                state: PeerState::Disconnected,
                node_id: None,
                last_error: None,
                outbox: None,
            },
        );
        id
    }

    pub(crate) fn set_state(&self, id: LinkId, state: PeerState) {
        if let Some(slot) = self.links.write().get_mut(&id) {
            slot.state = state;
        }
    }

    /// Start queueing broadcasts for a link whose handshake completed.
    pub(crate) fn attach(&self, id: LinkId, node_id: String, capacity: usize) -> Arc<Outbox> {
        let outbox = Arc::new(Outbox::new(capacity));
        if let Some(slot) = self.links.write().get_mut(&id) {
            slot.state = PeerState::Syncing;
            slot.node_id = Some(node_id);
            slot.last_error = None;
            slot.outbox = Some(outbox.clone());
        }
        outbox
    }

    /// Mark a link down and drop its queue. Returns the remote node id.
    pub(crate) fn detach(&self, id: LinkId, error: Option<&PeerError>) -> Option<String> {
        let mut links = self.links.write();
        let slot = links.get_mut(&id)?;
        slot.state = PeerState::Disconnected;
        slot.outbox = None;
        if let Some(err) = error {
            slot.last_error = Some(err.to_string());
        }
        slot.node_id.clone()
    }

    pub(crate) fn remove(&self, id: LinkId) {
        self.links.write().remove(&id);
    }

    /// Queue `entry` for every connected peer node.
    ///
    /// Each remote node receives it once, on its lowest-numbered attached
    /// link, even when both sides dialled each other. Returns the number of
    /// nodes it was queued for.
    pub fn broadcast(&self, entry: &WatchEntry) -> usize {
        let links = self.links.read();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut sent = 0;

        for slot in links.values() {
            let (Some(outbox), Some(node_id)) = (&slot.outbox, &slot.node_id) else {
                continue;
            };
            if seen.insert(node_id.as_str()) {
                outbox.push(entry.clone());
                sent += 1;
            }
        }

        trace!(ip = %entry.ip, peers = sent, "broadcast");
        sent
    }

    /// Every link, ordered by id.
    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.links
            .read()
            .iter()
            .map(|(id, slot)| PeerSnapshot {
                id: *id,
                address: slot.address.clone(),
                direction: slot.direction,
                state: slot.state,
                node_id: slot.node_id.clone(),
                last_error: slot.last_error.clone(),
                queued: slot.outbox.as_ref().map_or(0, |o| o.len()),
            })
            .collect()
    }

    /// Number of distinct peer nodes with at least one `Live` link.
    pub fn live_count(&self) -> usize {
        self.links
            .read()
            .values()
            .filter(|slot| slot.state == PeerState::Live)
            .filter_map(|slot| slot.node_id.as_deref())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// The side of the core that replication feeds.
#[async_trait]
pub trait ReplicaHandler: Send + Sync + 'static {
    /// Entries to send in our `FullSync`.
    fn snapshot(&self) -> Vec<WatchEntry>;

    /// Apply entries received from a peer as remote observations. Returns how
    /// many were added. Must never re-broadcast.
    async fn apply_remote(&self, entries: Vec<WatchEntry>) -> usize;
}

/// Per-link protocol parameters.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Our node id, sent in `Hello`.
    pub node_id: String,
    /// Outbound queue bound per link.
    pub queue_capacity: usize,
    /// Deadline for receiving the remote `Hello`.
    pub handshake_timeout: Duration,
    /// Deadline for writing one frame.
    pub write_timeout: Duration,
    /// Keepalive period. Three periods without a frame ends the link.
    pub keepalive_interval: Duration,
    /// Largest accepted frame body.
    pub max_frame_size: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            queue_capacity: 1024,
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(10),
            max_frame_size: protocol::MAX_FRAME_SIZE,
        }
    }
}

/// Shared handles every link task needs.
#[derive(Clone)]
pub(crate) struct LinkContext {
    pub registry: Arc<PeerRegistry>,
    pub handler: Arc<dyn ReplicaHandler>,
    pub events: Arc<dyn EventSink>,
    pub settings: Arc<LinkSettings>,
    pub cancel: CancellationToken,
}

/// How a finished link went.
#[derive(Debug)]
pub(crate) struct LinkOutcome {
    pub reached_live: bool,
    pub error: Option<PeerError>,
}

/// Drive one connection until it fails or the context is cancelled.
pub(crate) async fn run_link(
    ctx: &LinkContext,
    id: LinkId,
    address: &str,
    stream: TcpStream,
) -> LinkOutcome {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let live = AtomicBool::new(false);

    let result = tokio::select! {
        biased;

        _ = ctx.cancel.cancelled() => Ok(()),
        result = drive(ctx, id, address, &mut reader, &mut writer, &live) => result,
    };

    let error = result.err();
    let node_id = ctx.registry.detach(id, error.as_ref());
    ctx.events.on_peer_status(&PeerStatus {
        address,
        node_id: node_id.as_deref(),
        state: PeerState::Disconnected,
        synced: 0,
        error: error.as_ref(),
    });

    LinkOutcome {
        reached_live: live.load(Ordering::Acquire),
        error,
    }
}

async fn drive(
    ctx: &LinkContext,
    id: LinkId,
    address: &str,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    live: &AtomicBool,
) -> Result<(), PeerError> {
    let settings = &ctx.settings;

    let hello = PeerMessage::Hello {
        node_id: settings.node_id.clone(),
        version: PROTOCOL_VERSION,
    };
    send(writer, &hello, settings.write_timeout).await?;

    let remote_id = read_hello(reader, settings).await?;
    if remote_id == settings.node_id {
        return Err(PeerError::SelfConnection);
    }

    let outbox = ctx
        .registry
        .attach(id, remote_id.clone(), settings.queue_capacity);
    ctx.events.on_peer_status(&PeerStatus {
        address,
        node_id: Some(&remote_id),
        state: PeerState::Syncing,
        synced: 0,
        error: None,
    });

    let snapshot = ctx.handler.snapshot();
    tokio::try_join!(
        write_loop(writer, &outbox, snapshot, settings),
        read_loop(ctx, id, address, &remote_id, reader, live),
    )?;
    Ok(())
}

async fn send(
    writer: &mut OwnedWriteHalf,
    msg: &PeerMessage,
    deadline: Duration,
) -> Result<(), PeerError> {
    timeout(deadline, protocol::write_message(writer, msg))
        .await
        .map_err(|_| PeerError::Timeout("write"))??;
    metrics::record_frame_sent(msg.kind());
    Ok(())
}

async fn read_hello(
    reader: &mut OwnedReadHalf,
    settings: &LinkSettings,
) -> Result<String, PeerError> {
    let body = timeout(
        settings.handshake_timeout,
        protocol::read_frame(reader, settings.max_frame_size),
    )
    .await
    .map_err(|_| PeerError::Timeout("handshake"))??;

    match protocol::decode(&body) {
        Ok(PeerMessage::Hello { node_id, version }) => {
            if node_id.is_empty() {
                return Err(PeerError::Handshake("empty node id".to_string()));
            }
            debug!(node_id = %node_id, version, "received hello");
            Ok(node_id)
        }
        Ok(other) => Err(PeerError::Handshake(format!(
            "expected hello, got {}",
            other.kind()
        ))),
        Err(e) => Err(PeerError::Handshake(e.to_string())),
    }
}

async fn write_loop(
    writer: &mut OwnedWriteHalf,
    outbox: &Outbox,
    snapshot: Vec<WatchEntry>,
    settings: &LinkSettings,
) -> Result<(), PeerError> {
    let deadline = settings.write_timeout;
    for msg in protocol::full_sync_frames(snapshot, settings.max_frame_size) {
        send(writer, &msg, deadline).await?;
    }

    let mut keepalive = tokio::time::interval(settings.keepalive_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.tick().await;

    loop {
        tokio::select! {
            _ = outbox.notify.notified() => {
                if outbox.overflowed() {
                    return Err(PeerError::QueueOverflow);
                }
                for entry in outbox.drain() {
                    send(writer, &PeerMessage::Announce(entry), deadline).await?;
                }
            }
            _ = keepalive.tick() => {
                send(writer, &PeerMessage::Keepalive, deadline).await?;
            }
        }
    }
}

async fn read_loop(
    ctx: &LinkContext,
    id: LinkId,
    address: &str,
    remote_id: &str,
    reader: &mut OwnedReadHalf,
    live: &AtomicBool,
) -> Result<(), PeerError> {
    let idle = ctx.settings.keepalive_interval * 3;
    let mut synced = 0;

    loop {
        let body = timeout(
            idle,
            protocol::read_frame(reader, ctx.settings.max_frame_size),
        )
        .await
        .map_err(|_| PeerError::Timeout("read"))??;

        let msg = match protocol::decode(&body) {
            Ok(msg) => msg,
            Err(e) => {
                ctx.events.on_malformed_frame(address, &e);
                continue;
            }
        };
        metrics::record_frame_received(msg.kind());

        match msg {
            PeerMessage::FullSync { entries, done } => {
                let received = entries.len();
                let added = ctx.handler.apply_remote(entries).await;
                metrics::record_full_sync(received, added);
                synced += added;

                if done && !live.swap(true, Ordering::AcqRel) {
                    ctx.registry.set_state(id, PeerState::Live);
                    ctx.events.on_peer_status(&PeerStatus {
                        address,
                        node_id: Some(remote_id),
                        state: PeerState::Live,
                        synced,
                        error: None,
                    });
                }
            }
            PeerMessage::Announce(entry) => {
                ctx.handler.apply_remote(vec![entry]).await;
            }
            PeerMessage::Keepalive => {}
            PeerMessage::Hello { .. } => {
                debug!(peer = address, "ignoring repeated hello");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn entry(ip: &str) -> WatchEntry {
        WatchEntry::new(ip.parse().unwrap(), "a.example", SystemTime::now())
    }

    #[test]
    fn test_outbox_drops_oldest_on_overflow() {
        let outbox = Outbox::new(2);
        outbox.push(entry("10.0.0.1"));
        outbox.push(entry("10.0.0.2"));
        assert!(!outbox.overflowed());

        outbox.push(entry("10.0.0.3"));
        assert!(outbox.overflowed());

        let drained: Vec<String> = outbox.drain().iter().map(|e| e.ip.to_string()).collect();
        assert_eq!(drained, vec!["10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn test_broadcast_reaches_attached_links_only() {
        let registry = PeerRegistry::new();
        let a = registry.register("10.0.0.1:6000".to_string(), Direction::Outbound);
        let _b = registry.register("10.0.0.2:6000".to_string(), Direction::Outbound);
        let outbox = registry.attach(a, "node-a".to_string(), 16);

        assert_eq!(registry.broadcast(&entry("1.2.3.4")), 1);
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn test_broadcast_once_per_node() {
        let registry = PeerRegistry::new();
        let out = registry.register("10.0.0.1:6000".to_string(), Direction::Outbound);
        let inb = registry.register("10.0.0.1:51234".to_string(), Direction::Inbound);
        let other = registry.register("10.0.0.2:6000".to_string(), Direction::Outbound);

        let out_box = registry.attach(out, "node-a".to_string(), 16);
        let in_box = registry.attach(inb, "node-a".to_string(), 16);
        let other_box = registry.attach(other, "node-b".to_string(), 16);

        assert_eq!(registry.broadcast(&entry("1.2.3.4")), 2);
        assert_eq!(out_box.len(), 1);
        assert_eq!(in_box.len(), 0);
        assert_eq!(other_box.len(), 1);

        registry.detach(out, Some(&PeerError::Closed));
        assert_eq!(registry.broadcast(&entry("1.2.3.5")), 2);
        assert_eq!(in_box.len(), 1);
    }

    #[test]
    fn test_detach_records_error_and_state() {
        let registry = PeerRegistry::new();
        let id = registry.register("10.0.0.1:6000".to_string(), Direction::Outbound);
        registry.attach(id, "node-a".to_string(), 16);
        registry.set_state(id, PeerState::Live);
        assert_eq!(registry.live_count(), 1);

        let node = registry.detach(id, Some(&PeerError::Timeout("read")));
        assert_eq!(node.as_deref(), Some("node-a"));

        let snap = &registry.snapshot()[0];
        assert_eq!(snap.state, PeerState::Disconnected);
        assert_eq!(snap.last_error.as_deref(), Some("peer timed out during read"));
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.broadcast(&entry("1.2.3.4")), 0);
    }
}
