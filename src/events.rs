//! Event sink for everything the core reports about itself.
//!
//! Each event kind has its own method with a no-op default, so a sink only
//! implements what it cares about. [`TracingSink`] logs and records metrics;
//! tests substitute recording sinks.

use std::net::IpAddr;
use tracing::{debug, error, info, warn};

use crate::cache::{Observed, Origin, WatchEntry};
use crate::error::{PeerError, ProtocolError, RouteError, StoreError};
use crate::metrics::{self, RouteAction};
use crate::peer::PeerState;

/// A peer link changed state.
#[derive(Debug)]
pub struct PeerStatus<'a> {
    /// Remote address of the link.
    pub address: &'a str,
    /// Remote node id, once the handshake is done.
    pub node_id: Option<&'a str>,
    /// New state.
    pub state: PeerState,
    /// Entries added locally from the peer's full-sync (when entering `Live`).
    pub synced: usize,
    /// Why the link went down (when entering `Disconnected`).
    pub error: Option<&'a PeerError>,
}

/// Receiver of core events.
pub trait EventSink: Send + Sync + 'static {
    /// An observation reached the cache.
    fn on_observed(&self, _entry: &WatchEntry, _origin: Origin, _result: Observed) {}

    /// A local observation did not match the watch-list.
    fn on_unmatched(&self, _ip: IpAddr, _domain: &str) {}

    /// An entry's TTL elapsed and it was removed from the cache.
    fn on_expired(&self, _entry: &WatchEntry) {}

    /// A route controller call failed.
    fn on_route_error(&self, _ip: IpAddr, _action: RouteAction, _error: &RouteError) {}

    /// A durable store call failed.
    fn on_store_error(&self, _op: &'static str, _error: &StoreError) {}

    /// A peer link changed state.
    fn on_peer_status(&self, _status: &PeerStatus<'_>) {}

    /// A peer sent a frame that could not be decoded.
    fn on_malformed_frame(&self, _address: &str, _error: &ProtocolError) {}
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {}

/// Default sink: structured logs plus metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_observed(&self, entry: &WatchEntry, origin: Origin, result: Observed) {
        metrics::record_observation(origin, result);
        if result == Observed::Added {
            info!(
                ip = %entry.ip,
                domain = %entry.domain,
                from_peer = origin == Origin::Remote,
                "new host"
            );
        }
    }

    fn on_unmatched(&self, _ip: IpAddr, _domain: &str) {
        metrics::record_unmatched();
    }

    fn on_expired(&self, entry: &WatchEntry) {
        metrics::record_expired();
        info!(ip = %entry.ip, domain = %entry.domain, "expired");
    }

    fn on_route_error(&self, ip: IpAddr, action: RouteAction, error: &RouteError) {
        warn!(%ip, action = action.as_str(), "route update failed: {}", error);
    }

    fn on_store_error(&self, op: &'static str, error: &StoreError) {
        metrics::record_store_error(op);
        warn!(op, "store operation failed: {}", error);
    }

    fn on_peer_status(&self, status: &PeerStatus<'_>) {
        metrics::record_peer_state(status.state);
        match (status.state, status.error) {
            (PeerState::Live, _) => info!(
                peer = status.address,
                node_id = status.node_id.unwrap_or("-"),
                synced = status.synced,
                "peer live"
            ),
            (PeerState::Disconnected, Some(err)) => warn!(
                peer = status.address,
                node_id = status.node_id.unwrap_or("-"),
                "peer disconnected: {}",
                err
            ),
            (state, _) => debug!(peer = status.address, state = state.as_str(), "peer state"),
        }
    }

    fn on_malformed_frame(&self, address: &str, error: &ProtocolError) {
        metrics::record_malformed_frame();
        error!(peer = address, "dropping frame: {}", error);
    }
}
