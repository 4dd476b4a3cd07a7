//! Metrics instrumentation for dnsroute.
//!
//! All metrics are prefixed with `dnsroute.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

use crate::cache::{Observed, Origin};
use crate::peer::PeerState;

/// Record the outcome of an observation.
pub fn record_observation(origin: Origin, result: Observed) {
    let origin_str = match origin {
        Origin::Local => "local",
        Origin::Remote => "remote",
    };
    let result_str = match result {
        Observed::Added => "added",
        Observed::Refreshed => "refreshed",
        Observed::Ignored => "ignored",
    };

    counter!("dnsroute.observation.count", "origin" => origin_str, "result" => result_str)
        .increment(1);
}

/// Record a local observation whose domain is not watched.
pub fn record_unmatched() {
    counter!("dnsroute.observation.unmatched.count").increment(1);
}

/// Record an expired entry.
pub fn record_expired() {
    counter!("dnsroute.cache.expired.count").increment(1);
}

/// Record a route controller call.
pub fn record_route(action: RouteAction, ok: bool, duration: std::time::Duration) {
    let action_str = action.as_str();
    let result_str = if ok { "success" } else { "error" };

    counter!("dnsroute.route.count", "action" => action_str, "result" => result_str)
        .increment(1);
    histogram!("dnsroute.route.duration.seconds", "action" => action_str)
        .record(duration.as_secs_f64());
}

/// Route controller actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Host route added.
    Announce,
    /// Host route removed.
    Withdraw,
}

impl RouteAction {
    /// Lowercase name used in labels and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            RouteAction::Announce => "announce",
            RouteAction::Withdraw => "withdraw",
        }
    }
}

/// Record a durable store failure.
pub fn record_store_error(op: &'static str) {
    counter!("dnsroute.store.error.count", "op" => op).increment(1);
}

/// Record a peer link state transition.
pub fn record_peer_state(state: PeerState) {
    counter!("dnsroute.peer.transition.count", "state" => state.as_str()).increment(1);
}

/// Record entries absorbed from a peer full-sync.
pub fn record_full_sync(received: usize, added: usize) {
    histogram!("dnsroute.peer.full_sync.entries").record(received as f64);
    counter!("dnsroute.peer.full_sync.added.count").increment(added as u64);
}

/// Record a frame sent to a peer.
pub fn record_frame_sent(kind: &'static str) {
    counter!("dnsroute.peer.frame.sent.count", "kind" => kind).increment(1);
}

/// Record a frame received from a peer.
pub fn record_frame_received(kind: &'static str) {
    counter!("dnsroute.peer.frame.received.count", "kind" => kind).increment(1);
}

/// Record a frame that failed to decode.
pub fn record_malformed_frame() {
    counter!("dnsroute.peer.frame.malformed.count").increment(1);
}

/// Record an ingest line that failed to parse.
pub fn record_ingest_malformed() {
    counter!("dnsroute.ingest.malformed.count").increment(1);
}

/// Record an outbound queue overflow.
pub fn record_queue_overflow() {
    counter!("dnsroute.peer.queue.overflow.count").increment(1);
}

/// Record state counts (call periodically or on change).
pub fn record_state_counts(entries: usize, domains: usize, live_peers: usize) {
    gauge!("dnsroute.cache.entries").set(entries as f64);
    gauge!("dnsroute.watch.domains").set(domains as f64);
    gauge!("dnsroute.peer.live").set(live_peers as f64);
}

/// Record a watch-list reload.
pub fn record_reload(ok: bool) {
    let result = if ok { "success" } else { "error" };
    counter!("dnsroute.watch.reload.count", "result" => result).increment(1);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
