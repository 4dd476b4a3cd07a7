//! dnsroute - host routes for the IPs behind a watched set of domains.
//!
//! An observation source feeds `(ip, domain)` pairs taken from live DNS
//! traffic. Every IP that resolved for a watched domain (or a subdomain of
//! one) gets a host route announced, kept alive while it keeps being seen,
//! and withdrawn once it has not been seen for the TTL. Instances replicate
//! their entries to each other so every edge announces the same set.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                             dnsroute                               │
//! │                                                                    │
//! │  ingest (NDJSON) ──▶ DomainMatcher ──▶ EntryCache ──▶ RouteController
//! │                          ▲                  │    └──▶ DurableStore  │
//! │              SIGHUP ─────┘                  │                      │
//! │                                             ▼                      │
//! │                                       PeerRegistry ◀──▶ peers      │
//! │                                     (Hello, FullSync,              │
//! │                                      Announce, Keepalive)          │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Replication
//!
//! Entries carry an origin. Local observations create or refresh entries
//! and are broadcast; peer entries may only create entries and are never
//! broadcast again, so one observation costs at most one message per peer.
//! Every (re)connect exchanges full snapshots, which repairs anything lost
//! while a link was down.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use dnsroute::{DomainMatcher, Node, RouteTable};
//! use std::sync::Arc;
//! use std::time::SystemTime;
//!
//! #[tokio::main]
//! async fn main() {
//!     let routes = Arc::new(RouteTable::new());
//!     let node = Node::builder(
//!         Arc::new(DomainMatcher::from_domains(&["bad.example"])),
//!         routes.clone(),
//!     )
//!     .build();
//!
//!     node.on_observation("1.2.3.4".parse().unwrap(), "x.bad.example", SystemTime::now())
//!         .await;
//!     assert!(routes.is_announced(&"1.2.3.4".parse().unwrap()));
//! }
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod ingest;
pub mod matcher;
pub mod metrics;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod replication;
pub mod routes;
pub mod server;
pub mod store;
pub mod telemetry;

// Re-export main types
pub use cache::{EntryCache, Observed, Origin, WatchEntry};
pub use config::{Config, TelemetryConfig};
pub use control::Command;
pub use error::{Error, LoadError, PeerError, ProtocolError, RouteError, StoreError};
pub use events::{EventSink, NoopSink, PeerStatus, TracingSink};
pub use matcher::{DomainMatcher, LoadStats};
pub use node::{BroadcastPolicy, Node, NodeOptions, RestoreStats, Stats};
pub use peer::{PeerRegistry, PeerSnapshot, PeerState};
pub use replication::{ReplicationSettings, Replicator};
pub use routes::{CommandRouteController, RouteController, RouteTable};
pub use server::Server;
pub use store::{DurableStore, SledStore};
