//! Replication engine.
//!
//! Symmetric mesh: every instance may listen for peers and dial the peers it
//! is configured with. Each link is an independent task; outbound links
//! reconnect with exponential backoff and perform a fresh full-sync every
//! time they come back. A configured peer that answers with our own node id
//! is dropped for good.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::PeerError;
use crate::events::{EventSink, PeerStatus};
use crate::peer::{
    run_link, Direction, LinkContext, LinkId, LinkSettings, PeerRegistry, PeerSnapshot, PeerState,
    ReplicaHandler,
};

/// Floor for the reconnect delay.
const MIN_BACKOFF: Duration = Duration::from_millis(10);

/// Replication engine configuration.
#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    /// Address to accept peer connections on.
    pub listen: Option<SocketAddr>,
    /// Peers to dial (`host:port`).
    pub peers: Vec<String>,
    /// Per-link protocol parameters.
    pub link: LinkSettings,
    /// Deadline for establishing a TCP connection.
    pub connect_timeout: Duration,
    /// First reconnect delay.
    pub backoff_min: Duration,
    /// Reconnect delay ceiling.
    pub backoff_max: Duration,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            listen: None,
            peers: Vec::new(),
            link: LinkSettings::default(),
            connect_timeout: Duration::from_secs(5),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Running replication engine.
pub struct Replicator {
    registry: Arc<PeerRegistry>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    local_addr: Option<SocketAddr>,
}

impl Replicator {
    /// Bind the listener (if any) and start dialling configured peers.
    ///
    /// Broadcasts go through `registry`, which the caller shares with the
    /// core so local observations reach every attached link.
    pub async fn start(
        settings: ReplicationSettings,
        registry: Arc<PeerRegistry>,
        handler: Arc<dyn ReplicaHandler>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, PeerError> {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let ctx = LinkContext {
            registry: registry.clone(),
            handler,
            events,
            settings: Arc::new(settings.link.clone()),
            cancel: cancel.clone(),
        };

        let mut local_addr = None;
        if let Some(addr) = settings.listen {
            let listener = TcpListener::bind(addr).await?;
            let bound = listener.local_addr()?;
            info!(addr = %bound, node_id = %settings.link.node_id, "replication listening");
            local_addr = Some(bound);

            tracker.spawn(accept_loop(listener, ctx.clone(), tracker.clone()));
        }

        for peer in &settings.peers {
            info!(peer = %peer, "dialling peer");
            tracker.spawn(dial_loop(
                peer.clone(),
                ctx.clone(),
                settings.connect_timeout,
                settings.backoff_min,
                settings.backoff_max,
            ));
        }

        Ok(Self {
            registry,
            cancel,
            tracker,
            local_addr,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Current state of every link.
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.registry.snapshot()
    }

    /// Stop the listener and every link, and wait for all of their tasks.
    ///
    /// Once this returns no link will apply remote entries or send frames.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("replication stopped");
    }
}

async fn accept_loop(listener: TcpListener, ctx: LinkContext, tracker: TaskTracker) {
    loop {
        let accepted = tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                let address = remote.to_string();
                debug!(peer = %address, "accepted peer connection");

                let id = ctx.registry.register(address.clone(), Direction::Inbound);
                ctx.registry.set_state(id, PeerState::Connecting);

                let ctx = ctx.clone();
                tracker.spawn(async move {
                    run_link(&ctx, id, &address, stream).await;
                    ctx.registry.remove(id);
                });
            }
            Err(e) => {
                warn!("failed to accept peer connection: {}", e);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }

    debug!("replication listener shutting down");
}

async fn dial_loop(
    address: String,
    ctx: LinkContext,
    connect_timeout: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
) {
    let id = ctx.registry.register(address.clone(), Direction::Outbound);
    let backoff_min = backoff_min.max(MIN_BACKOFF);
    let mut backoff = backoff_min;

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        ctx.registry.set_state(id, PeerState::Connecting);
        ctx.events.on_peer_status(&PeerStatus {
            address: &address,
            node_id: None,
            state: PeerState::Connecting,
            synced: 0,
            error: None,
        });

        let connect = tokio::time::timeout(connect_timeout, TcpStream::connect(address.as_str()));
        let connected = tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => break,
            connected = connect => connected,
        };

        match connected {
            Ok(Ok(stream)) => {
                let outcome = run_link(&ctx, id, &address, stream).await;
                if outcome.reached_live {
                    // Reset backoff once a link made it to live.
                    backoff = backoff_min;
                }
                match outcome.error {
                    Some(PeerError::SelfConnection) => {
                        warn!(peer = %address, "configured peer is this node, no longer dialling it");
                        break;
                    }
                    Some(err) => debug!(peer = %address, "link ended: {}", err),
                    None => {}
                }
            }
            Ok(Err(e)) => link_failed(&ctx, id, &address, PeerError::Io(e)),
            Err(_) => link_failed(&ctx, id, &address, PeerError::Timeout("connect")),
        }

        tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => break,
            _ = sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(backoff_max);
    }

    ctx.registry.remove(id);
    debug!(peer = %address, "dialler shutting down");
}

fn link_failed(ctx: &LinkContext, id: LinkId, address: &str, error: PeerError) {
    let node_id = ctx.registry.detach(id, Some(&error));
    ctx.events.on_peer_status(&PeerStatus {
        address,
        node_id: node_id.as_deref(),
        state: PeerState::Disconnected,
        synced: 0,
        error: Some(&error),
    });
}
