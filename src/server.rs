//! Server setup and lifecycle management.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{Config, RouteMode};
use crate::control::{self, Command};
use crate::error::Error;
use crate::events::{EventSink, TracingSink};
use crate::ingest;
use crate::matcher::DomainMatcher;
use crate::node::Node;
use crate::replication::Replicator;
use crate::routes::{CommandRouteController, RouteController, RouteTable};
use crate::store::{DurableStore, SledStore};

/// Interval for emitting state metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically emit state metrics.
async fn metrics_loop(node: Node, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                node.emit_metrics();
                let stats = node.stats();
                debug!(
                    entries = stats.entries,
                    domains = stats.domains,
                    live_peers = node.peers().live_count(),
                    "emitted state metrics"
                );
            }
            _ = cancel.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// A fully wired dnsroute instance.
pub struct Server {
    config: Config,
    node: Node,
    events: Arc<dyn EventSink>,
}

impl Server {
    /// Build every component from `config`.
    ///
    /// Fails if the configuration is invalid, the watch-list cannot be read,
    /// or the store cannot be opened.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let matcher = Arc::new(DomainMatcher::new());
        let stats = matcher.load_file(&config.domains)?;
        info!(
            path = %config.domains.display(),
            accepted = stats.accepted,
            skipped = stats.skipped,
            "loaded watch-list"
        );

        let routes: Arc<dyn RouteController> = match config.routes.mode {
            RouteMode::Table => Arc::new(RouteTable::new()),
            RouteMode::Command => Arc::new(CommandRouteController::new(
                config.routes.announce.clone(),
                config.routes.withdraw.clone(),
                Duration::from_secs(config.routes.timeout),
            )),
        };

        let events: Arc<dyn EventSink> = Arc::new(TracingSink);
        let mut builder = Node::builder(matcher, routes)
            .events(events.clone())
            .options(config.node_options());

        if let Some(path) = &config.cache.path {
            let store: Arc<dyn DurableStore> = Arc::new(SledStore::open(path)?);
            builder = builder.store(store);
        }

        Ok(Self {
            node: builder.build(),
            config,
            events,
        })
    }

    /// The core this server drives.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Run until `cancel` fires or a [`Command::Shutdown`] arrives.
    ///
    /// Shutdown stops replication first, then the local tasks, then closes
    /// the node. No route or store call is made after this returns.
    pub async fn run(
        self,
        commands: mpsc::Receiver<Command>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        let node = self.node;

        // Everything that can fail at startup happens before any task runs.
        let ingest = match self.config.ingest.listen {
            Some(addr) => match TcpListener::bind(addr).await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    error!(%addr, "unable to bind ingest listener: {}", e);
                    node.close().await;
                    return Err(e.into());
                }
            },
            None => None,
        };

        if let Err(e) = node.restore().await {
            warn!("unable to restore cache from store: {}", e);
        }

        let settings = self.config.replication.settings();
        let node_id = settings.link.node_id.clone();
        let replicator = match Replicator::start(
            settings,
            node.peers().clone(),
            Arc::new(node.clone()),
            self.events,
        )
        .await
        {
            Ok(replicator) => replicator,
            Err(e) => {
                error!("unable to start replication: {}", e);
                node.close().await;
                return Err(e.into());
            }
        };

        let tracker = TaskTracker::new();

        if let Some(listener) = ingest {
            tracker.spawn(ingest::serve(
                listener,
                node.clone(),
                cancel.clone(),
                tracker.clone(),
            ));
        }

        tracker.spawn(node.clone().run_sweeper(self.config.sweep_interval(), cancel.clone()));
        tracker.spawn(metrics_loop(node.clone(), cancel.clone()));
        tracker.spawn(control::control_loop(
            node.clone(),
            self.config.domains.clone(),
            commands,
            cancel.clone(),
        ));

        node.emit_metrics();
        info!(
            node_id = %node_id,
            entries = node.cache().count(),
            domains = node.matcher().count(),
            "dnsroute ready"
        );

        cancel.cancelled().await;
        info!("shutting down");

        replicator.close().await;
        tracker.close();
        tracker.wait().await;
        node.close().await;

        info!("dnsroute stopped");
        Ok(())
    }
}
