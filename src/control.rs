//! Control commands.
//!
//! The supervisor (OS signals in the binary, or a test) sends [`Command`]s
//! over an mpsc channel; [`control_loop`] applies them to the [`Node`].

use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::node::{Node, Stats};
use crate::peer::PeerState;

/// A supervisor request.
#[derive(Debug)]
pub enum Command {
    /// Re-read the watch-list file.
    Reload,
    /// Stop the server.
    Shutdown,
    /// Log current counters, and send them back if a reply channel is given.
    Stats(Option<oneshot::Sender<Stats>>),
}

/// Apply commands until `Shutdown`, the channel closing, or `cancel`.
///
/// Both `Shutdown` and a closed channel cancel `cancel`.
pub async fn control_loop(
    node: Node,
    domains: PathBuf,
    mut commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            command = commands.recv() => command,
        };

        match command {
            Some(Command::Reload) => match node.reload(&domains) {
                Ok(stats) => info!(
                    path = %domains.display(),
                    accepted = stats.accepted,
                    skipped = stats.skipped,
                    "reloaded watch-list"
                ),
                Err(e) => warn!(path = %domains.display(), "watch-list reload failed, keeping previous list: {}", e),
            },
            Some(Command::Stats(reply)) => {
                let stats = node.stats();
                let live = stats
                    .peers
                    .iter()
                    .filter(|p| p.state == PeerState::Live)
                    .count();
                info!(
                    entries = stats.entries,
                    domains = stats.domains,
                    links = stats.peers.len(),
                    live_links = live,
                    "stats"
                );
                for peer in &stats.peers {
                    debug!(
                        peer = %peer.address,
                        node_id = peer.node_id.as_deref().unwrap_or("-"),
                        state = peer.state.as_str(),
                        queued = peer.queued,
                        "peer link"
                    );
                }
                if let Some(reply) = reply {
                    let _ = reply.send(stats);
                }
            }
            Some(Command::Shutdown) => {
                info!("shutdown requested");
                cancel.cancel();
                break;
            }
            None => {
                debug!("command channel closed");
                cancel.cancel();
                break;
            }
        }
    }

    debug!("control loop shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::DomainMatcher;
    use crate::routes::RouteTable;
    use std::io::Write;
    use std::sync::Arc;

    fn node(domains: &[&str]) -> Node {
        Node::builder(
            Arc::new(DomainMatcher::from_domains(domains)),
            Arc::new(RouteTable::new()),
        )
        .build()
    }

    #[tokio::test]
    async fn test_reload_stats_shutdown() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "a.example\nb.example\nc.example").unwrap();

        let node = node(&["a.example"]);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(control_loop(
            node.clone(),
            file.path().to_path_buf(),
            rx,
            cancel.clone(),
        ));

        tx.send(Command::Reload).await.unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Command::Stats(Some(reply_tx))).await.unwrap();
        let stats = reply_rx.await.unwrap();
        assert_eq!(stats.domains, 3);
        assert_eq!(stats.entries, 0);

        tx.send(Command::Shutdown).await.unwrap();
        handle.await.unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_list() {
        let node = node(&["a.example"]);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(control_loop(
            node.clone(),
            PathBuf::from("/nonexistent/domains.txt"),
            rx,
            cancel.clone(),
        ));

        tx.send(Command::Reload).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(node.matcher().is_match("x.a.example"));
        assert!(cancel.is_cancelled());
    }
}
