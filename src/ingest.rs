//! Observation ingest over TCP.
//!
//! Producers (a dnstap decoder, a resolver hook) connect and write one JSON
//! object per line:
//!
//! ```text
//! {"ip":"1.2.3.4","domain":"x.bad.example","ts":1700000000000}
//! {"ip":"fd00::1","domain":"y.bad.example"}
//! ```
//!
//! `ts` is unix milliseconds and defaults to the time the line was read. A
//! line that does not parse is logged and skipped; the connection stays up.
//! A line longer than [`MAX_LINE_LENGTH`] ends the connection.

use futures::StreamExt;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::cache::unix_millis;
use crate::metrics;
use crate::node::Node;

/// Longest accepted ingest line, excluding the newline.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

/// One line of the ingest stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Observation {
    /// Resolved address.
    pub ip: IpAddr,
    /// Queried domain.
    pub domain: String,
    /// Observation time in unix milliseconds.
    #[serde(default)]
    pub ts: Option<u64>,
}

impl Observation {
    /// Observation time, or `now` when the producer sent none.
    pub fn seen(&self, now: SystemTime) -> SystemTime {
        self.ts.map_or(now, unix_millis::from_millis)
    }
}

/// Parse one ingest line.
pub fn parse_line(line: &str) -> Result<Observation, serde_json::Error> {
    serde_json::from_str(line.trim())
}

/// Accept producer connections until `cancel` fires. Connection tasks are
/// spawned on `tracker`.
pub async fn serve(
    listener: TcpListener,
    node: Node,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "ingest listening");
    }

    loop {
        let accepted = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                debug!(%remote, "ingest connection");
                tracker.spawn(read_observations(stream, remote, node.clone(), cancel.clone()));
            }
            Err(e) => {
                warn!("failed to accept ingest connection: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }

    debug!("ingest listener shutting down");
}

/// Feed every line of `reader` into `node`. Returns the number of lines
/// accepted as observations.
pub async fn read_observations<R>(
    reader: R,
    remote: SocketAddr,
    node: Node,
    cancel: CancellationToken,
) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut accepted = 0;

    loop {
        let line = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            line = lines.next() => line,
        };

        let line = match line {
            Some(Ok(line)) => line,
            None => break,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                metrics::record_ingest_malformed();
                warn!(%remote, max = MAX_LINE_LENGTH, "ingest line too long, dropping connection");
                break;
            }
            Some(Err(e)) => {
                debug!(%remote, "ingest connection error: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_line(&line) {
            Ok(obs) => {
                let seen = obs.seen(SystemTime::now());
                node.on_observation(obs.ip, &obs.domain, seen).await;
                accepted += 1;
            }
            Err(e) => {
                metrics::record_ingest_malformed();
                warn!(%remote, "skipping malformed observation: {}", e);
            }
        }
    }

    debug!(%remote, accepted, "ingest connection closed");
    accepted
}
