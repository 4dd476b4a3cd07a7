//! Peer replication wire protocol.
//!
//! Every frame is a 4-byte big-endian body length followed by a JSON object
//! with a `type` tag:
//!
//! ```text
//! {"type":"hello","node_id":"edge-1","version":1}
//! {"type":"full_sync","entries":[{"ip":"1.2.3.4","domain":"x.bad.example","last_seen":1700000000000}],"done":true}
//! {"type":"announce","ip":"1.2.3.4","domain":"x.bad.example","last_seen":1700000000000}
//! {"type":"keepalive"}
//! ```
//!
//! A snapshot larger than one frame is split over several `full_sync`
//! frames; only the last carries `"done":true`. A missing `done` means true.
//!
//! Unknown fields are ignored. A body that does not decode is reported to the
//! caller and skipped; the framing itself stays intact.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::cache::WatchEntry;
use crate::error::{PeerError, ProtocolError};

/// Protocol revision sent in `Hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Size of the length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest accepted frame body.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// Bytes of a `full_sync` body that are not entries, rounded up.
const FULL_SYNC_OVERHEAD: usize = 64;

/// A message exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// First frame on every link, in both directions.
    Hello {
        /// Sender's node id.
        node_id: String,
        /// Sender's protocol revision.
        #[serde(default)]
        version: u32,
    },
    /// Part of the sender's cache, sent after `Hello`.
    FullSync {
        /// Snapshot entries.
        entries: Vec<WatchEntry>,
        /// Whether this is the last part of the snapshot.
        #[serde(default = "default_done")]
        done: bool,
    },
    /// A single locally observed entry.
    Announce(WatchEntry),
    /// Idle-link heartbeat.
    Keepalive,
}

impl PeerMessage {
    /// Short name used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "hello",
            PeerMessage::FullSync { .. } => "full_sync",
            PeerMessage::Announce(_) => "announce",
            PeerMessage::Keepalive => "keepalive",
        }
    }
}

fn default_done() -> bool {
    true
}

/// Split a snapshot into `FullSync` messages whose bodies each fit in
/// `max_size` bytes. Always returns at least one message, and only the last
/// has `done` set.
pub fn full_sync_frames(entries: Vec<WatchEntry>, max_size: usize) -> Vec<PeerMessage> {
    let budget = max_size.saturating_sub(FULL_SYNC_OVERHEAD);
    let mut frames = Vec::new();
    let mut chunk = Vec::new();
    let mut used = 0;

    for entry in entries {
        // One separator per entry.
        let size = match serde_json::to_vec(&entry) {
            Ok(body) => body.len() + 1,
            Err(_) => continue,
        };
        if size > budget {
            warn!(ip = %entry.ip, size, max_size, "entry too large for a sync frame");
            continue;
        }
        if used + size > budget && !chunk.is_empty() {
            frames.push(PeerMessage::FullSync {
                entries: std::mem::take(&mut chunk),
                done: false,
            });
            used = 0;
        }
        chunk.push(entry);
        used += size;
    }

    frames.push(PeerMessage::FullSync {
        entries: chunk,
        done: true,
    });
    frames
}

/// Encode a message into a complete frame.
pub fn encode(msg: &PeerMessage) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(msg)?;
    let size = u32::try_from(body.len()).map_err(|_| ProtocolError::Oversized { size: body.len() })?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&size.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body.
pub fn decode(body: &[u8]) -> Result<PeerMessage, ProtocolError> {
    Ok(serde_json::from_slice(body)?)
}

/// Read one frame body.
///
/// A clean EOF at a frame boundary is reported as [`PeerError::Closed`].
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Vec<u8>, PeerError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    if let Err(e) = reader.read_exact(&mut header).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(PeerError::Closed);
        }
        return Err(e.into());
    }

    let size = u32::from_be_bytes(header) as usize;
    if size > max_size {
        return Err(PeerError::FrameTooLarge {
            size,
            max: max_size,
        });
    }

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Encode and write one message.
pub async fn write_message<W>(writer: &mut W, msg: &PeerMessage) -> Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(msg).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
