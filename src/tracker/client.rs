//! Tracker announce client
//!
//! Builds announce URLs, issues them over HTTP, and runs the periodic
//! announce loop with capped exponential backoff on failure. The loop
//! keeps the engine supplied with candidate peers; a failing tracker
//! never stops a torrent that already has connections.

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};
use url::Url;

use crate::digest::Sha1Digest;
use crate::error::TorrentError;
use crate::tracker::response::{AnnounceEvent, AnnounceResponse};

/// Timeout for a single announce request
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// First retry delay after a failed announce
const BACKOFF_INITIAL: Duration = Duration::from_secs(15);

/// Retry delays stop growing here
const BACKOFF_MAX: Duration = Duration::from_secs(900);

/// Floor for tracker-supplied announce intervals
const MIN_INTERVAL: Duration = Duration::from_secs(30);

/// Transfer totals reported with every announce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferTotals {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Peers and swarm counts produced by a successful announce
#[derive(Debug, Clone)]
pub struct TrackerUpdate {
    pub peers: Vec<std::net::SocketAddr>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
}

/// HTTP announce client for one torrent
pub struct TrackerClient {
    http: reqwest::Client,
    announce_url: String,
    info_hash: Sha1Digest,
    peer_id: [u8; 20],
    port: u16,
}

impl TrackerClient {
    /// Create a client for the given announce URL
    pub fn new(announce_url: &str, info_hash: Sha1Digest, peer_id: [u8; 20], port: u16) -> Result<Self> {
        let parsed = Url::parse(announce_url)
            .map_err(|e| TorrentError::tracker_error_full("Invalid announce URL", announce_url.to_string(), e.to_string()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(TorrentError::tracker_error_with_url(
                format!("Unsupported announce scheme '{}'", parsed.scheme()),
                announce_url.to_string(),
            )
            .into());
        }

        let http = reqwest::Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()
            .map_err(|e| TorrentError::tracker_error_full("Failed to build HTTP client", announce_url.to_string(), e.to_string()))?;

        Ok(Self {
            http,
            announce_url: announce_url.to_string(),
            info_hash,
            peer_id,
            port,
        })
    }

    /// Issue one announce and decode the response
    pub async fn announce(&self, totals: TransferTotals, event: AnnounceEvent) -> Result<AnnounceResponse> {
        let url = self.build_url(totals, event);
        debug!("Announcing to {} (event: {:?})", self.announce_url, event);

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TorrentError::tracker_error_full(
                "Tracker returned HTTP error",
                self.announce_url.clone(),
                status.to_string(),
            )
            .into());
        }

        let body = response.bytes().await?;
        AnnounceResponse::parse(&body)
    }

    fn build_url(&self, totals: TransferTotals, event: AnnounceEvent) -> String {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.announce_url,
            percent_encode(self.info_hash.as_bytes()),
            percent_encode(&self.peer_id),
            self.port,
            totals.uploaded,
            totals.downloaded,
            totals.left,
        );
        let event_str = event.as_str();
        if !event_str.is_empty() {
            url.push_str("&event=");
            url.push_str(event_str);
        }
        url
    }
}

/// Percent-encode raw bytes for a query parameter. The 20-byte
/// info-hash and peer-id are binary, so this cannot go through a
/// str-based encoder.
fn percent_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~' {
                (b as char).to_string()
            } else {
                format!("%{:02X}", b)
            }
        })
        .collect()
}

/// Drive the periodic announce cycle until shutdown.
///
/// Successful announces forward a `TrackerUpdate` and sleep for the
/// tracker's interval; failures back off exponentially up to a cap. A
/// `completed` event fires when the remaining byte count first reaches
/// zero, and a best-effort `stopped` announce goes out on shutdown.
pub async fn run_announce_loop(
    client: TrackerClient,
    mut totals_rx: watch::Receiver<TransferTotals>,
    updates_tx: mpsc::Sender<TrackerUpdate>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut event = AnnounceEvent::Started;
    let mut backoff = BACKOFF_INITIAL;
    let mut was_incomplete = totals_rx.borrow().left > 0;

    loop {
        let totals = *totals_rx.borrow_and_update();
        if was_incomplete && totals.left == 0 {
            event = AnnounceEvent::Completed;
            was_incomplete = false;
        }

        let delay = match client.announce(totals, event).await {
            Ok(response) => {
                info!(
                    "Announce ok: {} peer(s), interval {}s, seeders {:?}, leechers {:?}",
                    response.peers.len(),
                    response.interval,
                    response.complete,
                    response.incomplete
                );
                backoff = BACKOFF_INITIAL;
                event = AnnounceEvent::None;

                let update = TrackerUpdate {
                    peers: response.peers,
                    complete: response.complete,
                    incomplete: response.incomplete,
                };
                if updates_tx.send(update).await.is_err() {
                    // engine is gone; nothing left to announce for
                    break;
                }
                Duration::from_secs(response.interval).max(MIN_INTERVAL)
            }
            Err(e) => {
                warn!("Announce failed, retrying in {:?}: {}", backoff, e);
                let delay = backoff;
                backoff = (backoff * 2).min(BACKOFF_MAX);
                delay
            }
        };

        tokio::select! {
            _ = sleep(delay) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // best-effort stopped announce; failure is only logged
    let totals = *totals_rx.borrow();
    if let Err(e) = client.announce(totals, AnnounceEvent::Stopped).await {
        debug!("Stopped announce failed: {}", e);
    }
}
