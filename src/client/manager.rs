//! Connection manager
//!
//! Owns every task belonging to one torrent: the tracker announce loop,
//! the inbound-connection listener, and the peer sessions. A single
//! event loop consumes session and tracker events, keeps the session
//! set bounded, and republishes the shared `TorrentState` after each
//! state-changing event.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::client::state::{TorrentState, TorrentStatus};
use crate::error::TorrentError;
use crate::peer::session::{run_inbound, run_outbound, SessionContext, SessionEvent};
use crate::peer::SessionLimits;
use crate::piece::PieceManager;
use crate::protocol::Handshake;
use crate::storage::FileStorage;
use crate::torrent::TorrentMetadata;
use crate::tracker::{run_announce_loop, TrackerClient, TrackerUpdate, TransferTotals};

/// Engine-level configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Directory verified data lands in
    pub download_dir: PathBuf,
    /// Listening port for incoming connections
    pub port: u16,
    /// Upper bound on concurrent peer sessions
    pub max_connections: usize,
    /// Endgame begins when fewer than this many blocks are unreceived
    pub endgame_threshold: usize,
    /// Per-session tunables
    pub limits: SessionLimits,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            port: 6881,
            max_connections: 50,
            endgame_threshold: 16,
            limits: SessionLimits::default(),
        }
    }
}

/// Grace period for the final `stopped` announce
const STOP_ANNOUNCE_GRACE: Duration = Duration::from_secs(5);

/// Owns and drives all tasks for one torrent
pub struct ConnectionManager {
    metadata: Arc<TorrentMetadata>,
    config: ClientConfig,
    peer_id: [u8; 20],
    state: Arc<RwLock<TorrentState>>,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: Option<JoinHandle<()>>,
    tracker_handle: Option<JoinHandle<()>>,
    listen_addr: Option<SocketAddr>,
}

impl ConnectionManager {
    /// Create a manager for a torrent. Nothing runs until `start`.
    pub fn new(metadata: Arc<TorrentMetadata>, config: ClientConfig) -> Self {
        let state = TorrentState::new(metadata.name.clone(), metadata.piece_count(), metadata.total_length);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            metadata,
            config,
            peer_id: Handshake::generate_peer_id(),
            state: Arc::new(RwLock::new(state)),
            shutdown_tx,
            loop_handle: None,
            tracker_handle: None,
            listen_addr: None,
        }
    }

    /// Change the download directory. Only allowed before `start`.
    pub fn set_download_directory(&mut self, dir: PathBuf) -> Result<()> {
        if self.loop_handle.is_some() {
            return Err(TorrentError::config_error_with_field(
                "Download directory cannot change while the torrent runs",
                "download_dir",
            )
            .into());
        }
        self.config.download_dir = dir;
        Ok(())
    }

    /// Address the listener bound to, once started
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Snapshot of the aggregated torrent state
    pub async fn state(&self) -> TorrentState {
        self.state.read().await.clone()
    }

    /// Allocate storage, start the tracker/listener/event-loop tasks,
    /// and begin trading pieces
    pub async fn start(&mut self) -> Result<()> {
        if self.loop_handle.is_some() {
            return Err(TorrentError::validation_error("Torrent already started").into());
        }
        info!("Starting torrent '{}' ({})", self.metadata.name, self.metadata.info_hash);
        self.shutdown_tx.send_replace(false);

        let mut pieces = PieceManager::new(
            self.metadata.clone(),
            Box::new(FileStorage::new(self.config.download_dir.clone(), self.metadata.clone())),
            self.config.endgame_threshold,
        );
        if let Err(e) = pieces.initialize_storage().await {
            error!("Storage allocation failed: {}", e);
            self.state.write().await.status = TorrentStatus::Failed { reason: e.to_string() };
            return Err(e);
        }
        let pieces = Arc::new(Mutex::new(pieces));

        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await.map_err(|e| {
            TorrentError::network_error_full("Failed to bind listen port", format!("port {}", self.config.port), e.to_string())
        })?;
        self.listen_addr = Some(listener.local_addr()?);

        let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(256);
        let (have_tx, _) = broadcast::channel::<u32>(256);
        let (tracker_tx, tracker_rx) = mpsc::channel::<TrackerUpdate>(16);
        let (incoming_tx, incoming_rx) = mpsc::channel::<(TcpStream, SocketAddr)>(16);
        let (totals_tx, totals_rx) = watch::channel(TransferTotals {
            uploaded: 0,
            downloaded: 0,
            left: self.metadata.total_length,
        });
        let shutdown_rx = self.shutdown_tx.subscribe();

        let tracker = TrackerClient::new(
            &self.metadata.announce,
            self.metadata.info_hash,
            self.peer_id,
            self.listen_addr.map(|a| a.port()).unwrap_or(self.config.port),
        )?;
        self.tracker_handle = Some(tokio::spawn(run_announce_loop(
            tracker,
            totals_rx,
            tracker_tx,
            shutdown_rx.clone(),
        )));

        tokio::spawn(accept_loop(listener, incoming_tx, shutdown_rx.clone()));

        let session_ctx = SessionContext {
            info_hash: self.metadata.info_hash,
            peer_id: self.peer_id,
            num_pieces: self.metadata.piece_count(),
            limits: self.config.limits,
            pieces: pieces.clone(),
            events: events_tx,
            have_tx,
            shutdown: shutdown_rx.clone(),
        };

        let engine = EngineLoop {
            max_connections: self.config.max_connections,
            pieces,
            state: self.state.clone(),
            session_ctx,
            events_rx,
            tracker_rx,
            incoming_rx,
            shutdown_rx,
            totals_tx,
            active: HashSet::new(),
            established: HashSet::new(),
            candidates: VecDeque::new(),
            seeders: None,
            leechers: None,
            tracker_gone: false,
            listener_gone: false,
        };
        self.state.write().await.status = TorrentStatus::Downloading;
        self.loop_handle = Some(tokio::spawn(engine.run()));
        Ok(())
    }

    /// Stop the torrent: cancel the tracker (with a best-effort
    /// `stopped` announce), close every session, and flush storage.
    /// Safe to call more than once.
    pub async fn stop(&mut self) {
        debug!("Stopping torrent '{}'", self.metadata.name);
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.tracker_handle.take() {
            if timeout(STOP_ANNOUNCE_GRACE, handle).await.is_err() {
                debug!("Stopped announce did not finish in time");
            }
        }

        let mut state = self.state.write().await;
        if !state.status.is_terminal() {
            state.status = TorrentStatus::Stopped;
        }
        info!("Torrent '{}' stopped", self.metadata.name);
    }

    /// Wait for the event loop to end (completion does not end it; the
    /// torrent keeps seeding until `stop`)
    pub async fn join(&mut self) {
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.await;
        }
    }
}

/// Accept incoming connections until shutdown
async fn accept_loop(
    listener: TcpListener,
    incoming_tx: mpsc::Sender<(TcpStream, SocketAddr)>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Incoming connection from {}", addr);
                    if incoming_tx.send((stream, addr)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// The single event loop behind one torrent
struct EngineLoop {
    max_connections: usize,
    pieces: Arc<Mutex<PieceManager>>,
    state: Arc<RwLock<TorrentState>>,
    session_ctx: SessionContext,
    events_rx: mpsc::Receiver<SessionEvent>,
    tracker_rx: mpsc::Receiver<TrackerUpdate>,
    incoming_rx: mpsc::Receiver<(TcpStream, SocketAddr)>,
    shutdown_rx: watch::Receiver<bool>,
    totals_tx: watch::Sender<TransferTotals>,
    /// Sessions spawned and not yet Closed (includes connecting ones)
    active: HashSet<SocketAddr>,
    /// Sessions past the handshake
    established: HashSet<SocketAddr>,
    candidates: VecDeque<SocketAddr>,
    seeders: Option<u32>,
    leechers: Option<u32>,
    tracker_gone: bool,
    listener_gone: bool,
}

impl EngineLoop {
    async fn run(mut self) {
        let mut fatal: Option<String> = None;

        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    let Some(event) = event else { break };
                    if let Some(reason) = self.on_session_event(event).await {
                        fatal = Some(reason);
                        break;
                    }
                }
                update = self.tracker_rx.recv(), if !self.tracker_gone => {
                    match update {
                        Some(update) => self.on_tracker_update(update).await,
                        None => self.tracker_gone = true,
                    }
                }
                incoming = self.incoming_rx.recv(), if !self.listener_gone => {
                    match incoming {
                        Some((stream, addr)) => self.on_incoming(stream, addr),
                        None => self.listener_gone = true,
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.teardown(fatal).await;
    }

    /// Returns a reason string when the event is fatal to the torrent
    async fn on_session_event(&mut self, event: SessionEvent) -> Option<String> {
        match event {
            SessionEvent::Established { addr, peer_id } => {
                debug!("Peer {} established ({})", addr, hex::encode(peer_id));
                self.established.insert(addr);
            }
            SessionEvent::PieceVerified { piece } => {
                debug!("Piece {} verified", piece);
                let complete = self.pieces.lock().await.is_complete();
                if complete {
                    info!("Download complete; seeding");
                    self.state.write().await.status = TorrentStatus::Seeding;
                }
            }
            SessionEvent::PieceRejected { piece } => {
                warn!("Piece {} rejected after digest mismatch", piece);
            }
            SessionEvent::Fatal { message } => {
                error!("Fatal torrent error: {}", message);
                return Some(message);
            }
            SessionEvent::Closed { addr } => {
                self.active.remove(&addr);
                self.established.remove(&addr);
                self.dial_candidates();
            }
        }
        self.publish().await;
        None
    }

    async fn on_tracker_update(&mut self, update: TrackerUpdate) {
        self.seeders = update.complete;
        self.leechers = update.incomplete;
        for addr in update.peers {
            if !self.active.contains(&addr) && !self.candidates.contains(&addr) {
                self.candidates.push_back(addr);
            }
        }
        self.dial_candidates();
        self.publish().await;
    }

    fn on_incoming(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.active.len() >= self.max_connections || self.active.contains(&addr) {
            debug!("Rejecting incoming connection from {} (at capacity)", addr);
            return;
        }
        self.active.insert(addr);
        tokio::spawn(run_inbound(stream, addr, self.session_ctx.clone()));
    }

    fn dial_candidates(&mut self) {
        while self.active.len() < self.max_connections {
            let Some(addr) = self.candidates.pop_front() else { break };
            if self.active.contains(&addr) {
                continue;
            }
            self.active.insert(addr);
            tokio::spawn(run_outbound(addr, self.session_ctx.clone()));
        }
    }

    /// Republish the aggregated state and refresh the totals the
    /// tracker reports
    async fn publish(&mut self) {
        let (pieces_complete, downloaded, uploaded, left, failures) = {
            let pieces = self.pieces.lock().await;
            (
                pieces.pieces_complete(),
                pieces.bytes_downloaded(),
                pieces.bytes_uploaded(),
                pieces.bytes_left(),
                pieces.hash_failures(),
            )
        };
        self.totals_tx.send_replace(TransferTotals {
            uploaded,
            downloaded,
            left,
        });

        let mut state = self.state.write().await;
        state.pieces_complete = pieces_complete;
        state.bytes_downloaded = downloaded;
        state.bytes_uploaded = uploaded;
        state.connected_peers = self.established.len();
        state.seeders = self.seeders;
        state.leechers = self.leechers;
        state.hash_failures = failures;
    }

    async fn teardown(mut self, fatal: Option<String>) {
        self.publish().await;

        if let Err(e) = self.pieces.lock().await.flush().await {
            error!("Storage flush failed: {}", e);
            self.state.write().await.status = TorrentStatus::Failed { reason: e.to_string() };
        }
        if let Some(reason) = fatal {
            self.state.write().await.status = TorrentStatus::Failed { reason };
        }
        debug!("Engine loop ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Sha1Digest;
    use crate::piece::BLOCK_LENGTH;
    use crate::protocol::HANDSHAKE_LEN;
    use crate::torrent::metadata::FileInfo;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("swarmdl-manager-{}-{}", tag, std::process::id()))
    }

    fn metadata_for(content: &[u8], piece_length: u64, announce: &str) -> Arc<TorrentMetadata> {
        let hashes: Vec<Sha1Digest> = content.chunks(piece_length as usize).map(Sha1Digest::of).collect();
        Arc::new(
            TorrentMetadata::new(
                announce.to_string(),
                "data.bin".to_string(),
                Sha1Digest::of(content),
                piece_length,
                hashes,
                vec![FileInfo {
                    path: vec!["data.bin".to_string()],
                    length: content.len() as u64,
                }],
                true,
            )
            .unwrap(),
        )
    }

    fn config(dir: PathBuf) -> ClientConfig {
        ClientConfig {
            download_dir: dir,
            port: 0,
            max_connections: 8,
            endgame_threshold: 16,
            limits: SessionLimits::default(),
        }
    }

    /// One-shot HTTP tracker serving a fixed bencoded body
    async fn mini_tracker(body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let mut request = [0u8; 2048];
                    let _ = stream.read(&mut request).await;
                    let header = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = stream.write_all(header.as_bytes()).await;
                    let _ = stream.write_all(&body).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("http://{}/announce", addr)
    }

    #[tokio::test]
    async fn test_start_and_stop_lifecycle() {
        let dir = temp_dir("lifecycle");
        let announce = mini_tracker(b"d8:intervali1800e5:peers0:e".to_vec()).await;
        let content = vec![0x5au8; BLOCK_LENGTH as usize];
        let mut manager = ConnectionManager::new(metadata_for(&content, BLOCK_LENGTH as u64, &announce), config(dir.clone()));

        manager.start().await.unwrap();
        assert!(manager.listen_addr().is_some());
        assert_eq!(manager.state().await.status, TorrentStatus::Downloading);

        // a second start is refused
        assert!(manager.start().await.is_err());

        manager.stop().await;
        assert_eq!(manager.state().await.status, TorrentStatus::Stopped);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_empty_tracker_peer_list_yields_no_sessions() {
        let dir = temp_dir("nopeers");
        let announce = mini_tracker(b"d8:completei3e10:incompletei7e8:intervali1800e5:peers0:e".to_vec()).await;
        let content = vec![0x5au8; BLOCK_LENGTH as usize];
        let mut manager = ConnectionManager::new(metadata_for(&content, BLOCK_LENGTH as u64, &announce), config(dir.clone()));

        manager.start().await.unwrap();

        // give the announce cycle time to land
        let mut state = manager.state().await;
        for _ in 0..50 {
            if state.seeders.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            state = manager.state().await;
        }
        assert_eq!(state.seeders, Some(3));
        assert_eq!(state.leechers, Some(7));
        assert_eq!(state.connected_peers, 0);
        assert_eq!(state.status, TorrentStatus::Downloading);

        manager.stop().await;
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_set_download_directory_rejected_after_start() {
        let dir = temp_dir("setdir");
        let announce = mini_tracker(b"d8:intervali1800e5:peers0:e".to_vec()).await;
        let content = vec![0x5au8; BLOCK_LENGTH as usize];
        let mut manager = ConnectionManager::new(metadata_for(&content, BLOCK_LENGTH as u64, &announce), config(dir.clone()));

        manager.set_download_directory(dir.clone()).unwrap();
        manager.start().await.unwrap();
        assert!(manager.set_download_directory(PathBuf::from("/elsewhere")).is_err());

        manager.stop().await;
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_inbound_seed_completes_download() {
        let dir = temp_dir("inbound-seed");
        let announce = mini_tracker(b"d8:intervali1800e5:peers0:e".to_vec()).await;
        let content: Vec<u8> = (0..BLOCK_LENGTH).map(|i| (i % 249) as u8).collect();
        let metadata = metadata_for(&content, BLOCK_LENGTH as u64, &announce);
        let info_hash = metadata.info_hash;
        let mut manager = ConnectionManager::new(metadata, config(dir.clone()));

        manager.start().await.unwrap();
        let listen_addr = manager.listen_addr().unwrap();
        let connect_addr: SocketAddr = format!("127.0.0.1:{}", listen_addr.port()).parse().unwrap();

        // a scripted seed connects in, advertises the piece, and serves it
        let seed_content = content.clone();
        let seed = tokio::spawn(async move {
            let mut stream = TcpStream::connect(connect_addr).await.unwrap();
            let ours = Handshake::new(info_hash, *b"-XX0000-inboundseed0");
            stream.write_all(&ours.serialize()).await.unwrap();
            let mut theirs = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut theirs).await.unwrap();

            // their empty bitfield
            let mut prefix = [0u8; 4];
            stream.read_exact(&mut prefix).await.unwrap();
            let mut body = vec![0u8; u32::from_be_bytes(prefix) as usize];
            stream.read_exact(&mut body).await.unwrap();
            assert_eq!(body, vec![5u8, 0u8]);

            // bitfield: we have the only piece
            stream.write_all(&[0, 0, 0, 2, 5, 0b1000_0000]).await.unwrap();

            // interested
            stream.read_exact(&mut prefix).await.unwrap();
            let mut body = vec![0u8; u32::from_be_bytes(prefix) as usize];
            stream.read_exact(&mut body).await.unwrap();
            assert_eq!(body, vec![2u8]);

            // unchoke
            stream.write_all(&[0, 0, 0, 1, 1]).await.unwrap();

            // request
            stream.read_exact(&mut prefix).await.unwrap();
            let mut body = vec![0u8; u32::from_be_bytes(prefix) as usize];
            stream.read_exact(&mut body).await.unwrap();
            assert_eq!(body[0], 6);

            // piece
            let mut frame = Vec::new();
            frame.extend_from_slice(&(9 + seed_content.len() as u32).to_be_bytes());
            frame.push(7);
            frame.extend_from_slice(&0u32.to_be_bytes());
            frame.extend_from_slice(&0u32.to_be_bytes());
            frame.extend_from_slice(&seed_content);
            stream.write_all(&frame).await.unwrap();

            // drain until the peer hangs up (have, not-interested)
            let mut scratch = [0u8; 256];
            loop {
                match stream.read(&mut scratch).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        // wait for completion
        let mut state = manager.state().await;
        for _ in 0..100 {
            if state.status == TorrentStatus::Seeding {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            state = manager.state().await;
        }
        assert_eq!(state.status, TorrentStatus::Seeding);
        assert!(state.is_complete());
        assert_eq!(state.bytes_downloaded, content.len() as u64);

        manager.stop().await;
        seed.await.unwrap();

        // verified bytes are on disk
        let on_disk = tokio::fs::read(dir.join("data.bin")).await.unwrap();
        assert_eq!(on_disk, content);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
