//! Peer session
//!
//! One task per peer connection. The session performs the timed
//! handshake, exchanges bitfields, and then multiplexes socket traffic,
//! request timeouts, keep-alives, piece-completion broadcasts, and the
//! shutdown signal. Protocol violations close this session only; a
//! storage failure is reported as fatal before closing.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::{interval, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::digest::Sha1Digest;
use crate::error::TorrentError;
use crate::net::Socket;
use crate::peer::state::{SessionFlags, SessionState};
use crate::piece::{Bitfield, BlockOutcome, BlockRequest, PieceManager};
use crate::protocol::{next_frame, Handshake, Message, HANDSHAKE_LEN};

/// Per-session tunables
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Maximum outstanding block requests toward one peer
    pub request_queue_capacity: usize,
    /// Transport connect deadline
    pub connect_timeout: Duration,
    /// Handshake exchange deadline
    pub handshake_timeout: Duration,
    /// Deadline for an answered block request
    pub request_timeout: Duration,
    /// Idle gap before a keep-alive goes out
    pub keep_alive_interval: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            request_queue_capacity: 8,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(90),
        }
    }
}

/// Notifications a session sends to the connection manager
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Handshake completed and bitfield sent
    Established { addr: SocketAddr, peer_id: [u8; 20] },
    /// A piece assembled through this session verified
    PieceVerified { piece: u32 },
    /// A piece assembled through this session failed its digest
    PieceRejected { piece: u32 },
    /// Verified data could not be persisted; the torrent cannot proceed
    Fatal { message: String },
    /// The session is gone and its bookkeeping released
    Closed { addr: SocketAddr },
}

/// Shared handles a session needs, constructed once by the connection
/// manager and cloned per session
#[derive(Clone)]
pub struct SessionContext {
    pub info_hash: Sha1Digest,
    pub peer_id: [u8; 20],
    pub num_pieces: usize,
    pub limits: SessionLimits,
    pub pieces: Arc<Mutex<PieceManager>>,
    pub events: mpsc::Sender<SessionEvent>,
    pub have_tx: broadcast::Sender<u32>,
    pub shutdown: watch::Receiver<bool>,
}

/// Wire-protocol state machine for one peer connection
pub struct PeerSession {
    addr: SocketAddr,
    socket: Socket,
    ctx: SessionContext,
    state: SessionState,
    flags: SessionFlags,
    remote_peer_id: Option<[u8; 20]>,
    remote_bitfield: Bitfield,
    bitfield_received: bool,
    outstanding: Vec<(BlockRequest, Instant)>,
    have_rx: broadcast::Receiver<u32>,
    last_sent: Instant,
}

/// Connect out to a peer and drive the session to completion.
///
/// Always emits `Closed` when done, whatever the outcome.
pub async fn run_outbound(addr: SocketAddr, ctx: SessionContext) {
    let events = ctx.events.clone();
    let connect_timeout = ctx.limits.connect_timeout;
    let result = async {
        let socket = Socket::connect(addr, connect_timeout).await?;
        PeerSession::new(socket, ctx).run(true).await
    }
    .await;
    finish_session(addr, result, &events).await;
}

/// Drive a session over an accepted incoming connection
pub async fn run_inbound(stream: TcpStream, addr: SocketAddr, ctx: SessionContext) {
    let events = ctx.events.clone();
    let result = async {
        let socket = Socket::from_stream(stream)?;
        PeerSession::new(socket, ctx).run(false).await
    }
    .await;
    finish_session(addr, result, &events).await;
}

async fn finish_session(addr: SocketAddr, result: Result<()>, events: &mpsc::Sender<SessionEvent>) {
    if let Err(e) = result {
        if e.downcast_ref::<TorrentError>().is_some_and(|t| t.is_fatal()) {
            let _ = events.send(SessionEvent::Fatal { message: e.to_string() }).await;
        }
        debug!("Session {} ended: {}", addr, e);
    }
    let _ = events.send(SessionEvent::Closed { addr }).await;
}

impl PeerSession {
    fn new(socket: Socket, ctx: SessionContext) -> Self {
        let addr = socket.peer_addr();
        let have_rx = ctx.have_tx.subscribe();
        let num_pieces = ctx.num_pieces;
        Self {
            addr,
            socket,
            ctx,
            state: SessionState::Connecting,
            flags: SessionFlags::default(),
            remote_peer_id: None,
            remote_bitfield: Bitfield::new(num_pieces),
            bitfield_received: false,
            outstanding: Vec::new(),
            have_rx,
            last_sent: Instant::now(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion, releasing all bookkeeping on the
    /// way out
    async fn run(mut self, initiate: bool) -> Result<()> {
        let result = self.drive(initiate).await;
        self.cleanup().await;
        result
    }

    async fn drive(&mut self, initiate: bool) -> Result<()> {
        self.state = SessionState::Handshaking;
        self.exchange_handshake(initiate).await?;
        self.state = SessionState::Active;

        let bits = {
            let pieces = self.ctx.pieces.lock().await;
            Bytes::copy_from_slice(pieces.bitfield().as_bytes())
        };
        self.send(Message::Bitfield { bits }).await?;

        info!("Session {} active (peer id {})", self.addr, hex::encode(self.remote_peer_id.unwrap_or_default()));
        self.emit(SessionEvent::Established {
            addr: self.addr,
            peer_id: self.remote_peer_id.unwrap_or_default(),
        })
        .await;

        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = self.socket.recv() => {
                    if received? == 0 {
                        debug!("Peer {} closed the connection", self.addr);
                        return Ok(());
                    }
                    while let Some(frame) = next_frame(self.socket.inbound())? {
                        let message = Message::decode(frame)?;
                        self.handle_message(message).await?;
                    }
                }
                _ = tick.tick() => {
                    self.sweep_request_timeouts().await;
                    self.fill_pipeline().await?;
                    if self.last_sent.elapsed() >= self.ctx.limits.keep_alive_interval {
                        self.send(Message::KeepAlive).await?;
                    }
                }
                completed = self.have_rx.recv() => {
                    match completed {
                        Ok(piece) => self.on_piece_completed(piece).await?,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Session {} missed {} have broadcast(s)", self.addr, missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
                changed = self.ctx.shutdown.changed() => {
                    if changed.is_err() || *self.ctx.shutdown.borrow() {
                        debug!("Session {} shutting down", self.addr);
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn exchange_handshake(&mut self, initiate: bool) -> Result<()> {
        let ours = Handshake::new(self.ctx.info_hash, self.ctx.peer_id);
        let deadline = self.ctx.limits.handshake_timeout;

        let theirs = timeout(deadline, async {
            if initiate {
                self.socket.send(&ours.serialize()).await?;
                let bytes = self.socket.recv_exact(HANDSHAKE_LEN).await?;
                Handshake::deserialize(&bytes)
            } else {
                let bytes = self.socket.recv_exact(HANDSHAKE_LEN).await?;
                let theirs = Handshake::deserialize(&bytes)?;
                self.socket.send(&ours.serialize()).await?;
                Ok(theirs)
            }
        })
        .await
        .map_err(|_| TorrentError::peer_error_with_peer("Handshake timed out", self.addr.to_string()))??;

        if !theirs.matches(&self.ctx.info_hash) {
            return Err(TorrentError::protocol_error_with_source(
                "Handshake info-hash mismatch",
                format!("peer {} offered {}", self.addr, theirs.info_hash),
            )
            .into());
        }
        self.remote_peer_id = Some(theirs.peer_id);
        debug!("Handshake with {} complete", self.addr);
        Ok(())
    }

    async fn handle_message(&mut self, message: Message) -> Result<()> {
        trace!("Session {} received {:?}", self.addr, message.id());
        match message {
            Message::KeepAlive => Ok(()),
            Message::Choke => self.on_choke().await,
            Message::Unchoke => {
                self.flags.peer_choking = false;
                self.fill_pipeline().await
            }
            Message::Interested => {
                self.flags.peer_interested = true;
                if self.flags.am_choking {
                    self.flags.am_choking = false;
                    self.send(Message::Unchoke).await?;
                }
                Ok(())
            }
            Message::NotInterested => {
                self.flags.peer_interested = false;
                Ok(())
            }
            Message::Have { piece } => self.on_have(piece).await,
            Message::Bitfield { bits } => self.on_bitfield(&bits).await,
            Message::Request { piece, offset, length } => self.on_request(piece, offset, length).await,
            Message::Piece { piece, offset, block } => self.on_piece(piece, offset, block).await,
            Message::Cancel { piece, offset, length } => {
                // uploads are served inline, so there is no queue to prune
                trace!("Session {} cancel for piece {} offset {} length {}", self.addr, piece, offset, length);
                Ok(())
            }
        }
    }

    /// Remote choked us: every queued request becomes eligible for
    /// reassignment through the timeout path
    async fn on_choke(&mut self) -> Result<()> {
        debug!("Session {} choked by remote", self.addr);
        self.flags.peer_choking = true;
        let dropped = std::mem::take(&mut self.outstanding);
        if !dropped.is_empty() {
            let mut pieces = self.ctx.pieces.lock().await;
            for (request, _) in dropped {
                pieces.on_request_timeout(self.addr, request);
            }
        }
        Ok(())
    }

    async fn on_have(&mut self, piece: u32) -> Result<()> {
        if piece as usize >= self.ctx.num_pieces {
            return Err(TorrentError::protocol_error_with_source(
                "Have for out-of-range piece",
                format!("piece {} from {}", piece, self.addr),
            )
            .into());
        }
        if !self.remote_bitfield.has(piece as usize) {
            self.remote_bitfield.set(piece as usize);
            self.ctx.pieces.lock().await.peer_has(piece);
        }
        self.update_interest().await?;
        self.fill_pipeline().await
    }

    async fn on_bitfield(&mut self, bits: &[u8]) -> Result<()> {
        let replacement = Bitfield::from_bytes(bits, self.ctx.num_pieces)?;
        {
            let mut pieces = self.ctx.pieces.lock().await;
            if self.bitfield_received {
                // wholesale replacement: retire the old advertisement first
                pieces.peer_disconnected(self.addr, &self.remote_bitfield);
            }
            pieces.peer_bitfield(&replacement);
        }
        debug!("Session {} bitfield: {}/{} pieces", self.addr, replacement.count_set(), self.ctx.num_pieces);
        self.remote_bitfield = replacement;
        self.bitfield_received = true;
        self.update_interest().await?;
        self.fill_pipeline().await
    }

    async fn on_request(&mut self, piece: u32, offset: u32, length: u32) -> Result<()> {
        if !self.flags.can_serve() {
            trace!("Session {} ignoring request while choking", self.addr);
            return Ok(());
        }
        let block = {
            let mut pieces = self.ctx.pieces.lock().await;
            pieces.read_block(piece, offset, length).await?
        };
        match block {
            Some(data) => {
                trace!("Session {} serving piece {} offset {} ({} bytes)", self.addr, piece, offset, length);
                self.send(Message::Piece { piece, offset, block: data }).await
            }
            None => {
                trace!("Session {} asked for piece {} we do not have", self.addr, piece);
                Ok(())
            }
        }
    }

    async fn on_piece(&mut self, piece: u32, offset: u32, block: Bytes) -> Result<()> {
        if let Some(slot) = self
            .outstanding
            .iter()
            .position(|(r, _)| r.piece == piece && r.offset == offset && r.length as usize == block.len())
        {
            self.outstanding.remove(slot);
        }

        let outcome = {
            let mut pieces = self.ctx.pieces.lock().await;
            pieces.on_block_received(piece, offset, &block, self.addr).await?
        };
        match outcome {
            BlockOutcome::Verified { piece } => {
                let _ = self.ctx.have_tx.send(piece);
                self.emit(SessionEvent::PieceVerified { piece }).await;
                self.update_interest().await?;
            }
            BlockOutcome::HashMismatch { piece } => {
                self.emit(SessionEvent::PieceRejected { piece }).await;
            }
            BlockOutcome::Accepted | BlockOutcome::Duplicate => {}
        }
        self.fill_pipeline().await
    }

    /// A piece verified somewhere (possibly this session): advertise it
    /// and cancel now-redundant outstanding requests
    async fn on_piece_completed(&mut self, piece: u32) -> Result<()> {
        self.send(Message::Have { piece }).await?;

        let mut keep = Vec::with_capacity(self.outstanding.len());
        let mut redundant = Vec::new();
        for entry in self.outstanding.drain(..) {
            if entry.0.piece == piece {
                redundant.push(entry.0);
            } else {
                keep.push(entry);
            }
        }
        self.outstanding = keep;
        for request in redundant {
            self.send(Message::Cancel {
                piece: request.piece,
                offset: request.offset,
                length: request.length,
            })
            .await?;
        }
        self.update_interest().await
    }

    /// Revert requests that outlived their deadline so other peers can
    /// claim the blocks
    async fn sweep_request_timeouts(&mut self) {
        let deadline = self.ctx.limits.request_timeout;
        let now = Instant::now();
        let mut expired = Vec::new();
        self.outstanding.retain(|(request, issued)| {
            if now.duration_since(*issued) >= deadline {
                expired.push(*request);
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            warn!("Session {}: {} request(s) timed out", self.addr, expired.len());
            let mut pieces = self.ctx.pieces.lock().await;
            for request in expired {
                pieces.on_request_timeout(self.addr, request);
            }
        }
    }

    /// Top up the outstanding-request queue while the remote allows it.
    /// The queue never exceeds its configured capacity.
    async fn fill_pipeline(&mut self) -> Result<()> {
        if !self.flags.can_request() {
            return Ok(());
        }
        while self.outstanding.len() < self.ctx.limits.request_queue_capacity {
            let selected = {
                let mut pieces = self.ctx.pieces.lock().await;
                pieces.select_work(self.addr, &self.remote_bitfield)
            };
            let Some(request) = selected else { break };
            self.send(Message::Request {
                piece: request.piece,
                offset: request.offset,
                length: request.length,
            })
            .await?;
            self.outstanding.push((request, Instant::now()));
        }
        Ok(())
    }

    /// Re-evaluate whether the remote has pieces we still need and keep
    /// the interest flag (and the remote's view of it) in sync
    async fn update_interest(&mut self) -> Result<()> {
        let ours = self.ctx.pieces.lock().await.bitfield();
        let interested =
            (0..self.ctx.num_pieces).any(|i| self.remote_bitfield.has(i) && !ours.has(i));
        if interested != self.flags.am_interested {
            self.flags.am_interested = interested;
            let message = if interested { Message::Interested } else { Message::NotInterested };
            self.send(message).await?;
        }
        Ok(())
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        self.socket.send(&message.encode()).await?;
        self.last_sent = Instant::now();
        Ok(())
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.ctx.events.send(event).await;
    }

    /// Release outstanding requests and availability accounting, then
    /// drop the socket. Safe to call in any state; never double-counts.
    async fn cleanup(&mut self) {
        self.state = SessionState::Closing;
        let outstanding = std::mem::take(&mut self.outstanding);
        {
            let mut pieces = self.ctx.pieces.lock().await;
            for (request, _) in outstanding {
                pieces.on_request_timeout(self.addr, request);
            }
            pieces.peer_disconnected(self.addr, &self.remote_bitfield);
        }
        self.socket.shutdown().await;
        self.state = SessionState::Closed;
        debug!("Session {} closed", self.addr);
    }
}
