//! Peer session state
//!
//! The lifecycle states a session moves through, and the choke/interest
//! flag pairs that gate transfers while a session is Active.

/// Lifecycle of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport connect in progress
    Connecting,
    /// Handshake sent or awaited
    Handshaking,
    /// Exchanging wire messages
    Active,
    /// Tearing down; outstanding requests being released
    Closing,
    /// Socket released
    Closed,
}

impl SessionState {
    /// Whether wire messages may be exchanged
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    /// Whether the session has finished
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

/// Choke and interest flags for one session.
///
/// Protocol defaults: both sides start choked and uninterested.
#[derive(Debug, Clone, Copy)]
pub struct SessionFlags {
    /// We are choking the remote
    pub am_choking: bool,
    /// We want pieces the remote has
    pub am_interested: bool,
    /// The remote is choking us
    pub peer_choking: bool,
    /// The remote wants pieces we have
    pub peer_interested: bool,
}

impl Default for SessionFlags {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

impl SessionFlags {
    /// Whether we may issue requests right now
    pub fn can_request(&self) -> bool {
        self.am_interested && !self.peer_choking
    }

    /// Whether we should answer the remote's requests
    pub fn can_serve(&self) -> bool {
        !self.am_choking
    }
}
