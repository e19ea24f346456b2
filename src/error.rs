//! Error types for the download engine
//!
//! This module defines the error taxonomy shared by all components:
//! decode errors reject input, integrity errors are recovered internally,
//! protocol violations close a single session, transport errors are retried
//! or close a session, and storage errors are fatal to the torrent.

use std::fmt;

/// Comprehensive error type for torrent operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Malformed bencoding or torrent structure
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Peer wire protocol violations
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Peer connection errors
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Tracker announce errors
    TrackerError {
        message: String,
        url: Option<String>,
        source: Option<String>,
    },

    /// File I/O and storage errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },
}

impl TorrentError {
    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerError
    pub fn peer_error(message: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new PeerError with peer address
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new TrackerError
    pub fn tracker_error(message: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            url: None,
            source: None,
        }
    }

    /// Create a new TrackerError with announce URL
    pub fn tracker_error_with_url(message: impl Into<String>, url: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            url: Some(url.into()),
            source: None,
        }
    }

    /// Create a new TrackerError with URL and source
    pub fn tracker_error_full(message: impl Into<String>, url: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            url: Some(url.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path
    pub fn storage_error_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address
    pub fn network_error_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new ValidationError
    pub fn validation_error(message: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            TorrentError::ParseError { source, .. }
            | TorrentError::ProtocolError { source, .. }
            | TorrentError::PeerError { source, .. }
            | TorrentError::TrackerError { source, .. }
            | TorrentError::StorageError { source, .. }
            | TorrentError::NetworkError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            _ => {}
        }
        self
    }

    /// Whether the error is fatal to the torrent as a whole
    pub fn is_fatal(&self) -> bool {
        matches!(self, TorrentError::StorageError { .. })
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::ParseError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Parse error: {} (source: {})", message, src)
                } else {
                    write!(f, "Parse error: {}", message)
                }
            }
            TorrentError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            TorrentError::PeerError { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Peer error: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Peer error: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Peer error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Peer error: {}", message),
                }
            }
            TorrentError::TrackerError { message, url, source } => {
                match (url, source) {
                    (Some(u), Some(s)) => write!(f, "Tracker error: {} (url: {}, source: {})", message, u, s),
                    (Some(u), None) => write!(f, "Tracker error: {} (url: {})", message, u),
                    (None, Some(s)) => write!(f, "Tracker error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Tracker error: {}", message),
                }
            }
            TorrentError::StorageError { message, path, source } => {
                match (path, source) {
                    (Some(p), Some(s)) => write!(f, "Storage error: {} (path: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                    (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Storage error: {}", message),
                }
            }
            TorrentError::NetworkError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Network error: {}", message),
                }
            }
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            TorrentError::ValidationError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Validation error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Validation error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::storage_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::network_error("Operation timed out")
    }
}

impl From<reqwest::Error> for TorrentError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string());
        TorrentError::tracker_error_full("Announce request failed", url, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error() {
        let err = TorrentError::parse_error("Invalid torrent file");
        assert_eq!(err.to_string(), "Parse error: Invalid torrent file");
    }

    #[test]
    fn test_parse_error_with_source() {
        let err = TorrentError::parse_error_with_source("Invalid torrent file", "bad integer");
        assert!(err.to_string().contains("Parse error"));
        assert!(err.to_string().contains("Invalid torrent file"));
        assert!(err.to_string().contains("bad integer"));
    }

    #[test]
    fn test_peer_error_with_peer() {
        let err = TorrentError::peer_error_with_peer("Connection failed", "127.0.0.1:6881");
        assert!(err.to_string().contains("Peer error"));
        assert!(err.to_string().contains("Connection failed"));
        assert!(err.to_string().contains("127.0.0.1:6881"));
    }

    #[test]
    fn test_tracker_error_with_url() {
        let err = TorrentError::tracker_error_with_url("Announce failed", "http://tracker.example/announce");
        assert!(err.to_string().contains("Tracker error"));
        assert!(err.to_string().contains("http://tracker.example/announce"));
    }

    #[test]
    fn test_storage_error_is_fatal() {
        let err = TorrentError::storage_error_with_path("File not found", "/path/to/file");
        assert!(err.is_fatal());
        assert!(!TorrentError::peer_error("reset").is_fatal());
    }

    #[test]
    fn test_with_context() {
        let err = TorrentError::parse_error("Invalid data").with_context("while parsing torrent");
        assert!(err.to_string().contains("while parsing torrent"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: TorrentError = io_err.into();
        assert!(matches!(err, TorrentError::StorageError { .. }));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let addr_err = "invalid:address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: TorrentError = addr_err.into();
        assert!(matches!(err, TorrentError::NetworkError { .. }));
    }
}
