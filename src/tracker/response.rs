//! Tracker announce responses
//!
//! Decodes the bencoded announce response: re-announce interval, swarm
//! counts, and the peer list in either compact (6-byte entries) or
//! dictionary form.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Result;

use crate::bencode;
use crate::error::TorrentError;

/// Announce event reported to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Periodic update, no event parameter on the wire
    None,
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    /// Query-string form; empty for periodic announces
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::None => "",
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// Decoded announce response
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds until the next periodic announce
    pub interval: u64,
    /// Seeder count, when the tracker reports it
    pub complete: Option<u32>,
    /// Leecher count, when the tracker reports it
    pub incomplete: Option<u32>,
    /// Candidate peer addresses (may be empty)
    pub peers: Vec<SocketAddr>,
}

impl AnnounceResponse {
    /// Parse a bencoded announce response body.
    ///
    /// A `failure reason` key turns into an error; an empty or missing
    /// peer list does not.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let value = bencode::decode(body)
            .map_err(|e| TorrentError::tracker_error_full("Malformed announce response", "".to_string(), e.to_string()))?;
        let dict = value
            .as_dict()
            .ok_or_else(|| TorrentError::tracker_error("Announce response is not a dictionary"))?;

        if let Some(reason) = dict.get(b"failure reason") {
            let reason = reason.as_str().unwrap_or("unspecified");
            return Err(TorrentError::tracker_error(format!("Tracker refused announce: {}", reason)).into());
        }

        let interval = dict
            .get(b"interval")
            .and_then(|v| v.as_integer())
            .filter(|&i| i > 0)
            .ok_or_else(|| TorrentError::tracker_error("Announce response missing interval"))?
            as u64;

        let complete = dict.get(b"complete").and_then(|v| v.as_integer()).map(|v| v as u32);
        let incomplete = dict.get(b"incomplete").and_then(|v| v.as_integer()).map(|v| v as u32);

        let peers = match dict.get(b"peers") {
            None => Vec::new(),
            Some(value) => {
                if let Some(blob) = value.as_bytes() {
                    parse_compact_peers(blob)?
                } else if let Some(list) = value.as_list() {
                    parse_peer_dicts(list)
                } else {
                    return Err(TorrentError::tracker_error("Peer list has unknown form").into());
                }
            }
        };

        Ok(Self {
            interval,
            complete,
            incomplete,
            peers,
        })
    }
}

/// Parse the compact peer form: consecutive 6-byte entries of IPv4
/// address and big-endian port
fn parse_compact_peers(blob: &[u8]) -> Result<Vec<SocketAddr>> {
    if blob.len() % 6 != 0 {
        return Err(TorrentError::tracker_error_full(
            "Compact peer blob has invalid length",
            "".to_string(),
            format!("{} bytes", blob.len()),
        )
        .into());
    }
    Ok(blob
        .chunks_exact(6)
        .map(|entry| {
            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = u16::from_be_bytes([entry[4], entry[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}

/// Parse the dictionary peer form; entries with missing or unparsable
/// fields are skipped rather than failing the whole response
fn parse_peer_dicts(list: &[bencode::Value]) -> Vec<SocketAddr> {
    list.iter()
        .filter_map(|entry| {
            let dict = entry.as_dict()?;
            let ip: IpAddr = dict.get(b"ip")?.as_str()?.parse().ok()?;
            let port = dict.get(b"port")?.as_integer().filter(|&p| (1..=u16::MAX as i64).contains(&p))?;
            Some(SocketAddr::new(ip, port as u16))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_response() {
        // two compact peers: 1.2.3.4:6881 and 5.6.7.8:6882
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers12:");
        body.extend_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x1a, 0xe1]);
        body.extend_from_slice(&[0x05, 0x06, 0x07, 0x08, 0x1a, 0xe2]);
        body.extend_from_slice(b"e");

        let response = AnnounceResponse::parse(&body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0], "1.2.3.4:6881".parse().unwrap());
        assert_eq!(response.peers[1], "5.6.7.8:6882".parse().unwrap());
    }

    #[test]
    fn test_parse_dictionary_peers() {
        let body = b"d8:intervali900e5:peersld2:ip7:1.2.3.44:porti6881eed2:ip3:bad4:porti1eeee";
        let response = AnnounceResponse::parse(body).unwrap();
        assert_eq!(response.interval, 900);
        // the unparsable entry is skipped
        assert_eq!(response.peers, vec!["1.2.3.4:6881".parse().unwrap()]);
    }

    #[test]
    fn test_empty_peer_list_is_not_an_error() {
        let response = AnnounceResponse::parse(b"d8:intervali1800e5:peers0:e").unwrap();
        assert!(response.peers.is_empty());

        let response = AnnounceResponse::parse(b"d8:intervali1800e5:peerslee").unwrap();
        assert!(response.peers.is_empty());
    }

    #[test]
    fn test_swarm_counts() {
        let body = b"d8:completei5e10:incompletei12e8:intervali1800e5:peers0:e";
        let response = AnnounceResponse::parse(body).unwrap();
        assert_eq!(response.complete, Some(5));
        assert_eq!(response.incomplete, Some(12));
    }

    #[test]
    fn test_failure_reason_is_an_error() {
        let result = AnnounceResponse::parse(b"d14:failure reason12:not in swarme");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("not in swarm"));
    }

    #[test]
    fn test_missing_interval_is_an_error() {
        assert!(AnnounceResponse::parse(b"d5:peers0:e").is_err());
    }

    #[test]
    fn test_ragged_compact_blob_is_an_error() {
        assert!(AnnounceResponse::parse(b"d8:intervali1800e5:peers5:abcdee").is_err());
    }

    #[test]
    fn test_event_strings() {
        assert_eq!(AnnounceEvent::None.as_str(), "");
        assert_eq!(AnnounceEvent::Started.as_str(), "started");
        assert_eq!(AnnounceEvent::Stopped.as_str(), "stopped");
        assert_eq!(AnnounceEvent::Completed.as_str(), "completed");
    }
}
