//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with BitTorrent trackers, including:
//! - Announce requests and responses
//! - Peer parsing (compact and non-compact)
//! - Peer ID generation and URL encoding helpers
//!
//! Used by the client to discover peers for a torrent.
use crate::bencode::{decoder, BencodeValue};
use crate::torrent::file::TorrentFile;
use anyhow::{Context, Ok, Result};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr};

/// Represents a client communicating with a BitTorrent tracker.
#[derive(Debug)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
}

/// Contains the parameters for a tracker announce request.
#[derive(Debug)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: i64,
    pub downloaded: i64,
    pub compact: bool,
    pub left: i64,
}

/// Represents a peer received from the tracker.
#[derive(Debug, Clone)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

/// Contains the parsed response from a tracker.
#[derive(Debug)]
pub struct AnnounceResponse {
    pub interval: i64,
    pub peers: Vec<Peer>,
}

impl Client {
    pub fn new(port: u16) -> Result<Self> {
        Ok(Self {
            peer_id: generate_peer_id()?,
            port,
        })
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Sends an announce request to the tracker to get a list of peers.
    #[tracing::instrument(skip(self, torrent), level = "debug")]
    pub async fn announce(&self, torrent: &TorrentFile) -> Result<AnnounceResponse> {
        let request = AnnounceRequest {
            info_hash: torrent.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: 0,
            downloaded: 0,
            compact: true,
            left: torrent.total_length(),
        };
        // `info_hash` and `peer_id` are raw 20-byte strings, already
        // percent-encoded by `url_encode`. `query_pairs_mut` would
        // form-url-encode them a second time (every `%` becomes `%25`),
        // corrupting the hash the tracker sees - so the query string is
        // built by hand instead for those two fields, with the rest
        // appended as ordinary ASCII key=value pairs.
        let mut url = url::Url::parse(&torrent.announce)?;
        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact={}",
            url_encode(&request.info_hash),
            url_encode(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            request.compact as i32,
        );
        url.set_query(Some(&query));
        tracing::debug!(%url, "making announce request to tracker");
        let response = reqwest::get(url).await?;
        let response_bytes = response.bytes().await?;
        Self::parse_announce_response(&response_bytes)
    }

    /// Parses the response from a BitTorrent tracker announce request.
    ///
    /// Decodes the bencoded response with the crate's own bencode codec
    /// (rather than a `serde`-based deserializer) and extracts the peer
    /// list, handling both the compact form (a single byte string of
    /// 6-byte peer entries) and the dictionary form (a list of
    /// `{ip, port}` dicts).
    fn parse_announce_response(bytes: &[u8]) -> Result<AnnounceResponse> {
        let value = decoder::decode(bytes).context("failed to decode tracker response")?;
        let dict = value
            .as_dict()
            .context("tracker response is not a dictionary")?;

        let interval = dict
            .get(&b"interval".to_vec())
            .and_then(BencodeValue::as_integer)
            .unwrap_or(0);

        let peers = match dict.get(&b"peers".to_vec()) {
            Some(BencodeValue::String(compact)) => parse_compact_peers(compact),
            Some(BencodeValue::List(dicts)) => parse_dict_peers(dicts),
            _ => Vec::new(),
        };

        Ok(AnnounceResponse { interval, peers })
    }
}

fn parse_compact_peers(bytes: &[u8]) -> Vec<Peer> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            Peer {
                ip: IpAddr::V4(ip),
                port,
            }
        })
        .collect()
}

fn parse_dict_peers(dicts: &[BencodeValue]) -> Vec<Peer> {
    dicts
        .iter()
        .filter_map(|entry| {
            let dict = entry.as_dict()?;
            let ip_bytes = dict.get(&b"ip".to_vec())?.as_str()?;
            let ip = std::str::from_utf8(ip_bytes).ok()?.parse::<IpAddr>().ok()?;
            let port = dict.get(&b"port".to_vec())?.as_integer()? as u16;
            Some(Peer { ip, port })
        })
        .collect()
}

/// Generates a unique peer ID for this client.
///
/// Consists of a 9-byte prefix identifying the client ("-RT0001-", RT =
/// Rust Torrent) followed by 11 random bytes to ensure uniqueness.
fn generate_peer_id() -> Result<[u8; 20]> {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RT0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    Ok(peer_id)
}

/// URL-encodes a byte slice according to RFC 3986.
///
/// `info_hash` and `peer_id` are raw (non-UTF8) byte strings, so this
/// percent-encodes every byte outside the unreserved set rather than going
/// through a string-oriented URL-encoding helper.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encode_leaves_unreserved_untouched() {
        assert_eq!(url_encode(b"abcXYZ019-._~"), "abcXYZ019-._~");
    }

    #[test]
    fn url_encode_percent_encodes_other_bytes() {
        assert_eq!(url_encode(&[0x00, 0xff]), "%00%FF");
    }

    #[test]
    fn generated_peer_id_has_expected_prefix_and_length() {
        let id = generate_peer_id().unwrap();
        assert_eq!(id.len(), 20);
        assert_eq!(&id[..8], b"-RT0001-");
    }

    #[test]
    fn parses_compact_peer_list() {
        let response = b"d8:intervali900e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x7f\x00\x00\x02\x1a\xe2e";
        let parsed = Client::parse_announce_response(response).unwrap();
        assert_eq!(parsed.interval, 900);
        assert_eq!(parsed.peers.len(), 2);
        assert_eq!(parsed.peers[0].ip, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(parsed.peers[0].port, 6881);
    }

    #[test]
    fn parses_dictionary_peer_list() {
        let response = b"d8:intervali300e5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let parsed = Client::parse_announce_response(response).unwrap();
        assert_eq!(parsed.interval, 300);
        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(parsed.peers[0].port, 6881);
    }
}
