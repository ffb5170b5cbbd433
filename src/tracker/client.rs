//! HTTP tracker client
//!
//! Announce requests over HTTP with compact peer lists in the response.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_bencode::value::Value;
use url::Url;
use tracing::{debug, error, trace, warn};

use crate::error::TorrentError;
use crate::peer::PeerAddr;

/// Announce event sent with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::None => None,
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Completed => Some("completed"),
        }
    }
}

/// Tracker announce request
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}

/// Tracker announce response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub peers: Vec<PeerAddr>,
}

/// Source of peer addresses
#[async_trait]
pub trait TrackerClient: Send + Sync {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse>;

    /// Tracker identifier for logging
    fn tracker_url(&self) -> &str;
}

/// HTTP tracker client implementation
pub struct HttpTrackerClient {
    announce_url: String,
    client: reqwest::Client,
}

impl HttpTrackerClient {
    pub fn new(announce_url: impl Into<String>) -> Result<Self> {
        let announce_url = announce_url.into();
        if !Self::supports(&announce_url) {
            return Err(TorrentError::tracker_error_with_url("Unsupported tracker URL", announce_url).into());
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(TorrentError::from)?;
        Ok(Self { announce_url, client })
    }

    /// True for well-formed http and https announce URLs
    pub fn supports(announce_url: &str) -> bool {
        Url::parse(announce_url)
            .map(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
            .unwrap_or(false)
    }

    /// First announce URL this client can talk to, primary tracker first
    pub fn pick_url<'a>(candidates: impl IntoIterator<Item = &'a String>) -> Option<&'a str> {
        candidates
            .into_iter()
            .map(String::as_str)
            .find(|candidate| Self::supports(candidate))
    }

    /// Full announce URL; binary fields are percent-encoded byte by byte
    pub fn request_url(&self, request: &AnnounceRequest) -> String {
        let sep = if self.announce_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.announce_url,
            sep,
            urlencoding::encode_binary(&request.info_hash),
            urlencoding::encode_binary(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );
        if let Some(event) = request.event.as_str() {
            url.push_str("&event=");
            url.push_str(event);
        }
        url
    }
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let url = self.request_url(request);
        debug!("Announcing to {} (event {:?})", self.announce_url, request.event);

        let response = self.client.get(&url).send().await.map_err(|e| {
            error!("Tracker request to {} failed: {}", self.announce_url, e);
            TorrentError::tracker_error_full("Announce failed", self.announce_url.clone(), e.to_string())
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TorrentError::tracker_error_full(
                "Tracker returned an error status",
                self.announce_url.clone(),
                status.to_string(),
            ).into());
        }

        let body = response.bytes().await.map_err(TorrentError::from)?;
        trace!("Tracker response: {} bytes", body.len());
        parse_response(&body).map_err(|e| {
            warn!("Bad tracker response from {}: {}", self.announce_url, e);
            e
        })
    }

    fn tracker_url(&self) -> &str {
        &self.announce_url
    }
}

fn lookup<'a>(dict: &'a HashMap<Vec<u8>, Value>, key: &str) -> Option<&'a Value> {
    dict.get(key.as_bytes())
}

/// Decode a bencoded announce response
pub fn parse_response(body: &[u8]) -> Result<AnnounceResponse> {
    let value: Value = serde_bencode::from_bytes(body).map_err(TorrentError::from)?;
    let Value::Dict(dict) = value else {
        return Err(TorrentError::parse_error("Tracker response is not a dictionary").into());
    };

    if let Some(Value::Bytes(reason)) = lookup(&dict, "failure reason") {
        return Err(TorrentError::tracker_error_with_url(
            String::from_utf8_lossy(reason).into_owned(),
            "response",
        ).into());
    }

    let interval = match lookup(&dict, "interval") {
        Some(Value::Int(secs)) if *secs > 0 => Duration::from_secs(*secs as u64),
        _ => {
            return Err(TorrentError::parse_error("Tracker response has no valid interval").into());
        }
    };

    let peers = match lookup(&dict, "peers") {
        Some(Value::Bytes(compact)) => PeerAddr::parse_compact_list(compact)?,
        Some(Value::List(entries)) => entries.iter().filter_map(peer_from_dict).collect(),
        None => Vec::new(),
        Some(_) => {
            return Err(TorrentError::parse_error("Tracker peers field has an unexpected type").into());
        }
    };

    Ok(AnnounceResponse { interval, peers })
}

/// Non-compact peer entry; IPv6 entries are skipped
fn peer_from_dict(entry: &Value) -> Option<PeerAddr> {
    let Value::Dict(dict) = entry else {
        return None;
    };
    let ip = match lookup(dict, "ip") {
        Some(Value::Bytes(ip)) => std::str::from_utf8(ip).ok()?.parse::<Ipv4Addr>().ok()?,
        _ => return None,
    };
    let port = match lookup(dict, "port") {
        Some(Value::Int(port)) => u16::try_from(*port).ok()?,
        _ => return None,
    };
    Some(PeerAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request(event: AnnounceEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [0x12; 20],
            peer_id: *b"-RC0001-123456789012",
            port: 6881,
            uploaded: 0,
            downloaded: 100,
            left: 200,
            event,
        }
    }

    #[test]
    fn test_request_url() {
        let client = HttpTrackerClient::new("http://tracker.example/announce").unwrap();
        let url = client.request_url(&request(AnnounceEvent::Started));
        assert!(url.starts_with("http://tracker.example/announce?info_hash=%12%12"));
        assert!(url.contains("&peer_id=-RC0001-123456789012"));
        assert!(url.contains("&port=6881&uploaded=0&downloaded=100&left=200&compact=1"));
        assert!(url.ends_with("&event=started"));

        let client = HttpTrackerClient::new("http://tracker.example/announce?key=1").unwrap();
        let url = client.request_url(&request(AnnounceEvent::None));
        assert!(url.contains("?key=1&info_hash="));
        assert!(!url.contains("event="));
    }

    #[test]
    fn test_supported_urls() {
        assert!(HttpTrackerClient::supports("http://tracker.example/announce"));
        assert!(HttpTrackerClient::supports("https://tracker.example:443/announce"));
        assert!(!HttpTrackerClient::supports("udp://tracker.example:1337/announce"));
        assert!(!HttpTrackerClient::supports("not a url"));
        assert!(HttpTrackerClient::new("udp://tracker.example:1337").is_err());

        let urls = vec!["udp://a:1/announce".to_string(), "http://b/announce".to_string()];
        assert_eq!(HttpTrackerClient::pick_url(&urls), Some("http://b/announce"));
    }

    #[test]
    fn test_parse_compact_response() {
        let mut body = b"d8:intervali900e5:peers12:".to_vec();
        body.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x1a, 0xe2]);
        body.push(b'e');

        let response = parse_response(&body).unwrap();
        assert_eq!(response.interval, Duration::from_secs(900));
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[1].to_string(), "10.0.0.2:6882");
    }

    #[test]
    fn test_parse_dictionary_peers() {
        let body = b"d8:intervali60e5:peersld2:ip9:127.0.0.14:porti51413eed2:ip3:::14:porti1eeee";
        let response = parse_response(body).unwrap();
        assert_eq!(response.peers, vec!["127.0.0.1:51413".parse().unwrap()]);
    }

    #[test]
    fn test_parse_failure_reason() {
        let err = parse_response(b"d14:failure reason9:not foundee").unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(parse_response(b"d5:peers0:e").is_err());
        assert!(parse_response(b"garbage").is_err());
    }

    #[tokio::test]
    async fn test_announce_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).into_owned();

            let mut body = b"d8:intervali30e5:peers6:".to_vec();
            body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
            body.push(b'e');
            let reply = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len());
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
            head
        });

        let client = HttpTrackerClient::new(format!("http://{}/announce", addr)).unwrap();
        let response = client.announce(&request(AnnounceEvent::Started)).await.unwrap();
        assert_eq!(response.interval, Duration::from_secs(30));
        assert_eq!(response.peers[0].to_string(), "127.0.0.1:6881");

        let head = server.await.unwrap();
        assert!(head.starts_with("GET /announce?info_hash=%12"));
        assert!(head.contains("event=started"));
    }
}
