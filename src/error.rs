//! Error types for the torrent client
//!
//! Every component reports failures through `TorrentError`, converted into
//! `anyhow::Error` at the call boundary.

use std::fmt;

/// Error type for torrent transfer operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Metainfo decoding errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Wire protocol violations
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Peer session errors
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// File allocation and write errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Tracker announce errors
    TrackerError {
        message: String,
        url: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Broken bookkeeping invariants and rejected values
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

    /// Create a new TrackerError with the announce URL
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

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
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
        let chain = |source: &mut Option<String>| {
            *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
        };
        match &mut self {
            TorrentError::ParseError { source, .. }
            | TorrentError::ProtocolError { source, .. }
            | TorrentError::PeerError { source, .. }
            | TorrentError::StorageError { source, .. }
            | TorrentError::TrackerError { source, .. }
            | TorrentError::NetworkError { source, .. } => chain(source),
            _ => {}
        }
        self
    }
}

fn write_detail(
    f: &mut fmt::Formatter<'_>,
    kind: &str,
    message: &str,
    label: &str,
    detail: &Option<String>,
    source: &Option<String>,
) -> fmt::Result {
    match (detail, source) {
        (Some(d), Some(s)) => write!(f, "{}: {} ({}: {}, source: {})", kind, message, label, d, s),
        (Some(d), None) => write!(f, "{}: {} ({}: {})", kind, message, label, d),
        (None, Some(s)) => write!(f, "{}: {} (source: {})", kind, message, s),
        (None, None) => write!(f, "{}: {}", kind, message),
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::ParseError { message, source } => {
                write_detail(f, "Parse error", message, "", &None, source)
            }
            TorrentError::ProtocolError { message, source } => {
                write_detail(f, "Protocol error", message, "", &None, source)
            }
            TorrentError::PeerError { message, peer, source } => {
                write_detail(f, "Peer error", message, "peer", peer, source)
            }
            TorrentError::StorageError { message, path, source } => {
                write_detail(f, "Storage error", message, "path", path, source)
            }
            TorrentError::TrackerError { message, url, source } => {
                write_detail(f, "Tracker error", message, "url", url, source)
            }
            TorrentError::ConfigError { message, field } => {
                write_detail(f, "Config error", message, "field", field, &None)
            }
            TorrentError::NetworkError { message, address, source } => {
                write_detail(f, "Network error", message, "address", address, source)
            }
            TorrentError::ValidationError { message, field } => {
                write_detail(f, "Validation error", message, "field", field, &None)
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

impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::parse_error_with_source("Failed to decode bencode data", err.to_string())
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::storage_error_full("Failed to decode resume state", "unknown".to_string(), err.to_string())
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TorrentError::network_error("Operation timed out")
    }
}

impl From<reqwest::Error> for TorrentError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string());
        TorrentError::tracker_error_full("HTTP request failed", url, err.to_string())
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
        let err = TorrentError::parse_error_with_source("Invalid torrent file", "bencode error");
        assert_eq!(err.to_string(), "Parse error: Invalid torrent file (source: bencode error)");
    }

    #[test]
    fn test_peer_error_full() {
        let err = TorrentError::peer_error_full("Handshake failed", "127.0.0.1:6881", "info hash mismatch");
        let text = err.to_string();
        assert!(text.starts_with("Peer error: Handshake failed"));
        assert!(text.contains("peer: 127.0.0.1:6881"));
        assert!(text.contains("source: info hash mismatch"));
    }

    #[test]
    fn test_tracker_error_with_url() {
        let err = TorrentError::tracker_error_with_url("Tracker failure", "http://tracker.test/announce");
        assert!(err.to_string().contains("Tracker error"));
        assert!(err.to_string().contains("http://tracker.test/announce"));
    }

    #[test]
    fn test_with_context_chains_sources() {
        let err = TorrentError::storage_error_full("Write failed", "/tmp/a", "disk full")
            .with_context("while saving [0, 16384)");
        assert!(err.to_string().contains("disk full: while saving [0, 16384)"));
    }

    #[test]
    fn test_with_context_ignored_for_config() {
        let err = TorrentError::config_error("bad").with_context("ignored");
        assert_eq!(err.to_string(), "Config error: bad");
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

    #[test]
    fn test_validation_error_with_field() {
        let err = TorrentError::validation_error_with_field("no file owns range", "to_save");
        assert_eq!(err.to_string(), "Validation error: no file owns range (field: to_save)");
    }
}
