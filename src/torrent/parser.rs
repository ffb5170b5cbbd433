//! Torrent file parser
//!
//! Decodes .torrent files into [`TorrentMetadata`]. The info hash is taken
//! over the exact bytes of the `info` value as they appear in the file.

use std::collections::BTreeMap;
use std::ops::Range;

use anyhow::Result;
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::torrent::info::{TorrentFile, TorrentMetadata};

/// Nesting limit for lists and dictionaries
const MAX_DEPTH: usize = 64;

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentMetadata> {
        debug!("Parsing torrent file from {} bytes", data.len());

        let mut decoder = Decoder::new(data);
        let root = decoder.parse_value()?;
        if decoder.idx != data.len() {
            return Err(TorrentError::parse_error_with_source(
                "Trailing data after torrent dictionary",
                format!("{} of {} bytes used", decoder.idx, data.len()),
            ).into());
        }
        let info_span = decoder
            .info_span
            .ok_or_else(|| TorrentError::parse_error("Missing info dictionary"))?;

        let metadata = Self::convert(root, &data[info_span])?;
        metadata.validate()?;
        info!("Parsed torrent '{}' ({} files, {} pieces)", metadata.name, metadata.files.len(), metadata.piece_count());
        Ok(metadata)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &std::path::Path) -> Result<TorrentMetadata> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    fn convert(root: BencodeValue, info_bytes: &[u8]) -> Result<TorrentMetadata> {
        let root = root
            .into_dict()
            .ok_or_else(|| TorrentError::parse_error("Root must be a dictionary"))?;

        let announce = get_string(&root, "announce").unwrap_or_default();
        let mut announce_list = Vec::new();
        if !announce.is_empty() {
            announce_list.push(announce.clone());
        }
        if let Some(tiers) = root.get(&b"announce-list"[..]).and_then(|v| v.as_list()) {
            for url in tiers.iter().filter_map(|tier| tier.as_list()).flatten() {
                if let Some(url) = url.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned()) {
                    if !announce_list.contains(&url) {
                        announce_list.push(url);
                    }
                }
            }
        }

        let info = root
            .get(&b"info"[..])
            .and_then(|v| v.as_dict())
            .ok_or_else(|| TorrentError::parse_error("Missing info dictionary"))?;

        let name = get_string(info, "name").ok_or_else(|| TorrentError::parse_error("Missing name field"))?;
        let piece_length = get_length(info, "piece length")?;
        let pieces_bytes = info
            .get(&b"pieces"[..])
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| TorrentError::parse_error("Missing pieces field"))?;
        let pieces = TorrentMetadata::parse_piece_hashes(pieces_bytes)?;

        let files = if info.contains_key(&b"length"[..]) {
            vec![TorrentFile {
                path: vec![name.clone()],
                length: get_length(info, "length")?,
            }]
        } else if let Some(entries) = info.get(&b"files"[..]).and_then(|v| v.as_list()) {
            let mut files = Vec::with_capacity(entries.len());
            for entry in entries {
                let entry = entry
                    .as_dict()
                    .ok_or_else(|| TorrentError::parse_error("File entry must be a dictionary"))?;
                let mut path = vec![name.clone()];
                let components = entry
                    .get(&b"path"[..])
                    .and_then(|v| v.as_list())
                    .ok_or_else(|| TorrentError::parse_error("Missing file path"))?;
                for component in components {
                    let component = component
                        .as_bytes()
                        .ok_or_else(|| TorrentError::parse_error("File path component must be a string"))?;
                    path.push(String::from_utf8_lossy(component).into_owned());
                }
                files.push(TorrentFile { path, length: get_length(entry, "length")? });
            }
            files
        } else {
            return Err(TorrentError::parse_error("Neither length nor files found in info dict").into());
        };

        let info_hash = TorrentMetadata::generate_info_hash(info_bytes);
        trace!("Info hash {}", hex::encode(info_hash));

        Ok(TorrentMetadata {
            announce,
            announce_list,
            info_hash,
            piece_length,
            pieces,
            name,
            files,
        })
    }
}

fn get_string(dict: &BTreeMap<Vec<u8>, BencodeValue>, key: &str) -> Option<String> {
    dict.get(key.as_bytes())
        .and_then(|v| v.as_bytes())
        .map(|b| String::from_utf8_lossy(b).into_owned())
}

fn get_length(dict: &BTreeMap<Vec<u8>, BencodeValue>, key: &str) -> Result<u64> {
    match dict.get(key.as_bytes()).and_then(|v| v.as_int()) {
        Some(value) if value >= 0 => Ok(value as u64),
        Some(value) => Err(TorrentError::parse_error_with_source(format!("Negative {}", key), value.to_string()).into()),
        None => Err(TorrentError::parse_error(format!("Missing {} field", key)).into()),
    }
}

/// Bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
enum BencodeValue {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    fn into_dict(self) -> Option<BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Recursive-descent bencode reader remembering where the root `info` value lies
struct Decoder<'a> {
    data: &'a [u8],
    idx: usize,
    depth: usize,
    info_span: Option<Range<usize>>,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, idx: 0, depth: 0, info_span: None }
    }

    fn error(&self, message: &str) -> anyhow::Error {
        TorrentError::parse_error_with_source(message, format!("at byte {}", self.idx)).into()
    }

    fn peek(&self) -> Result<u8> {
        self.data.get(self.idx).copied().ok_or_else(|| self.error("Unexpected end of data"))
    }

    /// Digits up to `terminator`, consuming the terminator
    fn read_number(&mut self, terminator: u8) -> Result<&'a str> {
        let data: &'a [u8] = self.data;
        let rest = &data[self.idx..];
        let end = rest
            .iter()
            .position(|&b| b == terminator)
            .ok_or_else(|| self.error("Unterminated number"))?;
        let digits = std::str::from_utf8(&rest[..end]).map_err(|_| self.error("Invalid number"))?;
        self.idx += end + 1;
        Ok(digits)
    }

    fn parse_value(&mut self) -> Result<BencodeValue> {
        match self.peek()? {
            b'i' => {
                self.idx += 1;
                let digits = self.read_number(b'e')?;
                let value = digits.parse::<i64>().map_err(|_| self.error("Invalid integer"))?;
                Ok(BencodeValue::Int(value))
            }
            b'l' => {
                self.enter()?;
                let mut list = Vec::new();
                while self.peek()? != b'e' {
                    list.push(self.parse_value()?);
                }
                self.leave();
                Ok(BencodeValue::List(list))
            }
            b'd' => {
                self.enter()?;
                let mut dict = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = match self.parse_value()? {
                        BencodeValue::Bytes(b) => b,
                        _ => return Err(self.error("Dictionary key must be bytes")),
                    };
                    let start = self.idx;
                    let value = self.parse_value()?;
                    if self.depth == 1 && key == b"info" {
                        self.info_span = Some(start..self.idx);
                    }
                    dict.insert(key, value);
                }
                self.leave();
                Ok(BencodeValue::Dict(dict))
            }
            b'0'..=b'9' => {
                let length = self
                    .read_number(b':')?
                    .parse::<usize>()
                    .map_err(|_| self.error("Invalid string length"))?;
                let end = self
                    .idx
                    .checked_add(length)
                    .filter(|end| *end <= self.data.len())
                    .ok_or_else(|| self.error("String runs past end of data"))?;
                let bytes = self.data[self.idx..end].to_vec();
                self.idx = end;
                Ok(BencodeValue::Bytes(bytes))
            }
            other => Err(self.error(&format!("Unknown bencode type: {}", other))),
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("Bencode nesting too deep"));
        }
        self.idx += 1;
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
        self.idx += 1;
    }
}
