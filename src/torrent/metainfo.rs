//! Torrent descriptors
//!
//! `TorrentDescriptor` is the immutable plan for a download: where to
//! find the swarm (tracker URLs), what identifies the torrent (info
//! hash), and what to fetch (piece table and file layout). A
//! descriptor loaded from a `.torrent` file is complete immediately; a
//! descriptor from a magnet link starts with only the info hash and
//! trackers, and is completed later by `append_info` once a peer has
//! delivered the info dictionary (BEP 9).

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use super::bencode::{find_info_dict_bytes, BencodeValue};
use super::magnet::MagnetUri;
use crate::error::{ClientError, Result};

/// SHA-1 hash (20 bytes)
pub type Sha1Hash = [u8; 20];

/// The parsed plan for a download
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    /// Tracker URLs (http/https/udp), in announce order
    pub tracker_urls: Vec<String>,
    /// SHA-1 of the raw bencoded info dictionary
    pub info_hash: Sha1Hash,
    /// One SHA-1 per piece; empty until the info dict is appended
    pub piece_hashes: Vec<Sha1Hash>,
    /// Bytes per piece (the last piece may be shorter)
    pub piece_length: usize,
    /// Output files in torrent order
    pub files: Vec<FileEntry>,
    /// Sum of all file lengths
    pub total_length: usize,
    /// Display name hint (`dn` parameter or info `name`)
    pub display_name: Option<String>,
}

/// One output file of the torrent
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the output directory
    pub path: PathBuf,
    /// File size in bytes
    pub length: usize,
    /// Optional raw SHA-1 digest of the file contents
    pub sha1: Option<Vec<u8>>,
    /// Optional raw MD5 digest of the file contents
    pub md5: Option<Vec<u8>>,
}

impl TorrentDescriptor {
    /// Load a descriptor from a source string.
    ///
    /// A trailing `.torrent` selects metainfo-file parsing; a
    /// `magnet:` prefix selects magnet parsing. Anything else is an
    /// `InvalidSource` error.
    pub fn load(source: &str) -> Result<Self> {
        if source.ends_with(".torrent") {
            let data = std::fs::read(source)?;
            Self::parse_file(&data)
        } else if source.starts_with("magnet:") {
            Ok(Self::from_magnet(MagnetUri::parse(source)?))
        } else {
            Err(ClientError::InvalidSource(source.to_string()))
        }
    }

    /// Parse the contents of a `.torrent` file.
    pub fn parse_file(data: &[u8]) -> Result<Self> {
        let root = BencodeValue::parse_exact(data)?;
        let dict = root
            .as_dict()
            .ok_or_else(|| ClientError::MalformedInfo("metainfo root is not a dict".into()))?;

        // BEP 12: a present announce-list supersedes announce
        let mut tracker_urls: Vec<String> = dict
            .get(b"announce-list".as_slice())
            .and_then(|v| v.as_list())
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| tier.as_list())
                    .flatten()
                    .filter_map(|url| url.as_string().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        if tracker_urls.is_empty() {
            if let Some(announce) = dict.get(b"announce".as_slice()).and_then(|v| v.as_string()) {
                tracker_urls.push(announce.to_string());
            }
        }

        let raw_info = find_info_dict_bytes(data)?;

        let mut descriptor = TorrentDescriptor {
            tracker_urls,
            info_hash: [0u8; 20],
            piece_hashes: Vec::new(),
            piece_length: 0,
            files: Vec::new(),
            total_length: 0,
            display_name: None,
        };
        descriptor.append_info(raw_info)?;

        Ok(descriptor)
    }

    /// Build a skeletal descriptor from a parsed magnet link.
    ///
    /// The piece table and file list stay empty until `append_info`
    /// runs with metadata fetched from a peer.
    pub fn from_magnet(magnet: MagnetUri) -> Self {
        TorrentDescriptor {
            tracker_urls: magnet.trackers,
            info_hash: magnet.info_hash,
            piece_hashes: Vec::new(),
            piece_length: 0,
            files: Vec::new(),
            total_length: 0,
            display_name: magnet.display_name,
        }
    }

    /// True when the piece table is still missing (magnet before
    /// metadata bootstrap).
    pub fn needs_info(&self) -> bool {
        self.piece_hashes.is_empty()
    }

    /// Decode a raw info dictionary into the descriptor.
    ///
    /// When the info hash is already known (magnet bootstrap) the
    /// SHA-1 of `raw` must match it; otherwise the hash is computed
    /// here. Identical input can be appended any number of times, the
    /// fields are recomputed rather than accumulated.
    pub fn append_info(&mut self, raw: &[u8]) -> Result<()> {
        let hash: Sha1Hash = Sha1::digest(raw).into();
        if self.info_hash == [0u8; 20] {
            self.info_hash = hash;
        } else if self.info_hash != hash {
            return Err(ClientError::IntegrityFailure(
                "info dictionary hash".into(),
            ));
        }

        let info = BencodeValue::parse_exact(raw)?;
        let dict = info
            .as_dict()
            .ok_or_else(|| ClientError::MalformedInfo("info is not a dict".into()))?;

        let name = dict
            .get(b"name".as_slice())
            .and_then(|v| v.as_string())
            .ok_or_else(|| ClientError::MalformedInfo("missing 'name'".into()))?
            .to_string();

        let piece_length = dict
            .get(b"piece length".as_slice())
            .and_then(|v| v.as_uint())
            .ok_or_else(|| ClientError::MalformedInfo("missing 'piece length'".into()))?
            as usize;
        if piece_length == 0 {
            return Err(ClientError::MalformedInfo(
                "'piece length' must be positive".into(),
            ));
        }

        let pieces = dict
            .get(b"pieces".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| ClientError::MalformedInfo("missing 'pieces'".into()))?;
        if pieces.len() % 20 != 0 {
            return Err(ClientError::MalformedInfo(format!(
                "'pieces' length {} is not a multiple of 20",
                pieces.len()
            )));
        }
        let piece_hashes: Vec<Sha1Hash> = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut h = [0u8; 20];
                h.copy_from_slice(chunk);
                h
            })
            .collect();

        let length = dict.get(b"length".as_slice());
        let file_list = dict.get(b"files".as_slice());

        let files = match (length, file_list) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(ClientError::MalformedInfo(
                    "exactly one of 'length' or 'files' must be present".into(),
                ))
            }
            (Some(length), None) => {
                let length = length.as_uint().ok_or_else(|| {
                    ClientError::MalformedInfo("'length' is not an integer".into())
                })? as usize;
                vec![FileEntry {
                    path: PathBuf::from(&name),
                    length,
                    sha1: dict
                        .get(b"sha1".as_slice())
                        .and_then(|v| v.as_bytes())
                        .map(<[u8]>::to_vec),
                    md5: dict
                        .get(b"md5sum".as_slice())
                        .and_then(|v| v.as_bytes())
                        .map(<[u8]>::to_vec),
                }]
            }
            (None, Some(file_list)) => {
                let entries = file_list.as_list().ok_or_else(|| {
                    ClientError::MalformedInfo("'files' is not a list".into())
                })?;
                if entries.is_empty() {
                    return Err(ClientError::MalformedInfo("'files' is empty".into()));
                }

                let mut files = Vec::with_capacity(entries.len());
                for entry in entries {
                    files.push(Self::parse_file_entry(entry, &name)?);
                }
                files
            }
        };

        let total_length: usize = files.iter().map(|f| f.length).sum();

        // a sane piece table covers the payload exactly; tolerate the
        // mismatch (some generators are sloppy) but leave a trace
        let expected_pieces = total_length.div_ceil(piece_length);
        if piece_hashes.len() != expected_pieces {
            tracing::warn!(
                "unusual piece table: {} hashes for {} bytes with {}-byte pieces (expected {})",
                piece_hashes.len(),
                total_length,
                piece_length,
                expected_pieces
            );
        }

        self.piece_hashes = piece_hashes;
        self.piece_length = piece_length;
        self.files = files;
        self.total_length = total_length;
        if self.display_name.is_none() {
            self.display_name = Some(name);
        }

        Ok(())
    }

    fn parse_file_entry(entry: &BencodeValue, name: &str) -> Result<FileEntry> {
        let entry = entry
            .as_dict()
            .ok_or_else(|| ClientError::MalformedInfo("file entry is not a dict".into()))?;

        let length = entry
            .get(b"length".as_slice())
            .and_then(|v| v.as_uint())
            .ok_or_else(|| ClientError::MalformedInfo("file entry missing 'length'".into()))?
            as usize;

        let components = entry
            .get(b"path".as_slice())
            .and_then(|v| v.as_list())
            .ok_or_else(|| ClientError::MalformedInfo("file entry missing 'path'".into()))?;

        let mut path = PathBuf::from(name);
        for component in components {
            let component = component.as_string().ok_or_else(|| {
                ClientError::MalformedInfo("path component is not a string".into())
            })?;
            path.push(component);
        }

        Ok(FileEntry {
            path,
            length,
            sha1: entry
                .get(b"sha1".as_slice())
                .and_then(|v| v.as_bytes())
                .map(<[u8]>::to_vec),
            md5: entry
                .get(b"md5".as_slice())
                .and_then(|v| v.as_bytes())
                .map(<[u8]>::to_vec),
        })
    }

    /// Length of the piece at `index`; only the last piece may be
    /// short.
    pub fn piece_len(&self, index: usize) -> usize {
        if index + 1 == self.piece_hashes.len() {
            self.total_length - self.piece_length * (self.piece_hashes.len() - 1)
        } else {
            self.piece_length
        }
    }

    /// Info hash as lowercase hex, for logging.
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
