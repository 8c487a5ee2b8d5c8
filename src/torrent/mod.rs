//! BitTorrent client internals
//!
//! Everything between a source string and files on disk:
//! - Bencode codec with raw info-dict passthrough
//! - Metainfo and magnet parsing into a `TorrentDescriptor`
//! - Tracker clients (HTTP/HTTPS and UDP, BEP 15)
//! - Peer wire protocol sessions (BEP 3)
//! - Metadata exchange for magnet bootstrap (BEP 9/10)
//! - The download coordinator and piece scheduler

pub mod bencode;
pub mod download;
pub mod magnet;
pub mod metadata;
pub mod metainfo;
pub mod peer;
pub mod tracker;

// Re-export commonly used types
pub use bencode::BencodeValue;
pub use download::Download;
pub use magnet::MagnetUri;
pub use metadata::{fetch_metadata, MetadataMessage, MetadataMessageType, METADATA_PIECE_SIZE};
pub use metainfo::{FileEntry, Sha1Hash, TorrentDescriptor};
pub use peer::{Message, PeerSession, BLOCK_SIZE};
pub use tracker::{generate_peer_id, TrackerClient};
