//! # swarm-dl
//!
//! A single-session BitTorrent download client.
//!
//! Given a `.torrent` file or a magnet link, swarm-dl contacts the
//! torrent's trackers (HTTP/HTTPS and UDP), connects to the peer swarm
//! over the peer wire protocol, fetches the info dictionary from peers
//! when starting from a magnet link (BEP 9/10), and downloads all
//! pieces concurrently across the swarm with per-piece SHA-1
//! verification before writing the payload to disk.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use swarm_dl::{ClientConfig, Download};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let download = Download::new("ubuntu.torrent", ClientConfig::default()).await?;
//!     download.run("./downloads").await?;
//!     Ok(())
//! }
//! ```
//!
//! Out of scope: DHT, PEX, seeding, endgame mode, and resume. A
//! download either completes in one run or fails.

// Modules
pub mod config;
pub mod error;
pub mod torrent;

// Re-exports for convenience
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use torrent::{
    generate_peer_id, Download, FileEntry, MagnetUri, Message, PeerSession, TorrentDescriptor,
    BLOCK_SIZE,
};
