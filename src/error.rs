//! Typed errors for swarm-dl
//!
//! One enum covers the whole client. The coordinator matches on
//! individual variants to decide between requeueing a piece job,
//! retiring a peer session, or aborting the run, so the conditions it
//! dispatches on are first-class variants rather than stringly-typed
//! kinds. `NotInBitfield` in particular is control flow: it is the
//! only error that is caught and re-dispatched instead of surfaced.

use thiserror::Error;

/// Main error type for the download client
#[derive(Debug, Error)]
pub enum ClientError {
    /// Source string is neither a `.torrent` path nor a magnet link
    #[error("invalid source {0:?}: expected a .torrent path or a magnet link")]
    InvalidSource(String),

    /// Magnet link is missing or malforms a required parameter
    #[error("invalid magnet link: {0}")]
    InvalidMagnet(String),

    /// Info dictionary violates the metainfo shape
    #[error("malformed info dictionary: {0}")]
    MalformedInfo(String),

    /// Bencoded data could not be decoded
    #[error("bencode parse error: {0}")]
    Bencode(String),

    /// Tracker URL scheme we don't speak
    #[error("unsupported tracker scheme {0:?}")]
    UnsupportedScheme(String),

    /// HTTP tracker answered with a non-200 status
    #[error("tracker returned HTTP status {0}")]
    TrackerHttpStatus(u16),

    /// Tracker reported an error (HTTP failure reason or UDP action 3)
    #[error("tracker error: {0}")]
    Tracker(String),

    /// Peer or tracker violated the wire protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer's handshake carried a different info hash
    #[error("peer info hash mismatch")]
    InfoHashMismatch,

    /// Peer advertised no pieces at all
    #[error("peer sent an empty bitfield")]
    EmptyBitfield,

    /// Peer does not have the requested piece; the job is requeued and
    /// the session stays up
    #[error("peer does not have piece {0}")]
    NotInBitfield(u32),

    /// Peer rejected a metadata request (BEP 9 msg_type 2)
    #[error("peer rejected metadata request for piece {0}")]
    MetadataRejected(usize),

    /// A hash check failed: piece, metadata, or per-file checksum
    #[error("integrity check failed for {0}")]
    IntegrityFailure(String),

    /// No peer in the swarm survived the open sequence
    #[error("no reachable peers in swarm")]
    NoPeers,

    /// Every peer failed to deliver the info dictionary
    #[error("metadata unavailable from all peers")]
    MetadataUnavailable,

    /// Network-level failure talking to a tracker or peer
    #[error("network error: {0}")]
    Network(String),

    /// A per-operation deadline elapsed
    #[error("timed out while {0}")]
    Timeout(&'static str),

    /// I/O error (socket or filesystem)
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Create a bencode error
    pub fn bencode(message: impl Into<String>) -> Self {
        Self::Bencode(message.into())
    }

    /// True for the soft per-piece error that requeues the job without
    /// retiring the session
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::NotInBitfield(_))
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout("waiting for tracker response")
        } else if let Some(status) = err.status() {
            Self::TrackerHttpStatus(status.as_u16())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        Self::Network(format!("invalid URL: {}", err))
    }
}
