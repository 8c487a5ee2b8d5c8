//! Client configuration
//!
//! All protocol deadlines live here. Every blocking operation on a
//! peer or tracker socket runs under one of these timeouts; an elapsed
//! deadline is treated exactly like a read error on the same socket.

use std::time::Duration;

/// Configuration for a download session
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Port reported to trackers in announce requests
    pub port: u16,

    /// Timeout for the initial TCP dial to a peer
    pub dial_timeout: Duration,

    /// Deadline for the 68-byte handshake exchange
    pub handshake_timeout: Duration,

    /// Deadline for each post-handshake open step (extended handshake,
    /// bitfield, unchoke/interested)
    pub open_step_timeout: Duration,

    /// Overall budget for waiting on a DHT `port` message
    pub port_wait_timeout: Duration,

    /// Deadline for one full `get_piece` operation
    pub piece_timeout: Duration,

    /// Per-message read deadline during metadata fetch
    pub metadata_read_timeout: Duration,

    /// HTTP tracker request timeout
    pub tracker_http_timeout: Duration,

    /// UDP tracker connect-step timeout
    pub udp_connect_timeout: Duration,

    /// UDP tracker announce-step timeout
    pub udp_announce_timeout: Duration,

    /// Maximum block requests in flight per piece
    pub max_backlog: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: 6881,
            dial_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(3),
            open_step_timeout: Duration::from_secs(3),
            port_wait_timeout: Duration::from_secs(5),
            piece_timeout: Duration::from_secs(15),
            metadata_read_timeout: Duration::from_secs(5),
            tracker_http_timeout: Duration::from_secs(3),
            udp_connect_timeout: Duration::from_secs(3),
            udp_announce_timeout: Duration::from_secs(5),
            max_backlog: 10,
        }
    }
}
