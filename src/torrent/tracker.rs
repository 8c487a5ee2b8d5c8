//! Tracker clients
//!
//! Peer discovery through HTTP/HTTPS trackers (BEP 3) and UDP trackers
//! (BEP 15). The client announces once per tracker and collects peer
//! endpoints; re-announce intervals are not used because a download is
//! a single session.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use url::Url;

use super::bencode::BencodeValue;
use super::metainfo::Sha1Hash;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Magic constant identifying the UDP tracker protocol
const UDP_PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// Tracker client for HTTP and UDP trackers
pub struct TrackerClient {
    http_client: reqwest::Client,
    peer_id: [u8; 20],
    config: ClientConfig,
}

impl TrackerClient {
    /// Create a tracker client announcing with the given peer id.
    pub fn new(peer_id: [u8; 20], config: ClientConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.tracker_http_timeout)
            .build()
            .map_err(|e| ClientError::network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            peer_id,
            config,
        })
    }

    /// Ask one tracker for peers. Dispatches on the URL scheme.
    pub async fn get_peers(
        &self,
        tracker_url: &str,
        info_hash: &Sha1Hash,
        port: u16,
    ) -> Result<Vec<SocketAddrV4>> {
        let url = Url::parse(tracker_url)?;
        match url.scheme() {
            "http" | "https" => self.http_announce(tracker_url, info_hash, port).await,
            "udp" => self.udp_announce(&url, info_hash, port).await,
            other => Err(ClientError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Announce to an HTTP tracker and parse the bencoded reply.
    async fn http_announce(
        &self,
        tracker_url: &str,
        info_hash: &Sha1Hash,
        port: u16,
    ) -> Result<Vec<SocketAddrV4>> {
        // info_hash and peer_id are raw bytes, so the query string is
        // assembled by hand instead of going through a form encoder
        let mut url = tracker_url.to_string();
        url.push(if url.contains('?') { '&' } else { '?' });

        url.push_str("info_hash=");
        for byte in info_hash {
            url.push_str(&format!("%{:02X}", byte));
        }
        url.push_str("&peer_id=");
        for byte in &self.peer_id {
            url.push_str(&format!("%{:02X}", byte));
        }
        url.push_str(&format!(
            "&port={}&uploaded=0&downloaded=0&left=0&compact=1",
            port
        ));

        let response = self.http_client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::TrackerHttpStatus(status.as_u16()));
        }

        let body = response.bytes().await?;
        parse_http_response(&body)
    }

    /// Announce to a UDP tracker (BEP 15): connect, then announce.
    async fn udp_announce(
        &self,
        url: &Url,
        info_hash: &Sha1Hash,
        port: u16,
    ) -> Result<Vec<SocketAddrV4>> {
        let host = url
            .host_str()
            .ok_or_else(|| ClientError::protocol("UDP tracker URL has no host"))?;
        let tracker_port = url
            .port()
            .ok_or_else(|| ClientError::protocol("UDP tracker URL has no port"))?;

        let addr = tokio::net::lookup_host((host, tracker_port))
            .await
            .map_err(|e| ClientError::network(format!("resolving tracker: {}", e)))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| ClientError::network("tracker has no IPv4 address".to_string()))?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;

        let connection_id = self.udp_connect(&socket).await?;
        self.udp_send_announce(&socket, connection_id, info_hash, port)
            .await
    }

    /// Connect step: obtain a connection id for the announce.
    async fn udp_connect(&self, socket: &UdpSocket) -> Result<u64> {
        let transaction_id: u32 = rand::rng().random();
        socket.send(&connect_request(transaction_id)).await?;

        let mut response = [0u8; 16];
        let len = timeout(self.config.udp_connect_timeout, socket.recv(&mut response))
            .await
            .map_err(|_| ClientError::Timeout("waiting for UDP tracker connect response"))??;

        let payload = check_udp_response(&response[..len], transaction_id, ACTION_CONNECT)?;
        if payload.len() < 8 {
            return Err(ClientError::protocol("UDP connect response too short"));
        }

        Ok(u64::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3], payload[4], payload[5], payload[6],
            payload[7],
        ]))
    }

    /// Announce step: report the torrent and read back peer records.
    async fn udp_send_announce(
        &self,
        socket: &UdpSocket,
        connection_id: u64,
        info_hash: &Sha1Hash,
        port: u16,
    ) -> Result<Vec<SocketAddrV4>> {
        let transaction_id: u32 = rand::rng().random();
        let key: u32 = rand::rng().random();

        let request =
            announce_request(connection_id, transaction_id, info_hash, &self.peer_id, key, port);
        socket.send(&request).await?;

        let mut response = [0u8; 4096];
        let len = timeout(self.config.udp_announce_timeout, socket.recv(&mut response))
            .await
            .map_err(|_| ClientError::Timeout("waiting for UDP tracker announce response"))??;

        let payload = check_udp_response(&response[..len], transaction_id, ACTION_ANNOUNCE)?;
        if payload.len() < 12 {
            return Err(ClientError::protocol("UDP announce response too short"));
        }

        // interval, leechers and seeders occupy the first 12 bytes;
        // a single-session client only cares about the peer records
        Ok(parse_peer_records(&payload[12..]))
    }
}

/// Build the 16-byte BEP 15 connect request.
fn connect_request(transaction_id: u32) -> [u8; 16] {
    let mut request = [0u8; 16];
    request[0..8].copy_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
    request[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
    request[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    request
}

/// Build the 98-byte BEP 15 announce request.
fn announce_request(
    connection_id: u64,
    transaction_id: u32,
    info_hash: &Sha1Hash,
    peer_id: &[u8; 20],
    key: u32,
    port: u16,
) -> [u8; 98] {
    let mut request = [0u8; 98];
    request[0..8].copy_from_slice(&connection_id.to_be_bytes());
    request[8..12].copy_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    request[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    request[16..36].copy_from_slice(info_hash);
    request[36..56].copy_from_slice(peer_id);
    // downloaded, left, uploaded stay zero: a fresh single-session
    // client has nothing to report (and for magnets `left` is unknown)
    request[80..84].copy_from_slice(&0u32.to_be_bytes()); // event: none
    request[84..88].copy_from_slice(&0u32.to_be_bytes()); // ip: default
    request[88..92].copy_from_slice(&key.to_be_bytes());
    request[92..96].copy_from_slice(&(-1i32 as u32).to_be_bytes()); // num_want
    request[96..98].copy_from_slice(&port.to_be_bytes());
    request
}

/// Validate a UDP tracker response header and return its payload.
///
/// An error action carries a human-readable message in place of the
/// payload; it is surfaced verbatim.
fn check_udp_response(
    response: &[u8],
    want_transaction_id: u32,
    want_action: u32,
) -> Result<&[u8]> {
    if response.len() < 8 {
        return Err(ClientError::protocol(format!(
            "UDP tracker response is {} bytes, want at least 8",
            response.len()
        )));
    }

    let action = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
    let transaction_id = u32::from_be_bytes([response[4], response[5], response[6], response[7]]);

    if action == ACTION_ERROR {
        return Err(ClientError::Tracker(
            String::from_utf8_lossy(&response[8..]).into_owned(),
        ));
    }
    if transaction_id != want_transaction_id {
        return Err(ClientError::protocol(format!(
            "UDP transaction id mismatch: sent {}, got {}",
            want_transaction_id, transaction_id
        )));
    }
    if action != want_action {
        return Err(ClientError::protocol(format!(
            "unexpected UDP action {}, want {}",
            action, want_action
        )));
    }

    Ok(&response[8..])
}

/// Parse packed 6-byte peer records: 4 IPv4 octets + big-endian port.
///
/// Trailing bytes that don't fill a record are ignored.
fn parse_peer_records(data: &[u8]) -> Vec<SocketAddrV4> {
    data.chunks_exact(6)
        .map(|chunk| {
            SocketAddrV4::new(
                Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
                u16::from_be_bytes([chunk[4], chunk[5]]),
            )
        })
        .collect()
}

/// Generate a random Azureus-style peer id.
///
/// Format: `-SW0001-` followed by 12 random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-SW0001-");
    rand::rng().fill(&mut peer_id[8..]);
    peer_id
}

/// Parse a bencoded HTTP tracker response body.
///
/// Compact form first: `peers` as a byte string of 6-byte records.
/// Falls back to the verbose form where `peers` is a list of
/// `{ip, port}` dicts.
fn parse_http_response(body: &[u8]) -> Result<Vec<SocketAddrV4>> {
    let value = BencodeValue::parse_exact(body)
        .map_err(|_| ClientError::protocol("tracker response is not valid bencode"))?;
    let dict = value
        .as_dict()
        .ok_or_else(|| ClientError::protocol("tracker response is not a dict"))?;

    if let Some(reason) = dict
        .get(b"failure reason".as_slice())
        .and_then(|v| v.as_string())
    {
        return Err(ClientError::Tracker(reason.to_string()));
    }

    match dict.get(b"peers".as_slice()) {
        Some(BencodeValue::Bytes(data)) => {
            if data.len() % 6 != 0 {
                return Err(ClientError::protocol(format!(
                    "compact peers length {} is not a multiple of 6",
                    data.len()
                )));
            }
            Ok(parse_peer_records(data))
        }
        Some(BencodeValue::List(entries)) => {
            let mut peers = Vec::with_capacity(entries.len());
            for entry in entries {
                let Some(entry) = entry.as_dict() else {
                    return Err(ClientError::protocol("verbose peer entry is not a dict"));
                };
                let ip = entry
                    .get(b"ip".as_slice())
                    .and_then(|v| v.as_string())
                    .ok_or_else(|| ClientError::protocol("verbose peer entry missing 'ip'"))?;
                let port = entry
                    .get(b"port".as_slice())
                    .and_then(|v| v.as_uint())
                    .ok_or_else(|| ClientError::protocol("verbose peer entry missing 'port'"))?
                    as u16;

                match ip.parse::<Ipv4Addr>() {
                    Ok(ip) => peers.push(SocketAddrV4::new(ip, port)),
                    // hostnames and IPv6 are out of scope, skip them
                    Err(_) => tracing::warn!("skipping non-IPv4 peer address {:?}", ip),
                }
            }
            Ok(peers)
        }
        _ => Err(ClientError::protocol(
            "tracker response has no usable 'peers' field",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_shape() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[0..8], b"-SW0001-");
        assert_eq!(peer_id.len(), 20);
    }

    #[test]
    fn compact_peers_round_trip() {
        // any 6k-byte blob yields exactly k endpoints with the same bytes
        let blob: Vec<u8> = vec![
            127, 0, 0, 1, 0x1A, 0xE1, // 127.0.0.1:6881
            192, 168, 1, 1, 0x1A, 0xE2, // 192.168.1.1:6882
            10, 0, 0, 7, 0x00, 0x50, // 10.0.0.7:80
        ];
        let peers = parse_peer_records(&blob);

        assert_eq!(peers.len(), 3);
        assert_eq!(peers[0], "127.0.0.1:6881".parse().unwrap());
        assert_eq!(peers[1], "192.168.1.1:6882".parse().unwrap());
        assert_eq!(peers[2], "10.0.0.7:80".parse().unwrap());

        for (chunk, peer) in blob.chunks_exact(6).zip(&peers) {
            assert_eq!(peer.ip().octets(), chunk[0..4]);
            assert_eq!(peer.port().to_be_bytes(), chunk[4..6]);
        }
    }

    #[test]
    fn http_compact_response() {
        let mut body = b"d8:intervali1800e5:peers6:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        body.push(b'e');

        let peers = parse_http_response(&body).unwrap();
        assert_eq!(peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn http_compact_bad_length() {
        let mut body = b"d8:intervali1800e5:peers4:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1]);
        body.push(b'e');

        assert!(matches!(
            parse_http_response(&body),
            Err(ClientError::Protocol(_))
        ));
    }

    #[test]
    fn http_verbose_response() {
        let body = b"d8:intervali1800e5:peersld2:ip9:127.0.0.14:porti6881eed2:ip11:192.168.1.24:porti51413eeee";
        let peers = parse_http_response(body).unwrap();

        assert_eq!(
            peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "192.168.1.2:51413".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn http_failure_reason() {
        let body = b"d14:failure reason15:torrent unknowne";
        assert!(matches!(
            parse_http_response(body),
            Err(ClientError::Tracker(msg)) if msg == "torrent unknown"
        ));
    }

    #[test]
    fn connect_request_layout() {
        let request = connect_request(0xDEADBEEF);
        assert_eq!(&request[0..8], &0x41727101980u64.to_be_bytes());
        assert_eq!(&request[8..12], &[0, 0, 0, 0]);
        assert_eq!(&request[12..16], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn announce_request_layout() {
        let info_hash = [0xAAu8; 20];
        let peer_id = [0xBBu8; 20];
        let request = announce_request(0x1122334455667788, 7, &info_hash, &peer_id, 99, 6881);

        assert_eq!(request.len(), 98);
        assert_eq!(&request[0..8], &0x1122334455667788u64.to_be_bytes());
        assert_eq!(&request[8..12], &1u32.to_be_bytes());
        assert_eq!(&request[12..16], &7u32.to_be_bytes());
        assert_eq!(&request[16..36], &info_hash);
        assert_eq!(&request[36..56], &peer_id);
        assert_eq!(&request[56..80], &[0u8; 24]); // downloaded/left/uploaded
        assert_eq!(&request[80..84], &[0u8; 4]); // event
        assert_eq!(&request[88..92], &99u32.to_be_bytes());
        assert_eq!(&request[92..96], &[0xFF, 0xFF, 0xFF, 0xFF]); // num_want -1
        assert_eq!(&request[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn udp_response_validation() {
        // error action wins regardless of transaction id
        let mut response = Vec::new();
        response.extend_from_slice(&3u32.to_be_bytes());
        response.extend_from_slice(&0u32.to_be_bytes());
        response.extend_from_slice(b"bad info_hash");
        assert!(matches!(
            check_udp_response(&response, 42, ACTION_ANNOUNCE),
            Err(ClientError::Tracker(msg)) if msg == "bad info_hash"
        ));

        // transaction id mismatch
        let mut response = Vec::new();
        response.extend_from_slice(&1u32.to_be_bytes());
        response.extend_from_slice(&41u32.to_be_bytes());
        assert!(matches!(
            check_udp_response(&response, 42, ACTION_ANNOUNCE),
            Err(ClientError::Protocol(_))
        ));

        // happy path returns the payload
        let mut response = Vec::new();
        response.extend_from_slice(&1u32.to_be_bytes());
        response.extend_from_slice(&42u32.to_be_bytes());
        response.extend_from_slice(&[9, 9, 9]);
        let payload = check_udp_response(&response, 42, ACTION_ANNOUNCE).unwrap();
        assert_eq!(payload, &[9, 9, 9]);
    }

    #[tokio::test]
    async fn unsupported_scheme() {
        let client = TrackerClient::new(generate_peer_id(), ClientConfig::default()).unwrap();
        let result = client
            .get_peers("wss://tracker.example/announce", &[0u8; 20], 6881)
            .await;
        assert!(matches!(result, Err(ClientError::UnsupportedScheme(s)) if s == "wss"));
    }

    #[tokio::test]
    async fn udp_tracker_error_action() {
        // a mock tracker that answers the connect step with action=3
        let tracker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = tracker.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (len, from) = tracker.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 16);
            assert_eq!(&buf[0..8], &0x41727101980u64.to_be_bytes());

            let mut reply = Vec::new();
            reply.extend_from_slice(&3u32.to_be_bytes());
            reply.extend_from_slice(&buf[12..16]); // echo transaction id
            reply.extend_from_slice(b"bad info_hash");
            tracker.send_to(&reply, from).await.unwrap();
        });

        let client = TrackerClient::new(generate_peer_id(), ClientConfig::default()).unwrap();
        let url = format!("udp://127.0.0.1:{}", tracker_addr.port());
        let result = client.get_peers(&url, &[0u8; 20], 6881).await;

        assert!(matches!(
            result,
            Err(ClientError::Tracker(msg)) if msg == "bad info_hash"
        ));
    }

    #[tokio::test]
    async fn udp_tracker_full_announce() {
        let tracker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = tracker.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];

            // connect step
            let (len, from) = tracker.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 16);
            let mut reply = Vec::new();
            reply.extend_from_slice(&0u32.to_be_bytes());
            reply.extend_from_slice(&buf[12..16]);
            reply.extend_from_slice(&0xCAFEBABEu64.to_be_bytes());
            tracker.send_to(&reply, from).await.unwrap();

            // announce step
            let (len, from) = tracker.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 98);
            assert_eq!(&buf[0..8], &0xCAFEBABEu64.to_be_bytes());
            assert_eq!(&buf[8..12], &1u32.to_be_bytes());

            let mut reply = Vec::new();
            reply.extend_from_slice(&1u32.to_be_bytes());
            reply.extend_from_slice(&buf[12..16]);
            reply.extend_from_slice(&1800u32.to_be_bytes()); // interval
            reply.extend_from_slice(&1u32.to_be_bytes()); // leechers
            reply.extend_from_slice(&2u32.to_be_bytes()); // seeders
            reply.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
            reply.extend_from_slice(&[10, 1, 2, 3, 0x1A, 0xE2]);
            tracker.send_to(&reply, from).await.unwrap();
        });

        let client = TrackerClient::new(generate_peer_id(), ClientConfig::default()).unwrap();
        let url = format!("udp://127.0.0.1:{}", tracker_addr.port());
        let peers = client.get_peers(&url, &[7u8; 20], 6881).await.unwrap();

        assert_eq!(
            peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "10.1.2.3:6882".parse().unwrap(),
            ]
        );
    }
}
