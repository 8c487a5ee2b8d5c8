//! Peer wire protocol
//!
//! The BitTorrent peer wire protocol (BEP 3): handshake, framed
//! messaging, choke/bitfield bookkeeping, and the pipelined block
//! download that turns a `(index, length, hash)` job into verified
//! piece bytes.
//!
//! A `PeerSession` is created by a successful dial + handshake + open
//! sequence and is owned by exactly one task from then on. Any I/O
//! error on the session is fatal to it; the coordinator requeues the
//! in-flight job and lets the session drop.

use std::net::SocketAddrV4;

use bitvec::prelude::*;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::metadata;
use super::metainfo::Sha1Hash;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Protocol string sent in the handshake
const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Handshake length: 1 + 19 + 8 + 20 + 20
const HANDSHAKE_SIZE: usize = 68;

/// Largest frame we accept (one block plus headroom)
const MAX_MESSAGE_SIZE: usize = 32 * 1024;

/// Messages to sit through while waiting for a DHT `port` message
const PORT_WAIT_MESSAGES: usize = 50;

/// Block transfer size (16 KiB)
pub const BLOCK_SIZE: usize = 16384;

/// Reserved handshake bytes
#[derive(Debug, Clone, Copy, Default)]
struct ReservedBytes([u8; 8]);

impl ReservedBytes {
    /// The capabilities we advertise: extension protocol (BEP 10) and
    /// DHT (BEP 5).
    fn ours() -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10;
        reserved[7] |= 0x01;
        Self(reserved)
    }

    fn supports_extensions(&self) -> bool {
        (self.0[5] & 0x10) != 0
    }

    fn supports_dht(&self) -> bool {
        (self.0[7] & 0x01) != 0
    }
}

/// Peer wire messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Zero-length frame
    KeepAlive,
    /// id 0
    Choke,
    /// id 1
    Unchoke,
    /// id 2
    Interested,
    /// id 3
    NotInterested,
    /// id 4
    Have { piece_index: u32 },
    /// id 5
    Bitfield { bitfield: Vec<u8> },
    /// id 6
    Request { index: u32, begin: u32, length: u32 },
    /// id 7
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// id 8
    Cancel { index: u32, begin: u32, length: u32 },
    /// id 9, DHT listen port (BEP 5)
    Port { port: u16 },
    /// id 20, BEP 10 multiplexed extension message
    Extended { id: u8, payload: Vec<u8> },
    /// Anything else; carried, never interpreted
    Unknown { id: u8, payload: Vec<u8> },
}

impl Message {
    /// Encode with the 4-byte length prefix.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => vec![0, 0, 0, 0],
            Self::Choke => vec![0, 0, 0, 1, 0],
            Self::Unchoke => vec![0, 0, 0, 1, 1],
            Self::Interested => vec![0, 0, 0, 1, 2],
            Self::NotInterested => vec![0, 0, 0, 1, 3],

            Self::Have { piece_index } => {
                let mut buf = vec![0, 0, 0, 5, 4];
                buf.extend_from_slice(&piece_index.to_be_bytes());
                buf
            }

            Self::Bitfield { bitfield } => {
                let len = 1 + bitfield.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(5);
                buf.extend_from_slice(bitfield);
                buf
            }

            Self::Request {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 6];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Piece {
                index,
                begin,
                block,
            } => {
                let len = 9 + block.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(7);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }

            Self::Cancel {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 8];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Port { port } => {
                let mut buf = vec![0, 0, 0, 3, 9];
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }

            Self::Extended { id, payload } => {
                let len = 2 + payload.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(20);
                buf.push(*id);
                buf.extend_from_slice(payload);
                buf
            }

            Self::Unknown { id, payload } => {
                let len = 1 + payload.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(*id);
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    /// Decode a frame body (without the length prefix). An empty body
    /// is a keep-alive.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::KeepAlive);
        }

        let id = data[0];
        let payload = &data[1..];

        let too_short =
            |what: &str| ClientError::protocol(format!("{} message too short", what));

        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),

            4 => {
                if payload.len() < 4 {
                    return Err(too_short("have"));
                }
                Ok(Self::Have {
                    piece_index: u32::from_be_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ]),
                })
            }

            5 => Ok(Self::Bitfield {
                bitfield: payload.to_vec(),
            }),

            6 | 8 => {
                if payload.len() < 12 {
                    return Err(too_short(if id == 6 { "request" } else { "cancel" }));
                }
                let index = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let begin = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                let length = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
                if id == 6 {
                    Ok(Self::Request {
                        index,
                        begin,
                        length,
                    })
                } else {
                    Ok(Self::Cancel {
                        index,
                        begin,
                        length,
                    })
                }
            }

            7 => {
                if payload.len() < 8 {
                    return Err(too_short("piece"));
                }
                Ok(Self::Piece {
                    index: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                    begin: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
                    block: payload[8..].to_vec(),
                })
            }

            9 => {
                if payload.len() < 2 {
                    return Err(too_short("port"));
                }
                Ok(Self::Port {
                    port: u16::from_be_bytes([payload[0], payload[1]]),
                })
            }

            20 => {
                if payload.is_empty() {
                    return Err(too_short("extended"));
                }
                Ok(Self::Extended {
                    id: payload[0],
                    payload: payload[1..].to_vec(),
                })
            }

            _ => Ok(Self::Unknown {
                id,
                payload: payload.to_vec(),
            }),
        }
    }
}

/// One authenticated connection to a peer
pub struct PeerSession {
    stream: TcpStream,
    addr: SocketAddrV4,
    config: ClientConfig,

    remote_peer_id: [u8; 20],
    choked: bool,
    bitfield: BitVec<u8, Msb0>,
    supports_dht: bool,
    supports_extensions: bool,
    dht_port: Option<u16>,

    /// Peer's extension message id for ut_metadata; 0 = unsupported
    pub(crate) metadata_id: u8,
    /// Advertised size of the info dictionary in bytes
    pub(crate) metadata_size: usize,

    read_buffer: BytesMut,
}

impl PeerSession {
    /// Dial a peer and run the full open sequence: handshake, extended
    /// handshake when supported, bitfield, optional DHT port, then
    /// unchoke + interested. A session that comes back from here is
    /// ready for `get_piece`.
    pub async fn connect(
        addr: SocketAddrV4,
        info_hash: Sha1Hash,
        peer_id: [u8; 20],
        config: ClientConfig,
    ) -> Result<Self> {
        let stream = timeout(config.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout("dialing peer"))?
            .map_err(|e| ClientError::network(format!("connecting to {}: {}", addr, e)))?;

        let mut session = Self {
            stream,
            addr,
            config,
            remote_peer_id: [0u8; 20],
            choked: true,
            bitfield: BitVec::new(),
            supports_dht: false,
            supports_extensions: false,
            dht_port: None,
            metadata_id: 0,
            metadata_size: 0,
            read_buffer: BytesMut::with_capacity(MAX_MESSAGE_SIZE),
        };

        session.handshake(&info_hash, &peer_id).await?;
        session.open().await?;

        Ok(session)
    }

    /// Exchange and validate the 68-byte handshake.
    async fn handshake(&mut self, info_hash: &Sha1Hash, peer_id: &[u8; 20]) -> Result<()> {
        let mut handshake = Vec::with_capacity(HANDSHAKE_SIZE);
        handshake.push(PROTOCOL_STRING.len() as u8);
        handshake.extend_from_slice(PROTOCOL_STRING);
        handshake.extend_from_slice(&ReservedBytes::ours().0);
        handshake.extend_from_slice(info_hash);
        handshake.extend_from_slice(peer_id);

        let response = timeout(self.config.handshake_timeout, async {
            self.stream.write_all(&handshake).await?;
            let mut response = [0u8; HANDSHAKE_SIZE];
            self.stream.read_exact(&mut response).await?;
            Ok::<_, std::io::Error>(response)
        })
        .await
        .map_err(|_| ClientError::Timeout("exchanging handshake"))??;

        if response[0] as usize != PROTOCOL_STRING.len() {
            return Err(ClientError::protocol(format!(
                "invalid protocol string length {}",
                response[0]
            )));
        }
        if &response[1..20] != PROTOCOL_STRING {
            return Err(ClientError::protocol("invalid protocol string"));
        }

        let mut reserved = ReservedBytes::default();
        reserved.0.copy_from_slice(&response[20..28]);
        self.supports_extensions = reserved.supports_extensions();
        self.supports_dht = reserved.supports_dht();

        if &response[28..48] != info_hash {
            return Err(ClientError::InfoHashMismatch);
        }
        self.remote_peer_id.copy_from_slice(&response[48..68]);

        Ok(())
    }

    /// Post-handshake open sequence.
    async fn open(&mut self) -> Result<()> {
        if self.supports_extensions {
            timeout(
                self.config.open_step_timeout,
                metadata::exchange_handshake(self),
            )
            .await
            .map_err(|_| ClientError::Timeout("exchanging extended handshake"))??;
        }

        // the extended-handshake retries may already have consumed the
        // bitfield as a side effect
        if self.bitfield.is_empty() {
            timeout(self.config.open_step_timeout, self.recv())
                .await
                .map_err(|_| ClientError::Timeout("waiting for bitfield"))??;
            if self.bitfield.is_empty() {
                return Err(ClientError::EmptyBitfield);
            }
        }

        if self.supports_dht {
            // best effort; a peer that never sends `port` is still a
            // perfectly good download peer
            let _ = timeout(self.config.port_wait_timeout, async {
                for _ in 0..PORT_WAIT_MESSAGES {
                    if self.dht_port.is_some() || self.recv().await.is_err() {
                        break;
                    }
                }
            })
            .await;
        }

        timeout(self.config.open_step_timeout, async {
            self.send(&Message::Unchoke).await?;
            self.send(&Message::Interested).await
        })
        .await
        .map_err(|_| ClientError::Timeout("sending unchoke/interested"))??;

        Ok(())
    }

    /// Send one message.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let data = message.encode();
        self.stream.write_all(&data).await?;
        Ok(())
    }

    /// Receive one message, applying its side effect to the session
    /// state before returning it.
    pub async fn recv(&mut self) -> Result<Message> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Ok(Message::KeepAlive);
        }
        if len > MAX_MESSAGE_SIZE {
            return Err(ClientError::protocol(format!(
                "message of {} bytes exceeds frame cap",
                len
            )));
        }

        self.read_buffer.resize(len, 0);
        self.stream.read_exact(&mut self.read_buffer).await?;

        let message = Message::decode(&self.read_buffer)?;
        self.apply(&message);
        Ok(message)
    }

    /// Apply a received message's side effect.
    fn apply(&mut self, message: &Message) {
        match message {
            Message::Choke => self.choked = true,
            Message::Unchoke => self.choked = false,
            Message::Have { piece_index } => {
                // out-of-range indices are dropped, not grown into
                if let Some(mut bit) = self.bitfield.get_mut(*piece_index as usize) {
                    *bit = true;
                }
            }
            Message::Bitfield { bitfield } => {
                self.bitfield = BitVec::from_slice(bitfield);
            }
            Message::Port { port } => self.dht_port = Some(*port),
            _ => {}
        }
    }

    /// Download one piece and verify it against `hash`.
    ///
    /// Returns `NotInBitfield` without touching the connection when the
    /// peer doesn't have the piece; the caller requeues the job. Every
    /// other error retires the session.
    pub async fn get_piece(&mut self, index: u32, length: usize, hash: &Sha1Hash) -> Result<Vec<u8>> {
        if !self.has_piece(index) {
            return Err(ClientError::NotInBitfield(index));
        }

        let buf = timeout(self.config.piece_timeout, self.piece_loop(index, length))
            .await
            .map_err(|_| ClientError::Timeout("downloading piece"))??;

        let digest: Sha1Hash = Sha1::digest(&buf).into();
        if digest != *hash {
            return Err(ClientError::IntegrityFailure(format!(
                "piece {} from {}",
                index, self.addr
            )));
        }

        // let the peer know; failure here is not worth the session
        let _ = self
            .send(&Message::Have { piece_index: index })
            .await;

        Ok(buf)
    }

    /// Pipelined request/receive loop for one piece.
    async fn piece_loop(&mut self, index: u32, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        let mut requested = 0usize;
        let mut received = 0usize;
        let mut backlog = 0usize;

        while received < length {
            while !self.choked && backlog < self.config.max_backlog && requested < length {
                let block = BLOCK_SIZE.min(length - requested);
                self.send(&Message::Request {
                    index,
                    begin: requested as u32,
                    length: block as u32,
                })
                .await?;
                requested += block;
                backlog += 1;
            }

            if self.choked {
                // nudge a choking peer; some unchoke on reciprocation
                self.send(&Message::Unchoke).await?;
            }

            match self.recv().await? {
                Message::Piece {
                    index: piece_index,
                    begin,
                    block,
                } if piece_index == index => {
                    let begin = begin as usize;
                    if begin < buf.len() {
                        let n = block.len().min(buf.len() - begin);
                        buf[begin..begin + n].copy_from_slice(&block[..n]);
                        received += n;
                        if n > 0 {
                            backlog = backlog.saturating_sub(1);
                        }
                    }
                }
                // other messages have had their side effects applied;
                // blocks for other pieces are ignored
                _ => {}
            }
        }

        Ok(buf)
    }

    // Accessors

    /// The peer's address
    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    /// The peer id received in the handshake
    pub fn remote_peer_id(&self) -> &[u8; 20] {
        &self.remote_peer_id
    }

    /// Whether the peer is currently choking us
    pub fn choked(&self) -> bool {
        self.choked
    }

    /// Whether the peer advertised BEP 10 extension support
    pub fn supports_extensions(&self) -> bool {
        self.supports_extensions
    }

    /// Whether the peer advertised DHT support
    pub fn supports_dht(&self) -> bool {
        self.supports_dht
    }

    /// The peer's DHT port, if it sent one
    pub fn dht_port(&self) -> Option<u16> {
        self.dht_port
    }

    /// Whether the peer claims to have a piece
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield
            .get(index as usize)
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_fixed_messages() {
        assert_eq!(Message::KeepAlive.encode(), vec![0, 0, 0, 0]);
        assert_eq!(Message::Choke.encode(), vec![0, 0, 0, 1, 0]);
        assert_eq!(Message::Unchoke.encode(), vec![0, 0, 0, 1, 1]);
        assert_eq!(Message::Interested.encode(), vec![0, 0, 0, 1, 2]);
        assert_eq!(Message::NotInterested.encode(), vec![0, 0, 0, 1, 3]);
    }

    #[test]
    fn round_trip_payload_messages() {
        let messages = vec![
            Message::Have { piece_index: 42 },
            Message::Bitfield {
                bitfield: vec![0b1010_0000, 0xFF],
            },
            Message::Request {
                index: 1,
                begin: 16384,
                length: 16384,
            },
            Message::Piece {
                index: 3,
                begin: 0,
                block: vec![1, 2, 3, 4],
            },
            Message::Cancel {
                index: 1,
                begin: 2,
                length: 3,
            },
            Message::Port { port: 6881 },
            Message::Extended {
                id: 4,
                payload: b"d1:md11:ut_metadatai2eee".to_vec(),
            },
        ];

        for message in messages {
            let encoded = message.encode();
            let decoded = Message::decode(&encoded[4..]).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn decode_empty_is_keepalive() {
        assert_eq!(Message::decode(&[]).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn decode_unknown_id() {
        let decoded = Message::decode(&[0x42, 1, 2]).unwrap();
        assert_eq!(
            decoded,
            Message::Unknown {
                id: 0x42,
                payload: vec![1, 2],
            }
        );
    }

    #[test]
    fn decode_truncated_payloads() {
        assert!(Message::decode(&[4, 0, 0]).is_err()); // have
        assert!(Message::decode(&[6, 0, 0, 0, 0]).is_err()); // request
        assert!(Message::decode(&[7, 0, 0, 0, 0]).is_err()); // piece
        assert!(Message::decode(&[9, 0]).is_err()); // port
        assert!(Message::decode(&[20]).is_err()); // extended
    }

    #[test]
    fn reserved_bit_masks() {
        let ours = ReservedBytes::ours();
        assert!(ours.supports_extensions());
        assert!(ours.supports_dht());

        assert!(!ReservedBytes::default().supports_extensions());
        assert!(!ReservedBytes::default().supports_dht());

        let mut dht_only = ReservedBytes::default();
        dht_only.0[7] = 0x01;
        assert!(dht_only.supports_dht());
        assert!(!dht_only.supports_extensions());
    }

    #[test]
    fn bitfield_bit_order() {
        // wire bitfields are big-endian per byte:
        // bit i lives in byte i/8 at mask 1 << (7 - i%8)
        let raw = vec![0b1010_0000u8, 0b0000_0001u8];
        let bits: BitVec<u8, Msb0> = BitVec::from_slice(&raw);

        for i in 0..16u32 {
            let expected = (raw[(i / 8) as usize] >> (7 - i % 8)) & 1 == 1;
            assert_eq!(bits[i as usize], expected, "bit {}", i);
        }
        assert!(bits[0]);
        assert!(!bits[1]);
        assert!(bits[2]);
        assert!(bits[15]);

        // out-of-range reads are false, not panics
        assert_eq!(bits.get(16).map(|b| *b), None);
    }
}
