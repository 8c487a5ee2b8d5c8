//! Extension protocol and metadata exchange (BEP 10 / BEP 9)
//!
//! A magnet link only carries the info hash, so the info dictionary
//! itself has to come from the swarm. After the wire handshake, peers
//! that advertise extension support exchange an extended handshake
//! naming their ut_metadata message id and the metadata size; the
//! dictionary is then fetched in 16 KiB pieces and verified against
//! the info hash.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};
use tokio::time::timeout;

use super::bencode::BencodeValue;
use super::metainfo::Sha1Hash;
use super::peer::{Message, PeerSession};
use crate::error::{ClientError, Result};

/// Metadata transfer piece size (16 KiB)
pub const METADATA_PIECE_SIZE: usize = 16384;

/// The ut_metadata id we advertise in our extended handshake
pub const LOCAL_METADATA_ID: u8 = 2;

/// Ordinary messages tolerated while waiting for the extended
/// handshake (bitfield, unchoke and friends arrive first from many
/// clients)
const HANDSHAKE_RETRIES: usize = 50;

/// BEP 9 message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageType {
    /// Ask for one metadata piece
    Request = 0,
    /// A metadata piece, dict followed by raw bytes
    Data = 1,
    /// Peer refuses to serve metadata
    Reject = 2,
}

impl MetadataMessageType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::Data),
            2 => Some(Self::Reject),
            _ => None,
        }
    }
}

/// One BEP 9 message: a bencoded dict, plus raw piece bytes on data
/// messages
#[derive(Debug, Clone)]
pub struct MetadataMessage {
    pub msg_type: MetadataMessageType,
    pub piece: usize,
    /// Total metadata size; present on data messages
    pub total_size: Option<usize>,
    /// Piece bytes; present on data messages
    pub data: Option<Vec<u8>>,
}

impl MetadataMessage {
    /// A request for one piece.
    pub fn request(piece: usize) -> Self {
        Self {
            msg_type: MetadataMessageType::Request,
            piece,
            total_size: None,
            data: None,
        }
    }

    /// A data response carrying piece bytes.
    pub fn data(piece: usize, total_size: usize, data: Vec<u8>) -> Self {
        Self {
            msg_type: MetadataMessageType::Data,
            piece,
            total_size: Some(total_size),
            data: Some(data),
        }
    }

    /// Encode: bencoded dict, then raw piece bytes for data messages.
    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert(
            b"msg_type".to_vec(),
            BencodeValue::Integer(self.msg_type as i64),
        );
        dict.insert(b"piece".to_vec(), BencodeValue::Integer(self.piece as i64));
        if let Some(total_size) = self.total_size {
            dict.insert(
                b"total_size".to_vec(),
                BencodeValue::Integer(total_size as i64),
            );
        }

        let mut encoded = BencodeValue::Dict(dict).encode();
        if let Some(ref data) = self.data {
            encoded.extend_from_slice(data);
        }
        encoded
    }

    /// Parse from an extended-message payload (ext id already
    /// stripped). The parser's leftover slice is exactly the piece
    /// bytes of a data message.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let parsed = BencodeValue::parse(payload)?;
        let consumed = payload.len() - parsed.remaining.len();

        let dict = parsed
            .value
            .as_dict()
            .ok_or_else(|| ClientError::protocol("metadata message is not a dict"))?;

        let msg_type = dict
            .get(b"msg_type".as_slice())
            .and_then(|v| v.as_uint())
            .and_then(|v| MetadataMessageType::from_u8(v as u8))
            .ok_or_else(|| ClientError::protocol("metadata message has no valid msg_type"))?;

        let piece = dict
            .get(b"piece".as_slice())
            .and_then(|v| v.as_uint())
            .ok_or_else(|| ClientError::protocol("metadata message has no piece index"))?
            as usize;

        let total_size = dict
            .get(b"total_size".as_slice())
            .and_then(|v| v.as_uint())
            .map(|v| v as usize);

        let data = if msg_type == MetadataMessageType::Data && consumed < payload.len() {
            Some(payload[consumed..].to_vec())
        } else {
            None
        };

        Ok(Self {
            msg_type,
            piece,
            total_size,
            data,
        })
    }
}

/// The bencoded body of our extended handshake.
fn handshake_payload() -> Vec<u8> {
    let mut m = BTreeMap::new();
    m.insert(
        b"ut_metadata".to_vec(),
        BencodeValue::Integer(LOCAL_METADATA_ID as i64),
    );

    let mut root = BTreeMap::new();
    root.insert(b"m".to_vec(), BencodeValue::Dict(m));
    BencodeValue::Dict(root).encode()
}

/// Perform the BEP 10 extended handshake on a fresh session.
///
/// Sends our handshake, then reads until the peer's arrives, sitting
/// through up to [`HANDSHAKE_RETRIES`] ordinary messages whose side
/// effects (bitfield, choke state) are applied along the way. Records
/// the peer's ut_metadata id and metadata size on the session.
pub(crate) async fn exchange_handshake(session: &mut PeerSession) -> Result<()> {
    session
        .send(&Message::Extended {
            id: 0,
            payload: handshake_payload(),
        })
        .await?;

    let mut message = session.recv().await?;
    let mut retries = 0;
    while !matches!(message, Message::Extended { .. }) && retries < HANDSHAKE_RETRIES {
        message = session.recv().await?;
        retries += 1;
    }

    let Message::Extended { id, payload } = message else {
        return Err(ClientError::protocol(
            "no extended handshake within the message budget",
        ));
    };
    if id != 0 {
        return Err(ClientError::protocol(format!(
            "expected extended handshake, got extension message {}",
            id
        )));
    }

    let parsed = BencodeValue::parse(&payload)?;
    let dict = parsed
        .value
        .as_dict()
        .ok_or_else(|| ClientError::protocol("extended handshake is not a dict"))?;

    session.metadata_id = dict
        .get(b"m".as_slice())
        .and_then(|m| m.get("ut_metadata"))
        .and_then(|v| v.as_uint())
        .unwrap_or(0) as u8;
    session.metadata_size = dict
        .get(b"metadata_size".as_slice())
        .and_then(|v| v.as_uint())
        .unwrap_or(0) as usize;

    Ok(())
}

/// Fetch the whole info dictionary from a peer (BEP 9).
///
/// One request is kept in flight at a time; plenty of clients
/// misbehave when metadata requests are pipelined. The assembled
/// buffer must hash to `info_hash`.
pub async fn fetch_metadata(session: &mut PeerSession, info_hash: &Sha1Hash) -> Result<Vec<u8>> {
    let metadata_id = session.metadata_id;
    let metadata_size = session.metadata_size;
    if metadata_id == 0 || metadata_size == 0 {
        return Err(ClientError::protocol(
            "peer did not advertise metadata support",
        ));
    }

    let mut buf = vec![0u8; metadata_size];
    let mut requested = 0usize;
    let mut received = 0usize;

    while received < metadata_size {
        if requested <= received / METADATA_PIECE_SIZE {
            session
                .send(&Message::Extended {
                    id: metadata_id,
                    payload: MetadataMessage::request(requested).encode(),
                })
                .await?;
            requested += 1;
        }

        let read_timeout = session.config().metadata_read_timeout;
        let message = timeout(read_timeout, session.recv())
            .await
            .map_err(|_| ClientError::Timeout("waiting for metadata piece"))??;

        // unchoke, have and other ordinary traffic is fine to skip
        let Message::Extended { payload, .. } = message else {
            continue;
        };

        let response = MetadataMessage::parse(&payload)?;
        match response.msg_type {
            MetadataMessageType::Reject => {
                return Err(ClientError::MetadataRejected(response.piece))
            }
            MetadataMessageType::Request => {
                return Err(ClientError::protocol(
                    "peer sent a metadata request instead of data",
                ))
            }
            MetadataMessageType::Data => {}
        }

        if response.total_size != Some(metadata_size) {
            return Err(ClientError::protocol(format!(
                "metadata total_size {:?} disagrees with advertised {}",
                response.total_size, metadata_size
            )));
        }

        let data = response.data.unwrap_or_default();
        let offset = response.piece * METADATA_PIECE_SIZE;
        if offset < buf.len() {
            let n = data.len().min(buf.len() - offset);
            buf[offset..offset + n].copy_from_slice(&data[..n]);
            received += n;
        }
    }

    let digest: Sha1Hash = Sha1::digest(&buf).into();
    if digest != *info_hash {
        return Err(ClientError::IntegrityFailure("metadata".into()));
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let encoded = MetadataMessage::request(5).encode();
        assert_eq!(encoded, b"d8:msg_typei0e5:piecei5ee");

        let parsed = MetadataMessage::parse(&encoded).unwrap();
        assert_eq!(parsed.msg_type, MetadataMessageType::Request);
        assert_eq!(parsed.piece, 5);
        assert!(parsed.data.is_none());
    }

    #[test]
    fn data_round_trip() {
        let bytes = vec![1, 2, 3, 4, 5];
        let encoded = MetadataMessage::data(0, 5, bytes.clone()).encode();
        let parsed = MetadataMessage::parse(&encoded).unwrap();

        assert_eq!(parsed.msg_type, MetadataMessageType::Data);
        assert_eq!(parsed.piece, 0);
        assert_eq!(parsed.total_size, Some(5));
        assert_eq!(parsed.data, Some(bytes));
    }

    #[test]
    fn reject_parses() {
        let parsed = MetadataMessage::parse(b"d8:msg_typei2e5:piecei3ee").unwrap();
        assert_eq!(parsed.msg_type, MetadataMessageType::Reject);
        assert_eq!(parsed.piece, 3);
    }

    #[test]
    fn bogus_messages_rejected() {
        // not a dict
        assert!(MetadataMessage::parse(b"i42e").is_err());
        // unknown msg_type
        assert!(MetadataMessage::parse(b"d8:msg_typei9e5:piecei0ee").is_err());
        // missing piece
        assert!(MetadataMessage::parse(b"d8:msg_typei0ee").is_err());
    }

    #[test]
    fn handshake_payload_shape() {
        assert_eq!(handshake_payload(), b"d1:md11:ut_metadatai2eee");
    }

    #[test]
    fn data_with_dict_terminator_in_payload() {
        // piece bytes may themselves contain "ee"; the dict boundary
        // comes from the parser, not from a byte scan
        let bytes = b"deadbeefee".to_vec();
        let encoded = MetadataMessage::data(1, 10, bytes.clone()).encode();
        let parsed = MetadataMessage::parse(&encoded).unwrap();
        assert_eq!(parsed.data, Some(bytes));
    }
}
