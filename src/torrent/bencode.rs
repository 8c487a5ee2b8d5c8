//! Bencode codec
//!
//! A small bencode decoder/encoder that keeps hold of raw bytes. The
//! info hash is the SHA-1 of the info dictionary exactly as it appears
//! on the wire, so the decoder exposes how many bytes a value consumed
//! (`ParseResult::remaining`) and `find_info_dict_bytes` returns the
//! untouched slice of the info dict from a metainfo file.
//!
//! Bencode format:
//! - Integers:   `i<number>e`        Example: `i42e`
//! - Strings:    `<length>:<data>`   Example: `4:spam`
//! - Lists:      `l<items>e`         Example: `l4:spami42ee`
//! - Dicts:      `d<pairs>e`         Example: `d3:cow3:moo4:spam4:eggse`

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ClientError, Result};

/// Maximum length accepted for a single bencode string (100 MiB).
/// Caps allocation when a peer or tracker sends a hostile length.
const MAX_STRING_LENGTH: usize = 100 * 1024 * 1024;

/// A decoded bencode value
#[derive(Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Integer (may be negative)
    Integer(i64),
    /// Byte string, not necessarily valid UTF-8
    Bytes(Vec<u8>),
    /// List of values
    List(Vec<BencodeValue>),
    /// Dictionary keyed by byte strings, sorted
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl fmt::Debug for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "Integer({})", n),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.len() <= 50 => write!(f, "Bytes({:?})", s),
                _ => write!(f, "Bytes([{} bytes])", b.len()),
            },
            Self::List(l) => f.debug_tuple("List").field(l).finish(),
            Self::Dict(d) => {
                let readable: BTreeMap<String, &BencodeValue> = d
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v))
                    .collect();
                f.debug_tuple("Dict").field(&readable).finish()
            }
        }
    }
}

/// A parsed value plus whatever bytes followed it
pub struct ParseResult<'a> {
    /// The parsed value
    pub value: BencodeValue,
    /// Unparsed bytes after the value
    pub remaining: &'a [u8],
}

impl BencodeValue {
    /// Parse one bencode value off the front of `data`.
    pub fn parse(data: &[u8]) -> Result<ParseResult<'_>> {
        match data.first() {
            None => Err(ClientError::bencode("empty input")),
            Some(b'i') => Self::parse_integer(data),
            Some(b'l') => Self::parse_list(data),
            Some(b'd') => Self::parse_dict(data),
            Some(b'0'..=b'9') => Self::parse_bytes(data),
            Some(&c) => Err(ClientError::bencode(format!(
                "invalid type marker {:?}",
                c as char
            ))),
        }
    }

    /// Parse a complete value, rejecting trailing data.
    pub fn parse_exact(data: &[u8]) -> Result<Self> {
        let result = Self::parse(data)?;
        if !result.remaining.is_empty() {
            return Err(ClientError::bencode(format!(
                "trailing data: {} bytes",
                result.remaining.len()
            )));
        }
        Ok(result.value)
    }

    fn parse_integer(data: &[u8]) -> Result<ParseResult<'_>> {
        let end = data[1..]
            .iter()
            .position(|&c| c == b'e')
            .ok_or_else(|| ClientError::bencode("unterminated integer"))?
            + 1;

        let num_str = std::str::from_utf8(&data[1..end])
            .map_err(|_| ClientError::bencode("invalid integer encoding"))?;

        // BEP 3 forbids leading zeros and negative zero
        if (num_str.len() > 1 && num_str.starts_with('0'))
            || num_str == "-0"
            || (num_str.starts_with("-0") && num_str.len() > 2)
        {
            return Err(ClientError::bencode(format!("invalid integer {:?}", num_str)));
        }

        let value = num_str
            .parse::<i64>()
            .map_err(|_| ClientError::bencode(format!("integer out of range: {:?}", num_str)))?;

        Ok(ParseResult {
            value: BencodeValue::Integer(value),
            remaining: &data[end + 1..],
        })
    }

    fn parse_bytes(data: &[u8]) -> Result<ParseResult<'_>> {
        let colon = data
            .iter()
            .position(|&c| c == b':')
            .ok_or_else(|| ClientError::bencode("missing colon in string"))?;

        let len = std::str::from_utf8(&data[..colon])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| ClientError::bencode("invalid string length"))?;

        if len > MAX_STRING_LENGTH {
            return Err(ClientError::bencode(format!(
                "string length {} exceeds cap",
                len
            )));
        }

        let start = colon + 1;
        let end = start + len;
        if end > data.len() {
            return Err(ClientError::bencode(format!(
                "string length {} exceeds available {} bytes",
                len,
                data.len() - start
            )));
        }

        Ok(ParseResult {
            value: BencodeValue::Bytes(data[start..end].to_vec()),
            remaining: &data[end..],
        })
    }

    fn parse_list(data: &[u8]) -> Result<ParseResult<'_>> {
        let mut items = Vec::new();
        let mut remaining = &data[1..];

        while !remaining.is_empty() && remaining[0] != b'e' {
            let result = Self::parse(remaining)?;
            items.push(result.value);
            remaining = result.remaining;
        }

        if remaining.is_empty() {
            return Err(ClientError::bencode("unterminated list"));
        }

        Ok(ParseResult {
            value: BencodeValue::List(items),
            remaining: &remaining[1..],
        })
    }

    fn parse_dict(data: &[u8]) -> Result<ParseResult<'_>> {
        let mut items = BTreeMap::new();
        let mut remaining = &data[1..];
        let mut last_key: Option<Vec<u8>> = None;

        while !remaining.is_empty() && remaining[0] != b'e' {
            let key_result = Self::parse_bytes(remaining)?;
            let key = match key_result.value {
                BencodeValue::Bytes(k) => k,
                _ => return Err(ClientError::bencode("dict key must be a string")),
            };

            // keys must arrive sorted; reorderings would change the
            // info hash without changing the decoded value
            if let Some(ref lk) = last_key {
                if &key <= lk {
                    return Err(ClientError::bencode("dict keys not in sorted order"));
                }
            }
            last_key = Some(key.clone());
            remaining = key_result.remaining;

            let value_result = Self::parse(remaining)?;
            items.insert(key, value_result.value);
            remaining = value_result.remaining;
        }

        if remaining.is_empty() {
            return Err(ClientError::bencode("unterminated dict"));
        }

        Ok(ParseResult {
            value: BencodeValue::Dict(items),
            remaining: &remaining[1..],
        })
    }

    /// Encode to bencode bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Integer(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Self::Bytes(b) => {
                buf.extend_from_slice(b.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(b);
            }
            Self::List(l) => {
                buf.push(b'l');
                for item in l {
                    item.encode_to(buf);
                }
                buf.push(b'e');
            }
            Self::Dict(d) => {
                buf.push(b'd');
                for (k, v) in d {
                    buf.extend_from_slice(k.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(k);
                    v.encode_to(buf);
                }
                buf.push(b'e');
            }
        }
    }

    // Accessors

    /// Get as UTF-8 string
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get as signed integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as unsigned integer
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Integer(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    /// Get as raw bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get as list
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get as dict
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Get dict value by key
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        match self {
            Self::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }
}

/// Locate the raw bytes of the `info` dictionary inside a metainfo
/// file, byte-for-byte as they appear in `data`.
pub fn find_info_dict_bytes(data: &[u8]) -> Result<&[u8]> {
    // Validate the overall structure first
    let root = BencodeValue::parse_exact(data)?;
    let dict = root
        .as_dict()
        .ok_or_else(|| ClientError::MalformedInfo("metainfo root is not a dict".into()))?;
    if !dict.contains_key(b"info".as_slice()) {
        return Err(ClientError::MalformedInfo("missing 'info' key".into()));
    }

    // Find "4:info" followed by a dict and measure how far it parses
    let info_key = b"4:info";
    let mut pos = 0;
    while pos < data.len() {
        if data[pos..].starts_with(info_key) {
            let info_start = pos + info_key.len();
            if info_start < data.len() && data[info_start] == b'd' {
                let result = BencodeValue::parse(&data[info_start..])?;
                let info_len = data.len() - info_start - result.remaining.len();
                return Ok(&data[info_start..info_start + info_len]);
            }
        }
        pos += 1;
    }

    Err(ClientError::MalformedInfo(
        "could not locate info dict bytes".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_integers() {
        let result = BencodeValue::parse(b"i42e").unwrap();
        assert_eq!(result.value, BencodeValue::Integer(42));
        assert!(result.remaining.is_empty());

        assert_eq!(
            BencodeValue::parse(b"i-7e").unwrap().value,
            BencodeValue::Integer(-7)
        );
        assert_eq!(
            BencodeValue::parse(b"i0e").unwrap().value,
            BencodeValue::Integer(0)
        );

        assert!(BencodeValue::parse(b"i03e").is_err());
        assert!(BencodeValue::parse(b"i-0e").is_err());
        assert!(BencodeValue::parse(b"i12").is_err());
    }

    #[test]
    fn parse_strings() {
        let result = BencodeValue::parse(b"4:spam").unwrap();
        assert_eq!(result.value, BencodeValue::Bytes(b"spam".to_vec()));

        assert_eq!(
            BencodeValue::parse(b"0:").unwrap().value,
            BencodeValue::Bytes(vec![])
        );

        // binary content is fine
        let result = BencodeValue::parse(b"3:\x00\x01\x02").unwrap();
        assert_eq!(result.value, BencodeValue::Bytes(vec![0, 1, 2]));

        // declared length longer than input
        assert!(BencodeValue::parse(b"9:abc").is_err());
    }

    #[test]
    fn parse_lists_and_dicts() {
        let result = BencodeValue::parse(b"l4:spami42ee").unwrap();
        let items = result.value.as_list().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], BencodeValue::Integer(42));

        assert_eq!(
            BencodeValue::parse(b"le").unwrap().value,
            BencodeValue::List(vec![])
        );

        let result = BencodeValue::parse(b"d3:cow3:moo4:spam4:eggse").unwrap();
        let d = result.value.as_dict().unwrap();
        assert_eq!(
            d.get(b"cow".as_slice()),
            Some(&BencodeValue::Bytes(b"moo".to_vec()))
        );

        // unsorted keys are rejected
        assert!(BencodeValue::parse(b"d4:spam4:eggs3:cow3:mooe").is_err());
    }

    #[test]
    fn parse_exact_rejects_trailing() {
        assert!(BencodeValue::parse_exact(b"i1ei2e").is_err());
        assert!(BencodeValue::parse_exact(b"i1e").is_ok());
    }

    #[test]
    fn encode_round_trip() {
        let original = b"d5:itemsli1ei2ei3ee4:name4:test5:valuei42ee";
        let value = BencodeValue::parse_exact(original).unwrap();
        assert_eq!(value.encode(), original.to_vec());

        assert_eq!(value.get("name").and_then(|v| v.as_string()), Some("test"));
        assert_eq!(value.get("value").and_then(|v| v.as_int()), Some(42));
    }

    #[test]
    fn info_dict_passthrough() {
        let data = b"d8:announce9:http://t/4:infod6:lengthi6e4:name5:hello12:piece lengthi4e6:pieces20:\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00ee";
        let info = find_info_dict_bytes(data).unwrap();
        assert!(info.starts_with(b"d6:lengthi6e"));
        assert!(info.ends_with(b"e"));
        // the slice re-parses cleanly on its own
        assert!(BencodeValue::parse_exact(info).is_ok());
    }

    #[test]
    fn info_dict_missing() {
        assert!(find_info_dict_bytes(b"d8:announce9:http://t/e").is_err());
    }
}
