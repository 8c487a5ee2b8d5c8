//! Magnet URI parser
//!
//! Parses `magnet:?xt=urn:btih:<hash>&dn=<name>&tr=<tracker>` links.
//! The info hash may be 40-char hex or 32-char base32 (RFC 4648,
//! standard alphabet). At least one `tr` parameter is required: this
//! client has no DHT, so a trackerless magnet cannot be bootstrapped.

use crate::error::{ClientError, Result};

use super::metainfo::Sha1Hash;

/// Parsed magnet URI
#[derive(Debug, Clone)]
pub struct MagnetUri {
    /// Info hash (20 bytes)
    pub info_hash: Sha1Hash,
    /// Display name, if the link carried one
    pub display_name: Option<String>,
    /// Tracker URLs, at least one
    pub trackers: Vec<String>,
}

impl MagnetUri {
    /// Parse a magnet URI string.
    pub fn parse(uri: &str) -> Result<Self> {
        let query = uri
            .strip_prefix("magnet:?")
            .ok_or_else(|| ClientError::InvalidMagnet("missing 'magnet:?' prefix".into()))?;

        let mut info_hash: Option<Sha1Hash> = None;
        let mut display_name: Option<String> = None;
        let mut trackers = Vec::new();

        for param in query.split('&') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let value = url_decode(value);

            match key {
                "xt" => {
                    if let Some(hash) = parse_btih(&value) {
                        info_hash = Some(hash);
                    }
                }
                "dn" => display_name = Some(value),
                "tr" => {
                    if !value.is_empty() {
                        trackers.push(value);
                    }
                }
                // xl, ws, xs and friends are irrelevant to this client
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            ClientError::InvalidMagnet("missing or undecodable 'xt=urn:btih:' parameter".into())
        })?;

        if trackers.is_empty() {
            return Err(ClientError::InvalidMagnet(
                "no 'tr' parameters; DHT bootstrap is not implemented".into(),
            ));
        }

        Ok(MagnetUri {
            info_hash,
            display_name,
            trackers,
        })
    }

    /// Info hash as lowercase hex, for logging.
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Decode the hash from an `xt=urn:btih:<hash>` value.
///
/// Accepts 40-char hex and 32-char base32.
fn parse_btih(xt: &str) -> Option<Sha1Hash> {
    let hash_str = xt.strip_prefix("urn:btih:")?;

    match hash_str.len() {
        40 => {
            let bytes: Vec<u8> = (0..40)
                .step_by(2)
                .filter_map(|i| u8::from_str_radix(&hash_str[i..i + 2], 16).ok())
                .collect();
            let mut hash = [0u8; 20];
            if bytes.len() == 20 {
                hash.copy_from_slice(&bytes);
                Some(hash)
            } else {
                None
            }
        }
        32 => base32_decode(hash_str),
        _ => None,
    }
}

/// Decode 32 base32 characters (RFC 4648 standard alphabet) into 20
/// bytes.
fn base32_decode(input: &str) -> Option<Sha1Hash> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let input = input.to_uppercase();
    let input = input.as_bytes();
    if input.len() != 32 {
        return None;
    }

    let mut bits = 0u64;
    let mut bit_count = 0u32;
    let mut output = Vec::with_capacity(20);

    for &c in input {
        let val = ALPHABET.iter().position(|&x| x == c)? as u64;
        bits = (bits << 5) | val;
        bit_count += 5;

        while bit_count >= 8 {
            bit_count -= 8;
            output.push((bits >> bit_count) as u8);
            bits &= (1 << bit_count) - 1;
        }
    }

    if output.len() == 20 {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&output);
        Some(hash)
    } else {
        None
    }
}

/// Percent-decode a query value, treating `+` as space.
fn url_decode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '%' {
            let mut hex = String::with_capacity(2);
            for _ in 0..2 {
                match chars.peek() {
                    Some(h) if h.is_ascii_hexdigit() => hex.push(chars.next().unwrap()),
                    _ => break,
                }
            }
            if hex.len() == 2 {
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    bytes.push(byte);
                    continue;
                }
            }
            // malformed escape, keep literally
            bytes.push(b'%');
            bytes.extend(hex.as_bytes());
        } else if c == '+' {
            bytes.push(b' ');
        } else {
            let mut buf = [0u8; 4];
            bytes.extend(c.encode_utf8(&mut buf).as_bytes());
        }
    }

    String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_magnet() {
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&tr=udp://x:80&dn=Foo";
        let magnet = MagnetUri::parse(uri).unwrap();

        assert_eq!(
            magnet.info_hash_hex(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert_eq!(magnet.trackers, vec!["udp://x:80".to_string()]);
        assert_eq!(magnet.display_name.as_deref(), Some("Foo"));
    }

    #[test]
    fn parse_encoded_trackers() {
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567\
                   &dn=Test+File\
                   &tr=http%3A%2F%2Ftracker.example.com%2Fannounce\
                   &tr=udp%3A%2F%2Ftracker2.example.com%3A6969";
        let magnet = MagnetUri::parse(uri).unwrap();

        assert_eq!(magnet.display_name.as_deref(), Some("Test File"));
        assert_eq!(
            magnet.trackers,
            vec![
                "http://tracker.example.com/announce".to_string(),
                "udp://tracker2.example.com:6969".to_string(),
            ]
        );
    }

    #[test]
    fn parse_base32_hash() {
        // base32("AAAQEAYEAUDAOCAJBIFQYDIOB4IBCEQT") = bytes 0x00..0x13
        let uri = "magnet:?xt=urn:btih:AAAQEAYEAUDAOCAJBIFQYDIOB4IBCEQT&tr=udp://x:80";
        let magnet = MagnetUri::parse(uri).unwrap();

        let expected: Vec<u8> = (0u8..20).collect();
        assert_eq!(magnet.info_hash.as_slice(), expected.as_slice());
    }

    #[test]
    fn reject_trackerless() {
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";
        assert!(matches!(
            MagnetUri::parse(uri),
            Err(ClientError::InvalidMagnet(_))
        ));
    }

    #[test]
    fn reject_bad_links() {
        // wrong scheme
        assert!(MagnetUri::parse("http://example.com").is_err());
        // no xt
        assert!(MagnetUri::parse("magnet:?dn=Test&tr=udp://x:80").is_err());
        // hash of unsupported length
        assert!(MagnetUri::parse("magnet:?xt=urn:btih:abcdef&tr=udp://x:80").is_err());
    }

    #[test]
    fn url_decode_values() {
        assert_eq!(url_decode("hello%20world"), "hello world");
        assert_eq!(url_decode("a+b"), "a b");
        assert_eq!(url_decode("http%3A%2F%2Fx"), "http://x");
        assert_eq!(url_decode("100%"), "100%");
    }
}
