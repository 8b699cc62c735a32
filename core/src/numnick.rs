//! P10 numeric nick codec
//!
//! Servers are named on the wire by two base64 characters and clients by the
//! server's two characters followed by three of their own. The same alphabet
//! encodes IP addresses in nick introductions.

use crate::{Error, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Base64 alphabet used by numeric nicks
pub const NUMNICK_ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789[]";

/// Characters in a server numeric
pub const SERVER_NUMERIC_LEN: usize = 2;
/// Characters in the client part of a numeric
pub const CLIENT_NUMERIC_LEN: usize = 3;
/// Characters in a full client numeric
pub const NUMNICK_LEN: usize = SERVER_NUMERIC_LEN + CLIENT_NUMERIC_LEN;

/// Largest encodable server numeric
pub const MAX_SERVER_NUMERIC: u16 = 4095;
/// Largest encodable client numeric
pub const MAX_CLIENT_NUMERIC: u32 = 262_143;

fn decode_char(c: u8) -> Option<u32> {
    match c {
        b'A'..=b'Z' => Some((c - b'A') as u32),
        b'a'..=b'z' => Some((c - b'a') as u32 + 26),
        b'0'..=b'9' => Some((c - b'0') as u32 + 52),
        b'[' => Some(62),
        b']' => Some(63),
        _ => None,
    }
}

/// Encode `value` into exactly `count` base64 characters (most significant first)
pub fn int_to_base64(mut value: u32, count: usize) -> String {
    let mut buf = vec![b'A'; count];
    for slot in buf.iter_mut().rev() {
        *slot = NUMNICK_ALPHABET[(value & 63) as usize];
        value >>= 6;
    }
    // Alphabet bytes are ASCII
    buf.into_iter().map(char::from).collect()
}

/// Decode a base64 numeric string; `None` on characters outside the alphabet
pub fn base64_to_int(s: &str) -> Option<u32> {
    if s.is_empty() || s.len() > 6 {
        return None;
    }
    s.bytes().try_fold(0u32, |acc, c| decode_char(c).map(|v| (acc << 6) | v))
}

/// A decoded numeric: a server, or a client on a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NumericNick {
    pub server: u16,
    pub client: Option<u32>,
}

impl NumericNick {
    /// Numeric for a server
    pub fn server(server: u16) -> Self {
        Self { server, client: None }
    }

    /// Numeric for a client on `server`
    pub fn client(server: u16, client: u32) -> Self {
        Self {
            server,
            client: Some(client),
        }
    }

    /// Parse a 2 or 5 character numeric
    pub fn parse(s: &str) -> Result<Self> {
        match s.len() {
            SERVER_NUMERIC_LEN => {
                let server = base64_to_int(s).ok_or_else(|| Error::Numnick(format!("bad server numeric '{}'", s)))?;
                Ok(Self::server(server as u16))
            }
            NUMNICK_LEN => {
                let server = base64_to_int(&s[..SERVER_NUMERIC_LEN])
                    .ok_or_else(|| Error::Numnick(format!("bad server part in '{}'", s)))?;
                let client = base64_to_int(&s[SERVER_NUMERIC_LEN..])
                    .ok_or_else(|| Error::Numnick(format!("bad client part in '{}'", s)))?;
                Ok(Self::client(server as u16, client))
            }
            _ => Err(Error::Numnick(format!("numeric '{}' has invalid length", s))),
        }
    }

    /// The server part only
    pub fn server_part(&self) -> Self {
        Self::server(self.server)
    }

    pub fn is_server(&self) -> bool {
        self.client.is_none()
    }
}

impl fmt::Display for NumericNick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&int_to_base64(self.server as u32, SERVER_NUMERIC_LEN))?;
        if let Some(client) = self.client {
            f.write_str(&int_to_base64(client, CLIENT_NUMERIC_LEN))?;
        }
        Ok(())
    }
}

/// Encode an address for a nick introduction
pub fn ip_to_base64(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => int_to_base64(u32::from(v4), 6),
        IpAddr::V6(v6) => {
            let groups = v6.segments();

            // Longest run of zero groups, compressed to a single '_'
            let (mut best_start, mut best_len) = (0usize, 0usize);
            let mut i = 0;
            while i < groups.len() {
                if groups[i] == 0 {
                    let start = i;
                    while i < groups.len() && groups[i] == 0 {
                        i += 1;
                    }
                    if i - start > best_len {
                        best_start = start;
                        best_len = i - start;
                    }
                } else {
                    i += 1;
                }
            }

            let mut out = String::with_capacity(24);
            let mut i = 0;
            while i < groups.len() {
                if best_len > 1 && i == best_start {
                    out.push('_');
                    i += best_len;
                    continue;
                }
                out.push_str(&int_to_base64(groups[i] as u32, 3));
                i += 1;
            }
            out
        }
    }
}

/// Decode an address from a nick introduction
pub fn base64_to_ip(s: &str) -> Option<IpAddr> {
    if s.len() == 6 && !s.contains('_') {
        return base64_to_int(s).map(|v| IpAddr::V4(Ipv4Addr::from(v)));
    }

    let mut head = Vec::new();
    let mut tail = Vec::new();
    let mut seen_gap = false;
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' {
            if seen_gap {
                return None;
            }
            seen_gap = true;
            i += 1;
            continue;
        }
        let chunk = s.get(i..i + 3)?;
        let group = base64_to_int(chunk)?;
        if group > u16::MAX as u32 {
            return None;
        }
        if seen_gap {
            tail.push(group as u16);
        } else {
            head.push(group as u16);
        }
        i += 3;
    }

    if head.len() + tail.len() > 8 || (!seen_gap && head.len() != 8) {
        return None;
    }

    let mut groups = [0u16; 8];
    groups[..head.len()].copy_from_slice(&head);
    groups[8 - tail.len()..].copy_from_slice(&tail);
    Some(IpAddr::V6(Ipv6Addr::from(groups)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_round_trip_bounds() {
        assert_eq!(int_to_base64(0, 2), "AA");
        assert_eq!(int_to_base64(MAX_SERVER_NUMERIC as u32, 2), "]]");
        assert_eq!(int_to_base64(MAX_CLIENT_NUMERIC, 3), "]]]");
        assert_eq!(base64_to_int("]]]"), Some(MAX_CLIENT_NUMERIC));
        assert_eq!(base64_to_int("AB"), Some(1));
    }

    #[test]
    fn test_invalid_characters_rejected() {
        assert_eq!(base64_to_int("A-"), None);
        assert_eq!(base64_to_int(""), None);
        assert!(NumericNick::parse("A{AAA").is_err());
        assert!(NumericNick::parse("ABC").is_err());
    }

    #[test]
    fn test_parse_client_numeric() {
        let nn = NumericNick::parse("ABAAC").unwrap();
        assert_eq!(nn.server, 1);
        assert_eq!(nn.client, Some(2));
        assert_eq!(nn.to_string(), "ABAAC");
        assert_eq!(nn.server_part().to_string(), "AB");
        assert!(NumericNick::parse("AB").unwrap().is_server());
    }

    #[test]
    fn test_ipv4_encoding() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let encoded = ip_to_base64(ip);
        assert_eq!(encoded, "B]AAAB");
        assert_eq!(base64_to_ip(&encoded), Some(ip));
        assert_eq!(base64_to_ip("AAAAAA"), Some("0.0.0.0".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_zero_run_compression() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        let encoded = ip_to_base64(ip);
        assert!(encoded.contains('_'));
        assert_eq!(base64_to_ip(&encoded), Some(ip));

        let full: IpAddr = "1:2:3:4:5:6:7:8".parse().unwrap();
        let encoded = ip_to_base64(full);
        assert_eq!(encoded.len(), 24);
        assert_eq!(base64_to_ip(&encoded), Some(full));
    }
}
