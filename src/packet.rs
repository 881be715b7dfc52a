//! TNC2 packet parsing for APRS-IS text lines.
//!
//! A TNC2 line looks like `SRC>DST,PATH1,PATH2:PAYLOAD`. The payload
//! encodes one of several APRS data types; this module extracts the
//! subset the gateway cares about: addressed messages (including `ack`
//! replies), uncompressed positions, and the raw line itself. The raw
//! line is the identity of a packet; its SHA-256 hash keys both
//! deduplication and the persistence layer.

use std::fmt::{self, Display, Formatter, Write as _};
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty callsign in {0:?}")]
    EmptyCallsign(String),
    #[error("malformed packet: {0:?}")]
    InvalidPacket(String),
    #[error("malformed message payload: {0:?}")]
    InvalidMessage(String),
}

/// An AX.25-style address: base callsign plus optional SSID (`KI7QIV-10`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    call: String,
    ssid: Option<u8>,
}

impl Address {
    pub fn call(&self) -> &str {
        &self.call
    }

    pub fn ssid(&self) -> Option<u8> {
        self.ssid
    }

    /// APRS-IS passcode for this callsign: a 16-bit XOR fold over the
    /// base call (SSID excluded), masked to 15 bits. This is the
    /// well-known algorithm every APRS-IS server validates against.
    pub fn passcode(&self) -> u16 {
        let mut hash: u16 = 0x73e2;
        for pair in self.call.as_bytes().chunks(2) {
            hash ^= (pair[0] as u16) << 8;
            if let Some(&low) = pair.get(1) {
                hash ^= low as u16;
            }
        }
        hash & 0x7fff
    }

    /// The addressee field of an outgoing message: left-justified,
    /// blank-padded to the fixed 9-character width.
    pub fn message_addressee_field(&self) -> String {
        format!("{:<9}", self)
    }
}

impl FromStr for Address {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PacketError::EmptyCallsign(s.to_owned()));
        }
        let upper = s.to_ascii_uppercase();
        // An SSID is a numeric suffix after the last dash. Callsigns
        // with non-numeric dash suffixes (e.g. tactical names) are kept
        // whole rather than rejected.
        if let Some((call, tail)) = upper.rsplit_once('-') {
            if !call.is_empty() {
                if let Ok(ssid) = tail.parse::<u8>() {
                    if ssid <= 15 {
                        return Ok(Address {
                            call: call.to_owned(),
                            ssid: Some(ssid),
                        });
                    }
                }
            }
        }
        Ok(Address {
            call: upper,
            ssid: None,
        })
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.ssid {
            Some(ssid) => {
                // Build the joined form first so width/fill specifiers
                // apply to the whole address, not just the base call.
                let joined = format!("{}-{}", self.call, ssid);
                f.pad(&joined)
            }
            None => f.pad(&self.call),
        }
    }
}

/// One parsed APRS packet. Immutable once constructed; `raw` preserves
/// the exact line as received from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub source: Address,
    pub destination: Address,
    pub path: Vec<String>,
    /// Human-readable text: the message body for addressed messages,
    /// the comment for position beacons, the payload otherwise. Any
    /// trailing `{n` message-number suffix is stripped.
    pub message: String,
    /// Destination station of an addressed message, if this is one.
    pub addressee: Option<Address>,
    /// Decimal degrees (latitude, longitude), when the payload carries
    /// an uncompressed position.
    pub position: Option<(f64, f64)>,
    pub raw: String,
}

impl Packet {
    /// Stable content-addressed identifier: hex SHA-256 of the raw
    /// line. Identical packets received via different APRS-IS servers
    /// (or by different gateway instances) hash identically.
    pub fn hash(&self) -> String {
        let digest = Sha256::digest(self.raw.as_bytes());
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    /// Whether this is an acknowledgement of a previously sent message.
    pub fn is_ack(&self) -> bool {
        self.ack_number().is_some()
    }

    /// The message number being acknowledged, for `ack<n>` payloads.
    pub fn ack_number(&self) -> Option<u32> {
        if self.addressee.is_none() {
            return None;
        }
        self.message.strip_prefix("ack")?.trim().parse().ok()
    }
}

impl FromStr for Packet {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (header, body) = s
            .split_once(':')
            .ok_or_else(|| PacketError::InvalidPacket(s.to_owned()))?;
        let (source, dest_and_path) = header
            .split_once('>')
            .ok_or_else(|| PacketError::InvalidPacket(s.to_owned()))?;
        let source: Address = source.parse()?;

        let mut hops = dest_and_path.split(',');
        let destination: Address = hops
            .next()
            .ok_or_else(|| PacketError::InvalidPacket(s.to_owned()))?
            .parse()?;
        let path: Vec<String> = hops.map(|hop| hop.to_owned()).collect();

        let mut addressee = None;
        let mut position = None;
        let message;

        match body.as_bytes().first().copied() {
            Some(b':') => {
                // Addressed message: `:ADDRESSEE:text`. The addressee
                // field is nominally 9 characters, but real traffic is
                // sloppy about padding, so split on the closing colon
                // and trim instead of indexing.
                let (to, text) = body[1..]
                    .split_once(':')
                    .ok_or_else(|| PacketError::InvalidMessage(body.to_owned()))?;
                addressee = Some(to.parse()?);
                message = strip_message_number(text).trim().to_owned();
            }
            Some(b'=') | Some(b'!') => {
                let (pos, comment) = parse_uncompressed_position(&body[1..]);
                position = pos;
                message = strip_message_number(comment).trim().to_owned();
            }
            Some(b'/') | Some(b'@') => {
                // Timestamped position: 7-character timestamp, then the
                // same uncompressed encoding.
                let rest = body.get(8..).unwrap_or("");
                let (pos, comment) = parse_uncompressed_position(rest);
                position = pos;
                message = strip_message_number(comment).trim().to_owned();
            }
            Some(b'>') => {
                // Status report.
                message = body[1..].trim().to_owned();
            }
            _ => {
                message = body.trim().to_owned();
            }
        }

        Ok(Packet {
            source,
            destination,
            path,
            message,
            addressee,
            position,
            raw: s.to_owned(),
        })
    }
}

/// Strips a trailing `{n` message-number suffix, as appended to both
/// addressed messages and some beacon comments.
fn strip_message_number(text: &str) -> &str {
    match text.rfind('{') {
        Some(at) => {
            let tail = &text[at + 1..];
            if !tail.is_empty()
                && tail.len() <= 5
                && tail.chars().all(|c| c.is_ascii_alphanumeric())
            {
                &text[..at]
            } else {
                text
            }
        }
        None => text,
    }
}

/// Parses `DDMM.mmN/DDDMM.mmW` (8-char latitude, symbol table,
/// 9-char longitude, symbol code) and returns the coordinates plus the
/// trailing comment. Positions with ambiguity spaces or otherwise
/// unparseable coordinates yield `None`; the packet itself is still
/// valid.
fn parse_uncompressed_position(s: &str) -> (Option<(f64, f64)>, &str) {
    let Some(comment) = s.get(19..) else {
        return (None, "");
    };
    let lat = s.get(0..8).and_then(parse_latitude);
    let lon = s.get(9..18).and_then(parse_longitude);
    match (lat, lon) {
        (Some(lat), Some(lon)) => (Some((lat, lon)), comment),
        _ => (None, comment),
    }
}

fn parse_latitude(s: &str) -> Option<f64> {
    let degrees: f64 = s.get(0..2)?.parse().ok()?;
    let minutes: f64 = s.get(2..7)?.parse().ok()?;
    let value = degrees + minutes / 60.0;
    match *s.as_bytes().get(7)? {
        b'N' => Some(value),
        b'S' => Some(-value),
        _ => None,
    }
}

fn parse_longitude(s: &str) -> Option<f64> {
    let degrees: f64 = s.get(0..3)?.parse().ok()?;
    let minutes: f64 = s.get(3..8)?.parse().ok()?;
    let value = degrees + minutes / 60.0;
    match *s.as_bytes().get(8)? {
        b'E' => Some(value),
        b'W' => Some(-value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_address_with_ssid() {
        let addr: Address = "KI7QIV-10".parse().unwrap();
        assert_eq!(addr.call(), "KI7QIV");
        assert_eq!(addr.ssid(), Some(10));
        assert_eq!(addr.to_string(), "KI7QIV-10");
    }

    #[test]
    fn parse_address_without_ssid() {
        let addr: Address = "ki7qiv".parse().unwrap();
        assert_eq!(addr.call(), "KI7QIV");
        assert_eq!(addr.ssid(), None);
        assert_eq!(addr.to_string(), "KI7QIV");
    }

    #[test]
    fn address_with_non_numeric_dash_suffix_kept_whole() {
        let addr: Address = "D-EKDF".parse().unwrap();
        assert_eq!(addr.call(), "D-EKDF");
        assert_eq!(addr.ssid(), None);
    }

    #[test]
    fn empty_address_rejected() {
        assert_eq!(
            "".parse::<Address>(),
            Err(PacketError::EmptyCallsign("".to_owned()))
        );
    }

    #[test]
    fn passcode_known_values() {
        let n0call: Address = "N0CALL".parse().unwrap();
        assert_eq!(n0call.passcode(), 13023);

        // The SSID does not contribute to the passcode.
        let with_ssid: Address = "KI7QIV-10".parse().unwrap();
        let without: Address = "KI7QIV".parse().unwrap();
        assert_eq!(with_ssid.passcode(), 18092);
        assert_eq!(with_ssid.passcode(), without.passcode());
    }

    #[test]
    fn addressee_field_is_nine_chars() {
        let addr: Address = "KI7QIV-7".parse().unwrap();
        assert_eq!(addr.message_addressee_field(), "KI7QIV-7 ");
        assert_eq!(addr.message_addressee_field().len(), 9);
    }

    #[test]
    fn parse_position_beacon() {
        let packet: Packet = "KI7QIV-7>APRS,TCPIP*:=4730.00N/12215.00W-Test{1"
            .parse()
            .unwrap();
        assert_eq!(packet.source.to_string(), "KI7QIV-7");
        assert_eq!(packet.destination.to_string(), "APRS");
        assert_eq!(packet.path, vec!["TCPIP*".to_owned()]);
        assert_eq!(packet.message, "Test");
        assert_eq!(packet.addressee, None);
        let (lat, lon) = packet.position.unwrap();
        assert!((lat - 47.5).abs() < 1e-9);
        assert!((lon - (-122.25)).abs() < 1e-9);
        assert!(!packet.is_ack());
    }

    #[test]
    fn parse_southern_and_eastern_hemispheres() {
        let packet: Packet = "VK2ABC>APRS:=3352.00S/15113.00Ehome".parse().unwrap();
        let (lat, lon) = packet.position.unwrap();
        assert!(lat < 0.0);
        assert!(lon > 0.0);
    }

    #[test]
    fn parse_addressed_message() {
        let packet: Packet = "KI7QIV-10>APRS,WIDE::KI7QIV-7  : RX 3:04 PM{1"
            .parse()
            .unwrap();
        assert_eq!(packet.addressee.unwrap().to_string(), "KI7QIV-7");
        assert_eq!(packet.message, "RX 3:04 PM");
    }

    #[test]
    fn parse_ack() {
        let packet: Packet = "KI7QIV-7>APRS::KI7QIV-10 :ack1".parse().unwrap();
        assert!(packet.is_ack());
        assert_eq!(packet.ack_number(), Some(1));
        assert_eq!(packet.addressee.unwrap().to_string(), "KI7QIV-10");
    }

    #[test]
    fn plain_message_is_not_an_ack() {
        let packet: Packet = "KI7QIV-7>APRS::KI7QIV-10 :hello{7".parse().unwrap();
        assert!(!packet.is_ack());
        assert_eq!(packet.ack_number(), None);
        assert_eq!(packet.message, "hello");
    }

    #[test]
    fn garbage_line_rejected() {
        assert!("no header delimiter here".parse::<Packet>().is_err());
        assert!("NOBRACKET:payload".parse::<Packet>().is_err());
    }

    #[test]
    fn hash_is_stable_and_content_addressed() {
        let line = "KI7QIV-7>APRS,TCPIP*:=4730.00N/12215.00W-Test{1";
        let a: Packet = line.parse().unwrap();
        let b: Packet = line.parse().unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);

        let c: Packet = "KI7QIV-7>APRS,TCPIP*:=4730.00N/12215.00W-Test{2"
            .parse()
            .unwrap();
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn ambiguous_position_degrades_to_none() {
        let packet: Packet = "KI7QIV-7>APRS:=47  .  N/122  .  W-hi".parse().unwrap();
        assert_eq!(packet.position, None);
    }
}
