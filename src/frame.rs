//! MTP wire format: frame layout, control tags, and checksum computation.
//!
//! Everything here is pure and allocation-light by design: the server and
//! client engines call into it on every frame, and it is the one place that
//! has to agree bit-for-bit with a peer implementation.

use sha1::{Digest, Sha1};

/// Payload size of every SEND/JUNK packet body.
pub const PACKET_LEN: usize = 32768;
/// Length of a SHA-1 digest.
pub const DIGEST_LEN: usize = 20;
/// `SEND\r\n` or `JUNK\r\n` control tag length.
pub const CONTROL_LEN: usize = 6;
/// Full on-wire record length after the greeting exchange:
/// 6-byte tag + 32768-byte body + 20-byte digest.
pub const MESSAGE_LEN: usize = CONTROL_LEN + PACKET_LEN + DIGEST_LEN;
/// `RECEIVED\r\n` / `REJECTED\r\n` ack tag length.
pub const ACK_CONTROL_LEN: usize = 10;
/// Full ack record length: 10-byte tag + 20-byte digest.
pub const ACK_LEN: usize = ACK_CONTROL_LEN + DIGEST_LEN;

/// Maximum bytes read while waiting for the version greeting line.
pub const MAX_GREETING_LEN: usize = 4096;

pub const SEND_CONTROL: &[u8; CONTROL_LEN] = b"SEND\r\n";
pub const JUNK_CONTROL: &[u8; CONTROL_LEN] = b"JUNK\r\n";
pub const RECEIVED_CONTROL: &[u8; ACK_CONTROL_LEN] = b"RECEIVED\r\n";
pub const REJECTED_CONTROL: &[u8; ACK_CONTROL_LEN] = b"REJECTED\r\n";

/// Protocol versions this node offers, in preference order. Only one is
/// defined today, but negotiation always walks this list in order so a
/// future version can be added without changing the selection rule.
pub const OUR_PROTOCOL_VERSIONS: &[&str] = &["0.3"];

const SUFFIX_SEND: &[u8] = b"SEND";
const SUFFIX_JUNK: &[u8] = b"JUNK";
const SUFFIX_RECEIVED: &[u8] = b"RECEIVED";
const SUFFIX_RECEIVED_JUNK: &[u8] = b"RECEIVED JUNK";
const SUFFIX_REJECTED: &[u8] = b"REJECTED";

fn digest(body: &[u8], suffix: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(body);
    hasher.update(suffix);
    hasher.finalize().into()
}

/// Expected digest for a `SEND` frame carrying `body`.
pub fn digest_send(body: &[u8]) -> [u8; DIGEST_LEN] {
    digest(body, SUFFIX_SEND)
}

/// Expected digest for a `JUNK` frame carrying `body`.
pub fn digest_junk(body: &[u8]) -> [u8; DIGEST_LEN] {
    digest(body, SUFFIX_JUNK)
}

/// Expected digest for the `RECEIVED` ack of a `SEND` frame.
pub fn digest_received(body: &[u8]) -> [u8; DIGEST_LEN] {
    digest(body, SUFFIX_RECEIVED)
}

/// Expected digest for the `RECEIVED` ack of a `JUNK` frame.
pub fn digest_received_junk(body: &[u8]) -> [u8; DIGEST_LEN] {
    digest(body, SUFFIX_RECEIVED_JUNK)
}

/// Expected digest for a `REJECTED` ack.
pub fn digest_rejected(body: &[u8]) -> [u8; DIGEST_LEN] {
    digest(body, SUFFIX_REJECTED)
}

/// The control tag read from the first 6 bytes of an inbound record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlTag {
    Send,
    Junk,
}

impl ControlTag {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes == SEND_CONTROL {
            Some(ControlTag::Send)
        } else if bytes == JUNK_CONTROL {
            Some(ControlTag::Junk)
        } else {
            None
        }
    }
}

/// The tag read from the first 10 bytes of an ack record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckTag {
    Received,
    Rejected,
}

impl AckTag {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes == RECEIVED_CONTROL {
            Some(AckTag::Received)
        } else if bytes == REJECTED_CONTROL {
            Some(AckTag::Rejected)
        } else {
            None
        }
    }
}

/// Parse a `MTP <versions>\r\n` greeting line.
///
/// The line must end in `\r\n`, contain no interior `\r` or `\n`, and the
/// version field must be a comma-separated list of tokens with no
/// whitespace. Returns the list of peer-offered version tokens in the order
/// they were sent.
pub fn parse_greeting(line: &[u8]) -> Option<Vec<String>> {
    let text = std::str::from_utf8(line).ok()?;
    let text = text.strip_suffix("\r\n")?;
    let rest = text.strip_prefix("MTP ")?;
    if rest.is_empty() || rest.contains(['\r', '\n', ' ', '\t']) {
        return None;
    }
    Some(rest.split(',').map(|s| s.to_string()).collect())
}

/// Render the greeting line this node sends, offering `versions` in order.
pub fn render_greeting(versions: &[&str]) -> Vec<u8> {
    format!("MTP {}\r\n", versions.join(",")).into_bytes()
}

/// Choose the first version in `OUR_PROTOCOL_VERSIONS` that also appears in
/// `peer_versions`. Ties are broken by our preference order, not theirs.
pub fn negotiate_version(peer_versions: &[String]) -> Option<&'static str> {
    OUR_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|ours| peer_versions.iter().any(|p| p == ours))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiates_shared_version() {
        let peer = vec!["0.2".to_string(), "0.3".to_string()];
        assert_eq!(negotiate_version(&peer), Some("0.3"));
    }

    #[test]
    fn no_intersection_yields_none() {
        let peer = vec!["0.1".to_string()];
        assert_eq!(negotiate_version(&peer), None);
    }

    #[test]
    fn greeting_round_trips() {
        let line = render_greeting(&["0.3"]);
        assert_eq!(parse_greeting(&line).unwrap(), vec!["0.3".to_string()]);
    }

    #[test]
    fn greeting_rejects_missing_crlf() {
        assert!(parse_greeting(b"MTP 0.3\n").is_none());
    }

    #[test]
    fn greeting_rejects_embedded_whitespace() {
        assert!(parse_greeting(b"MTP 0.3, 0.2\r\n").is_none());
    }

    #[test]
    fn send_digest_matches_expected_layout() {
        let body = vec![0u8; PACKET_LEN];
        let d = digest_send(&body);
        assert_eq!(d.len(), DIGEST_LEN);
        assert_eq!(d, digest_send(&body));
        assert_ne!(d, digest_junk(&body));
    }

    #[test]
    fn ack_digest_distinguishes_junk_from_send() {
        let body = vec![7u8; PACKET_LEN];
        assert_ne!(digest_received(&body), digest_received_junk(&body));
        assert_ne!(digest_received(&body), digest_rejected(&body));
    }
}
