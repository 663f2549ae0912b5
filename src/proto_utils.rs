use thiserror::Error;
use tracing::debug;

/// Fixed DNS header size.
pub const DNS_HEADER_LEN: usize = 12;

/// QTYPE and QCLASS trailing each QNAME, without padding.
const QUESTION_FIXED_LEN: usize = 4;

/// Largest DNS message we accept over UDP.
pub const MAX_DNS_MESSAGE_SIZE: usize = 65_535;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("incomplete header ({0} bytes)")]
    ShortHeader(usize),
    #[error("unterminated QNAME")]
    UnterminatedName,
    #[error("truncated QNAME")]
    TruncatedName,
    #[error("truncated QUESTION section")]
    TruncatedQuestion,
}

/// Header fields and question-section extent of a DNS message.
/// Everything past the question section is opaque to the proxy.
#[derive(Debug, PartialEq, Eq)]
pub struct MessageSummary {
    pub query_id: u16,
    /// The QR flag; set on responses.
    pub is_response: bool,
    /// One past the last byte of the question section.
    question_end: usize,
}

impl MessageSummary {
    /// The raw question section, exactly as it appeared on the wire.
    pub fn question<'a>(&self, packet: &'a [u8]) -> &'a [u8] {
        &packet[DNS_HEADER_LEN..self.question_end]
    }
}

/// Parse the fixed header and walk the question section of `packet`.
/// With `log_questions` every QNAME is logged in dotted form, the root
/// as ".".
///
/// There can be multiple questions in a message, or none at all
/// (eg. a dynamic DNS update).  Compression pointers are not followed:
/// a pointer byte reads as an oversized label length and fails the
/// bounds checks, so at worst a compressed question is rejected as
/// truncated.  International names are not decoded either.
pub fn parse_message(packet: &[u8], log_questions: bool) -> Result<MessageSummary, ParseError> {
    if packet.len() < DNS_HEADER_LEN {
        return Err(ParseError::ShortHeader(packet.len()));
    }

    let query_id = u16::from_be_bytes([packet[0], packet[1]]);
    // QR is the high bit of the flags.
    let is_response = packet[2] & 0x80 != 0;
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);

    let mut pos = DNS_HEADER_LEN;
    for _ in 0..qdcount {
        let mut qname = log_questions.then(String::new);

        // A QNAME is a sequence of labels, each preceded by its length
        // in a single byte, terminated by the empty root label.
        loop {
            let llabel = *packet.get(pos).ok_or(ParseError::UnterminatedName)? as usize;
            pos += 1;
            if llabel == 0 {
                break;
            }
            if packet.len() < pos + llabel {
                return Err(ParseError::TruncatedName);
            }
            if let Some(name) = qname.as_mut() {
                if !name.is_empty() {
                    name.push('.');
                }
                name.extend(packet[pos..pos + llabel].iter().map(|&b| b as char));
            }
            pos += llabel;
        }

        if packet.len() < pos + QUESTION_FIXED_LEN {
            return Err(ParseError::TruncatedQuestion);
        }
        pos += QUESTION_FIXED_LEN;

        if let Some(name) = qname {
            let name = if name.is_empty() { "." } else { name.as_str() };
            debug!(query_id, qname = name, "question");
        }
    }

    Ok(MessageSummary {
        query_id,
        is_response,
        question_end: pos,
    })
}

/// Overwrite the transaction ID in place, network byte order.
pub fn set_query_id(packet: &mut [u8], query_id: u16) {
    packet[..2].copy_from_slice(&query_id.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn a_query(id: u16, name: &str) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        msg.to_vec().unwrap()
    }

    #[test]
    fn parses_standard_a_query() {
        let packet = a_query(0x1234, "example.com.");
        let summary = parse_message(&packet, false).unwrap();
        assert_eq!(summary.query_id, 0x1234);
        assert!(!summary.is_response);
        // 13 bytes of QNAME plus QTYPE and QCLASS.
        assert_eq!(summary.question(&packet).len(), 17);
        assert_eq!(summary.question(&packet)[0], 7);
        assert_eq!(&summary.question(&packet)[1..8], b"example");
    }

    #[test]
    fn detects_the_qr_flag() {
        let mut packet = a_query(1, "example.com.");
        assert!(!parse_message(&packet, false).unwrap().is_response);
        packet[2] |= 0x80;
        assert!(parse_message(&packet, false).unwrap().is_response);
    }

    #[test]
    fn empty_question_when_qdcount_is_zero() {
        // Header-only message, eg. the shape of a dynamic update.
        let packet = [0x0A, 0x0B, 0x28, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let summary = parse_message(&packet, false).unwrap();
        assert_eq!(summary.query_id, 0x0A0B);
        assert!(summary.question(&packet).is_empty());
    }

    #[test]
    fn rejects_a_short_header() {
        assert_eq!(
            parse_message(&[0u8; 11], false),
            Err(ParseError::ShortHeader(11))
        );
    }

    #[test]
    fn rejects_an_unterminated_qname() {
        // qdcount = 1, one complete label, then the packet ends before
        // the root label.
        let mut packet = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[3, b'a', b'b', b'c']);
        assert_eq!(
            parse_message(&packet, false),
            Err(ParseError::UnterminatedName)
        );
    }

    #[test]
    fn rejects_a_truncated_label() {
        let mut packet = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[3, b'a', b'b']);
        assert_eq!(parse_message(&packet, false), Err(ParseError::TruncatedName));
    }

    #[test]
    fn rejects_a_truncated_question_section() {
        // Complete root-only QNAME but only two of the four fixed bytes.
        let mut packet = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[0, 0, 1]);
        assert_eq!(
            parse_message(&packet, false),
            Err(ParseError::TruncatedQuestion)
        );
    }

    #[test]
    fn rejects_compression_pointers_as_truncation() {
        // A pointer byte (0xC0) reads as a 192-byte label.
        let mut packet = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1]);
        assert_eq!(parse_message(&packet, false), Err(ParseError::TruncatedName));
    }

    #[test]
    fn multiple_questions_are_walked() {
        let mut msg = Message::new();
        msg.set_id(7);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        // Disjoint names, so the encoder has no suffix to compress.
        msg.add_query(Query::query(
            Name::from_str("one.example.com.").unwrap(),
            RecordType::A,
        ));
        msg.add_query(Query::query(
            Name::from_str("other.test.").unwrap(),
            RecordType::AAAA,
        ));
        let packet = msg.to_vec().unwrap();
        let summary = parse_message(&packet, true).unwrap();
        assert_eq!(summary.question(&packet).len(), packet.len() - DNS_HEADER_LEN);
    }

    #[test]
    fn set_query_id_rewrites_only_the_id() {
        let packet = a_query(0x1111, "example.com.");
        let mut rewritten = packet.clone();
        set_query_id(&mut rewritten, 0xBEEF);
        assert_eq!(u16::from_be_bytes([rewritten[0], rewritten[1]]), 0xBEEF);
        assert_eq!(&rewritten[2..], &packet[2..]);
    }
}
