//! mDNS wire format: strict query parsing and response encoding.
//!
//! Parsing leans on `dns-parser`; the acceptance rules layered on top are
//! deliberately narrow (class INET, types A/AAAA/ANY, `.local.` names only,
//! bounded counts and sizes) and everything outside them is rejected as a
//! security event by the caller. Responses are encoded by hand: the
//! responder only ever emits authoritative A/AAAA answers.

use std::net::IpAddr;

use dns_parser::{Opcode, Packet, QueryClass, QueryType, RData};

/// Datagrams outside these bounds are dropped unread.
pub const MIN_PACKET_SIZE: usize = 12;
pub const MAX_PACKET_SIZE: usize = 1500;
/// Responses above this size are dropped rather than truncated.
pub const MAX_RESPONSE_SIZE: usize = 512;
pub const RECORD_TTL: u32 = 120;

pub const MAX_QUESTIONS: usize = 10;
pub const MAX_EXTRA_RECORDS: usize = 100;

const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;
const TYPE_ANY: u16 = 255;
const CLASS_IN: u16 = 0x0001;
/// IN with the mDNS cache-flush bit.
const CLASS_IN_FLUSH: u16 = 0x8001;
/// QR + AA: an authoritative response.
const FLAGS_AUTHORITATIVE_RESPONSE: u16 = 0x8400;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet of {size} bytes below minimum")]
    TooSmall { size: usize },
    #[error("packet of {size} bytes above maximum")]
    TooLarge { size: usize },
    #[error("malformed DNS message")]
    Malformed,
    #[error("non-query opcode")]
    BadOpcode,
    #[error("{count} questions exceeds limit")]
    TooManyQuestions { count: usize },
    #[error("non-probe query carries answers")]
    AnswersInQuery,
    #[error("{count} extra records exceeds limit")]
    TooManyExtras { count: usize },
    #[error("question class is not INET")]
    BadClass,
    #[error("unsupported query type")]
    UnsupportedType,
    #[error("question name is outside .local.")]
    NotLocal,
    #[error("name {name:?} does not fit in a DNS message")]
    BadName { name: String },
    #[error("encoded response of {size} bytes exceeds {MAX_RESPONSE_SIZE}")]
    Oversized { size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    A,
    Aaaa,
    Any,
}

impl QueryKind {
    pub fn wants_a(self) -> bool {
        matches!(self, QueryKind::A | QueryKind::Any)
    }

    pub fn wants_aaaa(self) -> bool {
        matches!(self, QueryKind::Aaaa | QueryKind::Any)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdnsQuestion {
    /// Normalized: lowercase, no trailing dot.
    pub name: String,
    pub kind: QueryKind,
    /// The QU bit: the querier prefers a unicast reply.
    pub unicast_reply: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub id: u16,
    pub questions: Vec<MdnsQuestion>,
    /// RFC 6762 §8.1 probing query: the answer section carries the records
    /// the querier proposes to own.
    pub probe: bool,
}

/// An address record seen in a message, `(owner name, address)`.
pub type AnswerRecord = (String, IpAddr);

/// A successfully parsed inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Query(ParsedQuery),
    /// Another responder's answer; fed to the conflict detector.
    Response(Vec<AnswerRecord>),
}

pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn address_records<'a>(
    records: impl Iterator<Item = &'a dns_parser::ResourceRecord<'a>>,
) -> Vec<AnswerRecord> {
    records
        .filter_map(|record| {
            let ip = match record.data {
                RData::A(a) => IpAddr::V4(a.0),
                RData::AAAA(aaaa) => IpAddr::V6(aaaa.0),
                _ => return None,
            };
            Some((normalize_name(&record.name.to_string()), ip))
        })
        .collect()
}

/// Parses and validates one datagram according to the responder's
/// acceptance rules.
pub fn parse_packet(data: &[u8]) -> Result<Inbound, PacketError> {
    if data.len() < MIN_PACKET_SIZE {
        return Err(PacketError::TooSmall { size: data.len() });
    }
    if data.len() > MAX_PACKET_SIZE {
        return Err(PacketError::TooLarge { size: data.len() });
    }

    let packet = Packet::parse(data).map_err(|_| PacketError::Malformed)?;

    if !packet.header.query {
        return Ok(Inbound::Response(address_records(packet.answers.iter())));
    }

    if packet.header.opcode != Opcode::StandardQuery {
        return Err(PacketError::BadOpcode);
    }
    if packet.questions.len() > MAX_QUESTIONS {
        return Err(PacketError::TooManyQuestions {
            count: packet.questions.len(),
        });
    }
    let extras = packet.nameservers.len() + packet.additional.len();
    if extras > MAX_EXTRA_RECORDS {
        return Err(PacketError::TooManyExtras { count: extras });
    }

    let mut questions = Vec::with_capacity(packet.questions.len());
    for question in &packet.questions {
        if question.qclass != QueryClass::IN {
            return Err(PacketError::BadClass);
        }
        let kind = match question.qtype {
            QueryType::A => QueryKind::A,
            QueryType::AAAA => QueryKind::Aaaa,
            QueryType::All => QueryKind::Any,
            _ => return Err(PacketError::UnsupportedType),
        };
        let name = normalize_name(&question.qname.to_string());
        if name != "local" && !name.ends_with(".local") {
            return Err(PacketError::NotLocal);
        }
        questions.push(MdnsQuestion {
            name,
            kind,
            unicast_reply: question.prefer_unicast,
        });
    }

    let probe = if packet.answers.is_empty() {
        false
    } else {
        // Probing queries propose records for the very names they ask
        // about; anything else with a filled answer section is invalid.
        let proposed = packet
            .answers
            .iter()
            .all(|answer| {
                let owner = normalize_name(&answer.name.to_string());
                questions.iter().any(|q| q.name == owner)
            });
        if !proposed {
            return Err(PacketError::AnswersInQuery);
        }
        true
    };

    Ok(Inbound::Query(ParsedQuery {
        id: packet.header.id,
        questions,
        probe,
    }))
}

/// One address record in an outgoing response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    pub name: String,
    pub ip: IpAddr,
}

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn push_name(buf: &mut Vec<u8>, name: &str) -> Result<(), PacketError> {
    let bad = || PacketError::BadName {
        name: name.to_string(),
    };
    let mut total = 0usize;
    for label in name.trim_end_matches('.').split('.') {
        let bytes = label.as_bytes();
        if bytes.is_empty() || bytes.len() > 63 {
            return Err(bad());
        }
        total += bytes.len() + 1;
        if total > 255 {
            return Err(bad());
        }
        buf.push(bytes.len() as u8);
        buf.extend_from_slice(bytes);
    }
    buf.push(0);
    Ok(())
}

/// Encodes an authoritative response. `id` is zero for multicast responses
/// and the query id for unicast ones. TTL zero announces a withdrawn name.
pub fn encode_response(
    id: u16,
    records: &[ResponseRecord],
    ttl: u32,
) -> Result<Vec<u8>, PacketError> {
    let mut buf = Vec::with_capacity(MIN_PACKET_SIZE + records.len() * 32);
    push_u16(&mut buf, id);
    push_u16(&mut buf, FLAGS_AUTHORITATIVE_RESPONSE);
    push_u16(&mut buf, 0); // questions
    push_u16(&mut buf, records.len() as u16);
    push_u16(&mut buf, 0); // authority
    push_u16(&mut buf, 0); // additional

    for record in records {
        push_name(&mut buf, &record.name)?;
        match record.ip {
            IpAddr::V4(v4) => {
                push_u16(&mut buf, TYPE_A);
                push_u16(&mut buf, CLASS_IN_FLUSH);
                push_u32(&mut buf, ttl);
                push_u16(&mut buf, 4);
                buf.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                push_u16(&mut buf, TYPE_AAAA);
                push_u16(&mut buf, CLASS_IN_FLUSH);
                push_u32(&mut buf, ttl);
                push_u16(&mut buf, 16);
                buf.extend_from_slice(&v6.octets());
            }
        }
    }

    if buf.len() > MAX_RESPONSE_SIZE {
        return Err(PacketError::Oversized { size: buf.len() });
    }
    Ok(buf)
}

/// Encodes a plain query, used for probing with [`QueryKind::Any`].
pub fn encode_query(name: &str, kind: QueryKind) -> Result<Vec<u8>, PacketError> {
    let qtype = match kind {
        QueryKind::A => TYPE_A,
        QueryKind::Aaaa => TYPE_AAAA,
        QueryKind::Any => TYPE_ANY,
    };
    let mut buf = Vec::with_capacity(MIN_PACKET_SIZE + name.len() + 6);
    push_u16(&mut buf, 0); // id
    push_u16(&mut buf, 0); // flags: standard query
    push_u16(&mut buf, 1); // questions
    push_u16(&mut buf, 0);
    push_u16(&mut buf, 0);
    push_u16(&mut buf, 0);
    push_name(&mut buf, name)?;
    push_u16(&mut buf, qtype);
    push_u16(&mut buf, CLASS_IN);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn probe_query_round_trips() {
        let bytes = encode_query("piccolo.local", QueryKind::Any).unwrap();
        match parse_packet(&bytes).unwrap() {
            Inbound::Query(query) => {
                assert_eq!(query.questions.len(), 1);
                assert_eq!(query.questions[0].name, "piccolo.local");
                assert_eq!(query.questions[0].kind, QueryKind::Any);
                assert!(!query.probe);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn response_round_trips_via_parser() {
        let records = vec![
            ResponseRecord {
                name: "piccolo.local".to_string(),
                ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            },
            ResponseRecord {
                name: "piccolo.local".to_string(),
                ip: IpAddr::V6("fe80::1".parse::<Ipv6Addr>().unwrap()),
            },
        ];
        let bytes = encode_response(0, &records, RECORD_TTL).unwrap();
        match parse_packet(&bytes).unwrap() {
            Inbound::Response(answers) => {
                assert_eq!(answers.len(), 2);
                assert_eq!(answers[0].0, "piccolo.local");
                assert_eq!(answers[0].1, records[0].ip);
                assert_eq!(answers[1].1, records[1].ip);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn size_bounds_are_enforced() {
        assert_eq!(
            parse_packet(&[0u8; 4]),
            Err(PacketError::TooSmall { size: 4 })
        );
        assert_eq!(
            parse_packet(&[0u8; 2000]),
            Err(PacketError::TooLarge { size: 2000 })
        );
    }

    #[test]
    fn non_local_names_are_rejected() {
        let bytes = encode_query("printer.example.com", QueryKind::A).unwrap();
        assert_eq!(parse_packet(&bytes), Err(PacketError::NotLocal));
    }

    #[test]
    fn unsupported_types_are_rejected() {
        // Hand-build a PTR query for a .local name.
        let mut buf = Vec::new();
        for v in [0u16, 0, 1, 0, 0, 0] {
            buf.extend_from_slice(&v.to_be_bytes());
        }
        push_name(&mut buf, "piccolo.local").unwrap();
        buf.extend_from_slice(&12u16.to_be_bytes()); // PTR
        buf.extend_from_slice(&1u16.to_be_bytes());
        assert_eq!(parse_packet(&buf), Err(PacketError::UnsupportedType));
    }

    #[test]
    fn too_many_questions_are_rejected() {
        let mut buf = Vec::new();
        for v in [0u16, 0, 11, 0, 0, 0] {
            buf.extend_from_slice(&v.to_be_bytes());
        }
        for _ in 0..11 {
            push_name(&mut buf, "piccolo.local").unwrap();
            buf.extend_from_slice(&1u16.to_be_bytes());
            buf.extend_from_slice(&1u16.to_be_bytes());
        }
        assert_eq!(
            parse_packet(&buf),
            Err(PacketError::TooManyQuestions { count: 11 })
        );
    }

    fn probe_with_answer(question_name: &str, answer_name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        for v in [0u16, 0, 1, 1, 0, 0] {
            buf.extend_from_slice(&v.to_be_bytes());
        }
        push_name(&mut buf, question_name).unwrap();
        buf.extend_from_slice(&TYPE_ANY.to_be_bytes());
        buf.extend_from_slice(&CLASS_IN.to_be_bytes());
        push_name(&mut buf, answer_name).unwrap();
        buf.extend_from_slice(&TYPE_A.to_be_bytes());
        buf.extend_from_slice(&CLASS_IN.to_be_bytes());
        buf.extend_from_slice(&120u32.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes());
        buf.extend_from_slice(&[192, 0, 2, 5]);
        buf
    }

    #[test]
    fn probing_queries_with_proposed_answers_are_accepted() {
        let buf = probe_with_answer("piccolo.local", "piccolo.local");
        match parse_packet(&buf).unwrap() {
            Inbound::Query(query) => {
                assert!(query.probe);
                assert_eq!(query.questions[0].kind, QueryKind::Any);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn queries_with_unrelated_answers_are_rejected() {
        let buf = probe_with_answer("piccolo.local", "other.local");
        assert_eq!(parse_packet(&buf), Err(PacketError::AnswersInQuery));
    }

    #[test]
    fn oversized_response_is_refused() {
        let records: Vec<ResponseRecord> = (0..40)
            .map(|i| ResponseRecord {
                name: format!("very-long-host-name-number-{i:03}.local"),
                ip: IpAddr::V6(Ipv6Addr::LOCALHOST),
            })
            .collect();
        assert!(matches!(
            encode_response(0, &records, RECORD_TTL),
            Err(PacketError::Oversized { .. })
        ));
    }

    #[test]
    fn goodbye_uses_zero_ttl() {
        let record = ResponseRecord {
            name: "piccolo.local".to_string(),
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        };
        let bytes = encode_response(0, std::slice::from_ref(&record), 0).unwrap();
        let packet = dns_parser::Packet::parse(&bytes).unwrap();
        assert_eq!(packet.answers[0].ttl, 0);
    }

    #[test]
    fn name_normalization() {
        assert_eq!(normalize_name("Piccolo.Local."), "piccolo.local");
        assert_eq!(normalize_name("piccolo.local"), "piccolo.local");
    }

    #[test]
    fn labels_too_long_are_rejected() {
        let long = format!("{}.local", "a".repeat(64));
        assert!(matches!(
            encode_query(&long, QueryKind::A),
            Err(PacketError::BadName { .. })
        ));
    }
}
