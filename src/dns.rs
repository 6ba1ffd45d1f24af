//! DNS message parsing and construction.
//!
//! Covers exactly what the proxy needs: parsing inbound queries, encoding
//! the queries it sends upstream, building answers from resolved addresses
//! and pulling A/AAAA records back out of upstream responses. Anything
//! fancier (EDNS0, other record types) is out of scope.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const HEADER_LEN: usize = 12;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_PACKET_SIZE: usize = 4096;

/// A record (IPv4 address) type code.
pub const QTYPE_A: u16 = 1;
/// AAAA record (IPv6 address) type code.
pub const QTYPE_AAAA: u16 = 28;

const CLASS_IN: u16 = 1;

/// Fixed TTL stamped on answer records; upstream TTLs are not propagated.
const ANSWER_TTL: u32 = 300;

/// A parsed DNS query.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuery {
    /// Parse a DNS query from raw bytes.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN + 1 {
            return None;
        }

        let id = u16::from_be_bytes([data[0], data[1]]);

        // Parse domain name
        let mut pos = HEADER_LEN;
        let mut domain_parts = Vec::new();

        while pos < data.len() {
            let label_len = data[pos] as usize;
            if label_len == 0 {
                pos += 1;
                break;
            }
            pos += 1;
            if pos + label_len > data.len() {
                return None;
            }
            let label = std::str::from_utf8(&data[pos..pos + label_len]).ok()?;
            domain_parts.push(label.to_string());
            pos += label_len;
        }

        if domain_parts.is_empty() {
            return None;
        }

        // Parse QTYPE and QCLASS
        if pos + 4 > data.len() {
            return None;
        }
        let qtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let qclass = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);

        Some(Self {
            id,
            domain: domain_parts.join(".").to_lowercase(),
            qtype,
            qclass,
        })
    }
}

/// Encode a single-question query with recursion desired.
pub fn encode_query(id: u16, domain: &str, qtype: u16) -> Vec<u8> {
    let mut data = Vec::with_capacity(HEADER_LEN + domain.len() + 6);

    data.extend_from_slice(&id.to_be_bytes());
    data.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    data.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    data.extend_from_slice(&[0x00, 0x00]); // ANCOUNT
    data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
    data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

    encode_domain(&mut data, domain);
    data.extend_from_slice(&qtype.to_be_bytes());
    data.extend_from_slice(&CLASS_IN.to_be_bytes());

    data
}

/// A DNS response.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
}

/// A DNS question section entry.
#[derive(Debug, Clone)]
pub struct DnsQuestion {
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A DNS resource record.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsResponse {
    /// Build an answer for `query` carrying the given addresses.
    ///
    /// IPv4 addresses become A records, IPv6 addresses AAAA records. An
    /// empty slice produces a NOERROR reply with no answers.
    pub fn answer(query: &DnsQuery, addresses: &[IpAddr]) -> Self {
        let answers = addresses
            .iter()
            .map(|ip| {
                let (rtype, rdata) = match ip {
                    IpAddr::V4(v4) => (QTYPE_A, v4.octets().to_vec()),
                    IpAddr::V6(v6) => (QTYPE_AAAA, v6.octets().to_vec()),
                };
                DnsRecord {
                    name: query.domain.clone(),
                    rtype,
                    class: CLASS_IN,
                    ttl: ANSWER_TTL,
                    rdata,
                }
            })
            .collect();

        Self {
            id: query.id,
            flags: 0x8180, // Standard response, recursion available, no error
            questions: vec![DnsQuestion {
                domain: query.domain.clone(),
                qtype: query.qtype,
                qclass: query.qclass,
            }],
            answers,
        }
    }

    /// Encode the response to wire format bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(512);

        // Header
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        data.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        data.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        // Questions
        for q in &self.questions {
            encode_domain(&mut data, &q.domain);
            data.extend_from_slice(&q.qtype.to_be_bytes());
            data.extend_from_slice(&q.qclass.to_be_bytes());
        }

        // Answers
        for a in &self.answers {
            // Use compression pointer if this is the first question's domain
            if !self.questions.is_empty() && a.name == self.questions[0].domain {
                data.extend_from_slice(&[0xC0, 0x0C]); // Pointer to offset 12
            } else {
                encode_domain(&mut data, &a.name);
            }
            data.extend_from_slice(&a.rtype.to_be_bytes());
            data.extend_from_slice(&a.class.to_be_bytes());
            data.extend_from_slice(&a.ttl.to_be_bytes());
            data.extend_from_slice(&(a.rdata.len() as u16).to_be_bytes());
            data.extend_from_slice(&a.rdata);
        }

        data
    }
}

fn encode_domain(buf: &mut Vec<u8>, domain: &str) {
    for label in domain.split('.') {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

/// The parts of an upstream response the resolver cares about.
#[derive(Debug)]
pub struct ResponseSummary {
    pub id: u16,
    pub rcode: u8,
    pub addresses: Vec<IpAddr>,
}

/// Parse a response, pulling every A/AAAA answer record out of it.
///
/// Returns `None` for packets too short to carry a header, packets that are
/// not responses, and packets truncated mid-record. Records of other types
/// are skipped, not errors.
pub fn parse_response(data: &[u8]) -> Option<ResponseSummary> {
    if data.len() < HEADER_LEN {
        return None;
    }

    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);
    if flags & 0x8000 == 0 {
        return None; // not a response
    }
    let rcode = (flags & 0x000F) as u8;

    let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
    let ancount = u16::from_be_bytes([data[6], data[7]]) as usize;

    let mut pos = HEADER_LEN;

    // Skip question section
    for _ in 0..qdcount {
        pos = skip_name(data, pos)?;
        pos += 4; // QTYPE + QCLASS
        if pos > data.len() {
            return None;
        }
    }

    let mut addresses = Vec::new();

    for _ in 0..ancount {
        pos = skip_name(data, pos)?;
        if pos + 10 > data.len() {
            return None;
        }

        let rtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let rdlength = u16::from_be_bytes([data[pos + 8], data[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > data.len() {
            return None;
        }

        match (rtype, rdlength) {
            (QTYPE_A, 4) => {
                let octets: [u8; 4] = data[pos..pos + 4].try_into().ok()?;
                addresses.push(IpAddr::V4(Ipv4Addr::from(octets)));
            }
            (QTYPE_AAAA, 16) => {
                let octets: [u8; 16] = data[pos..pos + 16].try_into().ok()?;
                addresses.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            _ => {}
        }
        pos += rdlength;
    }

    Some(ResponseSummary {
        id,
        rcode,
        addresses,
    })
}

/// Advance past a (possibly compressed) name starting at `pos`.
fn skip_name(data: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let b = *data.get(pos)?;
        if b == 0 {
            return Some(pos + 1);
        }
        if b >= 0xC0 {
            // A compression pointer ends the name
            return Some(pos + 2);
        }
        pos += 1 + b as usize;
    }
}
