//! DNS message encoding and decoding.
//!
//! Covers what the scheduler needs to branch on: the header, the question
//! section, and resource records. Names inside well-known record data are
//! expanded while decoding so records from different messages compare equal.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::Error;

pub const HEADER_LEN: usize = 12;

/// The Internet class.
pub const CLASS_IN: u16 = 1;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;
const MAX_POINTER_HOPS: usize = 32;

const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;
const FLAG_TRUNCATED: u16 = 0x0200;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;
const FLAG_RECURSION_AVAILABLE: u16 = 0x0080;

/// A resource record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordType(pub u16);

impl RecordType {
    pub const A: Self = Self(1);
    pub const NS: Self = Self(2);
    pub const CNAME: Self = Self(5);
    pub const SOA: Self = Self(6);
    pub const PTR: Self = Self(12);
    pub const MX: Self = Self(15);
    pub const TXT: Self = Self(16);
    pub const AAAA: Self = Self(28);
    pub const SRV: Self = Self(33);
    pub const IXFR: Self = Self(251);
    pub const AXFR: Self = Self(252);
    pub const ANY: Self = Self(255);

    const NAMED: [(Self, &'static str); 12] = [
        (Self::A, "A"),
        (Self::NS, "NS"),
        (Self::CNAME, "CNAME"),
        (Self::SOA, "SOA"),
        (Self::PTR, "PTR"),
        (Self::MX, "MX"),
        (Self::TXT, "TXT"),
        (Self::AAAA, "AAAA"),
        (Self::SRV, "SRV"),
        (Self::IXFR, "IXFR"),
        (Self::AXFR, "AXFR"),
        (Self::ANY, "ANY"),
    ];

    /// Returns true for AXFR and IXFR.
    pub fn is_zone_transfer(self) -> bool {
        matches!(self, Self::AXFR | Self::IXFR)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Self::NAMED.iter().find(|(t, _)| t == self) {
            Some((_, name)) => f.write_str(name),
            None => write!(f, "TYPE{}", self.0),
        }
    }
}

impl FromStr for RecordType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        if let Some((t, _)) = Self::NAMED.iter().find(|(_, name)| *name == upper) {
            return Ok(*t);
        }
        upper
            .strip_prefix("TYPE")
            .and_then(|n| n.parse().ok())
            .map(Self)
            .ok_or_else(|| Error::UnknownType(s.to_string()))
    }
}

/// Response code carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rcode {
    #[default]
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    Other(u8),
}

impl Rcode {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            0 => Self::NoError,
            1 => Self::FormErr,
            2 => Self::ServFail,
            3 => Self::NxDomain,
            4 => Self::NotImp,
            5 => Self::Refused,
            other => Self::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::NoError => 0,
            Self::FormErr => 1,
            Self::ServFail => 2,
            Self::NxDomain => 3,
            Self::NotImp => 4,
            Self::Refused => 5,
            Self::Other(v) => v & 0x0F,
        }
    }

    /// A hard error aborts the exchange. NXDOMAIN is an answer, not an error.
    pub fn is_hard_error(self) -> bool {
        !matches!(self, Self::NoError | Self::NxDomain)
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoError => f.write_str("NOERROR"),
            Self::FormErr => f.write_str("FORMERR"),
            Self::ServFail => f.write_str("SERVFAIL"),
            Self::NxDomain => f.write_str("NXDOMAIN"),
            Self::NotImp => f.write_str("NOTIMP"),
            Self::Refused => f.write_str("REFUSED"),
            Self::Other(v) => write!(f, "RCODE{}", v),
        }
    }
}

/// A DNS message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub id: u16,
    pub response: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: Rcode,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    /// Header for a standard query with recursion desired.
    pub fn query(id: u16) -> Self {
        Self {
            id,
            recursion_desired: true,
            ..Default::default()
        }
    }

    /// Header for a response to the query with the given id.
    pub fn response(id: u16, rcode: Rcode) -> Self {
        Self {
            id,
            response: true,
            rcode,
            ..Default::default()
        }
    }

    fn flags(&self) -> u16 {
        let mut flags = (u16::from(self.opcode & 0x0F) << 11) | u16::from(self.rcode.to_u8());
        if self.response {
            flags |= FLAG_RESPONSE;
        }
        if self.authoritative {
            flags |= FLAG_AUTHORITATIVE;
        }
        if self.truncated {
            flags |= FLAG_TRUNCATED;
        }
        if self.recursion_desired {
            flags |= FLAG_RECURSION_DESIRED;
        }
        if self.recursion_available {
            flags |= FLAG_RECURSION_AVAILABLE;
        }
        flags
    }

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        let word = |at: usize| u16::from_be_bytes([data[at], data[at + 1]]);
        let flags = word(2);

        Some(Self {
            id: word(0),
            response: flags & FLAG_RESPONSE != 0,
            opcode: ((flags >> 11) & 0x0F) as u8,
            authoritative: flags & FLAG_AUTHORITATIVE != 0,
            truncated: flags & FLAG_TRUNCATED != 0,
            recursion_desired: flags & FLAG_RECURSION_DESIRED != 0,
            recursion_available: flags & FLAG_RECURSION_AVAILABLE != 0,
            rcode: Rcode::from_u8((flags & 0x0F) as u8),
            qdcount: word(4),
            ancount: word(6),
            nscount: word(8),
            arcount: word(10),
        })
    }
}

/// The question a caller wants answered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuestionRecord {
    /// Lower-case name without the trailing dot; the root is empty.
    pub name: String,
    pub qtype: RecordType,
    pub qclass: u16,
}

impl QuestionRecord {
    /// Creates an IN-class question, normalising and validating the name.
    pub fn new(name: &str, qtype: RecordType) -> Result<Self, Error> {
        let name = normalize_name(name);
        if name.len() > MAX_NAME_LEN
            || name
                .split('.')
                .any(|label| label.len() > MAX_LABEL_LEN || (label.is_empty() && !name.is_empty()))
        {
            return Err(Error::InvalidName(name));
        }

        Ok(Self {
            name,
            qtype,
            qclass: CLASS_IN,
        })
    }
}

impl fmt::Display for QuestionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}. {}", self.name, self.qtype)
    }
}

/// A resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: RecordType,
    pub class: u16,
    pub ttl: u32,
    /// Record data with embedded names in uncompressed wire form.
    pub data: Vec<u8>,
}

impl Record {
    /// Returns the serial of an SOA record.
    pub fn soa_serial(&self) -> Option<u32> {
        if self.rtype != RecordType::SOA {
            return None;
        }
        let mut pos = skip_uncompressed_name(&self.data, 0)?;
        pos = skip_uncompressed_name(&self.data, pos)?;
        let serial = self.data.get(pos..pos + 4)?;
        Some(u32::from_be_bytes([serial[0], serial[1], serial[2], serial[3]]))
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}. {} IN {} ", self.name, self.ttl, self.rtype)?;
        let data = &self.data;
        match self.rtype {
            RecordType::A if data.len() == 4 => {
                write!(f, "{}", Ipv4Addr::new(data[0], data[1], data[2], data[3]))
            }
            RecordType::AAAA if data.len() == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(data);
                write!(f, "{}", Ipv6Addr::from(octets))
            }
            RecordType::NS | RecordType::CNAME | RecordType::PTR => {
                match read_uncompressed_name(data, 0) {
                    Some((name, _)) => write!(f, "{}.", name),
                    None => write_hex(f, data),
                }
            }
            RecordType::SOA => match self.soa_serial() {
                Some(serial) => write!(f, "serial {}", serial),
                None => write_hex(f, data),
            },
            _ => write_hex(f, data),
        }
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, data: &[u8]) -> fmt::Result {
    write!(f, "\\# {} ", data.len())?;
    for b in data {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

/// A decoded DNS message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<QuestionRecord>,
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
    pub additional: Vec<Record>,
}

impl Message {
    /// Total number of resource records in all sections.
    pub fn record_count(&self) -> usize {
        self.answers.len() + self.authority.len() + self.additional.len()
    }
}

/// Encode a message. Section counts are taken from the slices, all records
/// go into the answer section.
pub fn encode(header: &Header, questions: &[QuestionRecord], records: &[Record]) -> Vec<u8> {
    let mut data = Vec::with_capacity(512);

    data.extend_from_slice(&header.id.to_be_bytes());
    data.extend_from_slice(&header.flags().to_be_bytes());
    data.extend_from_slice(&(questions.len() as u16).to_be_bytes());
    data.extend_from_slice(&(records.len() as u16).to_be_bytes());
    data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
    data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

    for q in questions {
        write_name(&mut data, &q.name);
        data.extend_from_slice(&q.qtype.0.to_be_bytes());
        data.extend_from_slice(&q.qclass.to_be_bytes());
    }

    for r in records {
        write_name(&mut data, &r.name);
        data.extend_from_slice(&r.rtype.0.to_be_bytes());
        data.extend_from_slice(&r.class.to_be_bytes());
        data.extend_from_slice(&r.ttl.to_be_bytes());
        data.extend_from_slice(&(r.data.len() as u16).to_be_bytes());
        data.extend_from_slice(&r.data);
    }

    data
}

/// Decode a message. Returns `None` if it is malformed in any way, including
/// when the header counts disagree with the sections or bytes are left over.
pub fn decode(data: &[u8]) -> Option<Message> {
    let header = Header::parse(data)?;
    let mut pos = HEADER_LEN;

    let mut questions = Vec::with_capacity(usize::from(header.qdcount).min(4));
    for _ in 0..header.qdcount {
        let (name, next) = read_name(data, pos)?;
        let fixed = data.get(next..next + 4)?;
        questions.push(QuestionRecord {
            name,
            qtype: RecordType(u16::from_be_bytes([fixed[0], fixed[1]])),
            qclass: u16::from_be_bytes([fixed[2], fixed[3]]),
        });
        pos = next + 4;
    }

    let mut sections = [Vec::new(), Vec::new(), Vec::new()];
    let counts = [header.ancount, header.nscount, header.arcount];
    for (section, count) in sections.iter_mut().zip(counts) {
        for _ in 0..count {
            let (record, next) = read_record(data, pos)?;
            section.push(record);
            pos = next;
        }
    }

    if pos != data.len() {
        return None;
    }

    let [answers, authority, additional] = sections;
    Some(Message {
        header,
        questions,
        answers,
        authority,
        additional,
    })
}

fn read_record(data: &[u8], pos: usize) -> Option<(Record, usize)> {
    let (name, pos) = read_name(data, pos)?;
    let fixed = data.get(pos..pos + 10)?;
    let rtype = RecordType(u16::from_be_bytes([fixed[0], fixed[1]]));
    let class = u16::from_be_bytes([fixed[2], fixed[3]]);
    let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
    let rdlength = usize::from(u16::from_be_bytes([fixed[8], fixed[9]]));

    let start = pos + 10;
    let end = start + rdlength;
    if end > data.len() {
        return None;
    }
    let rdata = expand_rdata(data, rtype, start, end)?;

    Some((
        Record {
            name,
            rtype,
            class,
            ttl,
            data: rdata,
        },
        end,
    ))
}

/// Copy record data, expanding compressed names for types that embed them.
fn expand_rdata(data: &[u8], rtype: RecordType, start: usize, end: usize) -> Option<Vec<u8>> {
    // (fixed bytes before the names, number of names, fixed bytes after)
    let layout = match rtype {
        RecordType::NS | RecordType::CNAME | RecordType::PTR => (0, 1, 0),
        RecordType::MX => (2, 1, 0),
        RecordType::SRV => (6, 1, 0),
        RecordType::SOA => (0, 2, 20),
        _ => return Some(data[start..end].to_vec()),
    };
    let (prefix, names, suffix) = layout;

    let mut out = Vec::with_capacity(end - start + 32);
    let mut pos = start;
    out.extend_from_slice(data.get(pos..pos + prefix)?);
    pos += prefix;
    for _ in 0..names {
        let (name, next) = read_name(data, pos)?;
        if next > end {
            return None;
        }
        write_name(&mut out, &name);
        pos = next;
    }
    if pos + suffix != end {
        return None;
    }
    out.extend_from_slice(&data[pos..end]);

    Some(out)
}

/// Read a possibly compressed name, returning it and the position after it.
fn read_name(data: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut resume = None;
    let mut hops = 0;
    let mut len = 0;

    loop {
        let b = *data.get(pos)?;
        match b & 0xC0 {
            0x00 if b == 0 => {
                pos += 1;
                break;
            }
            0x00 => {
                let label_len = usize::from(b);
                let label = data.get(pos + 1..pos + 1 + label_len)?;
                len += label_len + 1;
                if len > MAX_NAME_LEN + 1 {
                    return None;
                }
                labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
                pos += 1 + label_len;
            }
            0xC0 => {
                let low = *data.get(pos + 1)?;
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return None;
                }
                if resume.is_none() {
                    resume = Some(pos + 2);
                }
                pos = usize::from(u16::from_be_bytes([b & 0x3F, low]));
            }
            _ => return None,
        }
    }

    Some((labels.join("."), resume.unwrap_or(pos)))
}

fn read_uncompressed_name(data: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut labels = Vec::new();
    loop {
        let len = usize::from(*data.get(pos)?);
        if len == 0 {
            return Some((labels.join("."), pos + 1));
        }
        if len > MAX_LABEL_LEN {
            return None;
        }
        labels.push(String::from_utf8_lossy(data.get(pos + 1..pos + 1 + len)?).into_owned());
        pos += 1 + len;
    }
}

fn skip_uncompressed_name(data: &[u8], pos: usize) -> Option<usize> {
    read_uncompressed_name(data, pos).map(|(_, next)| next)
}

/// Write a name as uncompressed labels.
pub fn write_name(buf: &mut Vec<u8>, name: &str) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        let label = &label.as_bytes()[..label.len().min(MAX_LABEL_LEN)];
        buf.push(label.len() as u8);
        buf.extend_from_slice(label);
    }
    buf.push(0);
}

fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}
