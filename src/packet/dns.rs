//! DNS response decoding
//!
//! Just enough of RFC 1035 to snoop answers: the first question's name and
//! every A record in the answer section. Anything malformed is treated as
//! not-a-response and ignored by the caller.

use std::net::Ipv4Addr;

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

/// The decoded interesting part of a DNS response.
#[derive(Debug, PartialEq, Eq)]
pub struct Answers {
    /// First question name, without the trailing dot.
    pub name: String,
    /// Every A-record address in the answer section.
    pub addresses: Vec<Ipv4Addr>,
}

fn word(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([
        *data.get(offset)?,
        *data.get(offset + 1)?,
    ]))
}

/// Read a possibly-compressed name starting at `offset`, returning the name
/// and the offset just past it. Pointer chains are bounded to keep crafted
/// packets from looping.
fn read_name(data: &[u8], mut offset: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut end = None;
    let mut jumps = 0;

    loop {
        let length = *data.get(offset)? as usize;
        if length == 0 {
            return Some((name, end.unwrap_or(offset + 1)));
        }
        if length & 0xc0 == 0xc0 {
            let pointer = (word(data, offset)? & 0x3fff) as usize;
            end.get_or_insert(offset + 2);
            jumps += 1;
            if jumps > 32 || pointer >= data.len() {
                return None;
            }
            offset = pointer;
            continue;
        }
        if length > 63 {
            return None;
        }
        let label = data.get(offset + 1..offset + 1 + length)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        offset += 1 + length;
    }
}

/// Decode a DNS response payload. Returns `None` unless the payload parses
/// as a successful response carrying at least a question.
pub fn answers(payload: &[u8]) -> Option<Answers> {
    let flags = word(payload, 2)?;
    if flags & 0x8000 == 0 || flags & 0x000f != 0 {
        return None; // not a response, or a non-zero rcode
    }
    let questions = word(payload, 4)?;
    let answer_count = word(payload, 6)?;
    if questions == 0 {
        return None;
    }

    let mut offset = 12;
    let mut name = None;
    for _ in 0..questions {
        let (question, next) = read_name(payload, offset)?;
        name.get_or_insert(question);
        offset = next + 4; // qtype + qclass
    }
    let name = name?;
    if name.is_empty() {
        return None;
    }

    let mut addresses = Vec::new();
    for _ in 0..answer_count {
        let (_, next) = read_name(payload, offset)?;
        let rr_type = word(payload, next)?;
        let rr_class = word(payload, next + 2)?;
        let rd_length = word(payload, next + 8)? as usize;
        let rdata = payload.get(next + 10..next + 10 + rd_length)?;
        if rr_type == TYPE_A && rr_class == CLASS_IN && rd_length == 4 {
            addresses.push(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]));
        }
        offset = next + 10 + rd_length;
    }

    Some(Answers { name, addresses })
}
