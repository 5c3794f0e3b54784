//! DNS wire format: just enough to read a question and write an authoritative reply.

use crate::types::{DnsHeader, DnsMessage, DnsQuestion, HeaderFlags, QType, RData, Rcode, Record};
use thiserror::Error;

pub const HEADER_LEN: usize = 12;
pub const MAX_UDP_PAYLOAD: usize = 512;
const CLASS_IN: u16 = 1;
const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message too short ({0} bytes)")]
    Short(usize),
    #[error("message carries no question")]
    NoQuestion,
    #[error("malformed name at offset {0}")]
    BadName(usize),
    #[error("label too long in '{0}'")]
    LabelTooLong(String),
}

pub fn parse_header(buf: &[u8]) -> Result<DnsHeader, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::Short(buf.len()));
    }
    let u16_at = |i: usize| u16::from_be_bytes([buf[i], buf[i + 1]]);
    Ok(DnsHeader {
        id: u16_at(0),
        flags: HeaderFlags {
            qr: buf[2] & 0x80 != 0,
            opcode: (buf[2] >> 3) & 0x0F,
            aa: buf[2] & 0x04 != 0,
            tc: buf[2] & 0x02 != 0,
            rd: buf[2] & 0x01 != 0,
            ra: buf[3] & 0x80 != 0,
            rcode: buf[3] & 0x0F,
        },
        question_count: u16_at(4),
        answer_count: u16_at(6),
        authority_count: u16_at(8),
        additional_count: u16_at(10),
    })
}

/// Decodes the header and the first question. Returns the offset just past that question.
pub fn parse_query(buf: &[u8]) -> Result<(DnsHeader, DnsQuestion, usize), WireError> {
    let header = parse_header(buf)?;
    if header.question_count == 0 {
        return Err(WireError::NoQuestion);
    }
    let (name, offset) = read_name(buf, HEADER_LEN)?;
    if offset + 4 > buf.len() {
        return Err(WireError::Short(buf.len()));
    }
    let qtype = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
    let qclass = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]);
    Ok((header, DnsQuestion { name, qtype: QType::from_u16(qtype), qclass }, offset + 4))
}

// 问题区的名字不允许压缩指针
fn read_name(buf: &[u8], mut offset: usize) -> Result<(String, usize), WireError> {
    let mut labels = Vec::new();
    let mut wire_len = 1;
    loop {
        let len = *buf.get(offset).ok_or(WireError::BadName(offset))? as usize;
        if len & 0xC0 != 0 {
            return Err(WireError::BadName(offset));
        }
        offset += 1;
        if len == 0 {
            break;
        }
        let label = buf.get(offset..offset + len).ok_or(WireError::BadName(offset))?;
        // 标签内的 '.' 无法在文本名字中无歧义地表示
        if label.contains(&b'.') {
            return Err(WireError::BadName(offset));
        }
        wire_len += len + 1;
        if wire_len > MAX_NAME_LEN {
            return Err(WireError::BadName(offset));
        }
        labels.push(String::from_utf8_lossy(label).into_owned());
        offset += len;
    }
    let name = if labels.is_empty() { ".".to_string() } else { format!("{}.", labels.join(".")) };
    Ok((name, offset))
}

fn write_name(out: &mut Vec<u8>, name: &str) -> Result<(), WireError> {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > 63 {
            return Err(WireError::LabelTooLong(name.to_string()));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

fn write_record(out: &mut Vec<u8>, record: &Record) -> Result<(), WireError> {
    write_name(out, &record.name)?;
    out.extend_from_slice(&record.data.qtype().to_u16().to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    out.extend_from_slice(&record.ttl.to_be_bytes());

    let len_pos = out.len();
    out.extend_from_slice(&[0, 0]);
    let start = out.len();
    match &record.data {
        RData::A(ip) => out.extend_from_slice(&ip.octets()),
        RData::AAAA(ip) => out.extend_from_slice(&ip.octets()),
        RData::PTR(target) => write_name(out, target)?,
        RData::SOA { mname, rname, serial, refresh, retry, expire, minimum } => {
            write_name(out, mname)?;
            write_name(out, rname)?;
            for v in [serial, refresh, retry, expire, minimum] {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
    }
    let rdlen = (out.len() - start) as u16;
    out[len_pos..len_pos + 2].copy_from_slice(&rdlen.to_be_bytes());
    Ok(())
}

fn write_header(out: &mut Vec<u8>, id: u16, flags: &HeaderFlags, counts: [u16; 4]) {
    out.extend_from_slice(&id.to_be_bytes());
    let mut b2 = (flags.opcode & 0x0F) << 3;
    if flags.qr { b2 |= 0x80; }
    if flags.aa { b2 |= 0x04; }
    if flags.tc { b2 |= 0x02; }
    if flags.rd { b2 |= 0x01; }
    let mut b3 = flags.rcode & 0x0F;
    if flags.ra { b3 |= 0x80; }
    out.push(b2);
    out.push(b3);
    for c in counts {
        out.extend_from_slice(&c.to_be_bytes());
    }
}

pub fn encode_response(msg: &DnsMessage) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(MAX_UDP_PAYLOAD);
    let counts = [msg.questions.len() as u16, msg.answers.len() as u16, msg.authority.len() as u16, 0];
    write_header(&mut out, msg.header.id, &msg.header.flags, counts);
    for q in &msg.questions {
        write_name(&mut out, &q.name)?;
        out.extend_from_slice(&q.qtype.to_u16().to_be_bytes());
        out.extend_from_slice(&q.qclass.to_be_bytes());
    }
    for record in msg.answers.iter().chain(msg.authority.iter()) {
        write_record(&mut out, record)?;
    }
    Ok(out)
}

// 只保留报头与问题区，清空其余各区
fn header_and_question(buf: &[u8], rcode: u8, tc: bool) -> Option<Vec<u8>> {
    let header = parse_header(buf).ok()?;
    let question_end = parse_query(buf).ok().map(|(_, _, end)| end);
    let flags = HeaderFlags {
        qr: true, opcode: header.flags.opcode, aa: false, tc,
        rd: header.flags.rd, ra: false, rcode,
    };
    let mut out = Vec::with_capacity(question_end.unwrap_or(HEADER_LEN));
    let qd = if question_end.is_some() { 1 } else { 0 };
    write_header(&mut out, header.id, &flags, [qd, 0, 0, 0]);
    if let Some(end) = question_end {
        out.extend_from_slice(&buf[HEADER_LEN..end]);
    }
    Some(out)
}

/// Builds an empty reply with `rcode` for a raw query. `None` if not even a header is readable.
pub fn encode_error(query: &[u8], rcode: Rcode) -> Option<Vec<u8>> {
    header_and_question(query, rcode.to_u8(), false)
}

/// Reduces an oversized reply to header and question with TC set.
pub fn truncate(response: &[u8]) -> Vec<u8> {
    let rcode = response.get(3).map(|b| b & 0x0F).unwrap_or(0);
    header_and_question(response, rcode, true).unwrap_or_else(|| response[..response.len().min(HEADER_LEN)].to_vec())
}
