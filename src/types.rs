//! Basic types for CoreDNS

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QType { A, AAAA, PTR, SOA, Other(u16) }

impl QType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => QType::A,
            28 => QType::AAAA,
            12 => QType::PTR,
            6 => QType::SOA,
            other => QType::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            QType::A => 1,
            QType::AAAA => 28,
            QType::PTR => 12,
            QType::SOA => 6,
            QType::Other(v) => v,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QType::A => "A",
            QType::AAAA => "AAAA",
            QType::PTR => "PTR",
            QType::SOA => "SOA",
            QType::Other(_) => "OTHER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode { NoError, FormErr, ServFail, NxDomain, NotImp, Refused }

impl Rcode {
    pub fn to_u8(self) -> u8 {
        match self {
            Rcode::NoError => 0, Rcode::FormErr => 1, Rcode::ServFail => 2,
            Rcode::NxDomain => 3, Rcode::NotImp => 4, Rcode::Refused => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rcode::NoError => "NOERROR", Rcode::FormErr => "FORMERR", Rcode::ServFail => "SERVFAIL",
            Rcode::NxDomain => "NXDOMAIN", Rcode::NotImp => "NOTIMP", Rcode::Refused => "REFUSED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    AAAA(Ipv6Addr),
    PTR(String),
    SOA { mname: String, rname: String, serial: u32, refresh: u32, retry: u32, expire: u32, minimum: u32 },
}

impl RData {
    pub fn qtype(&self) -> QType {
        match self {
            RData::A(_) => QType::A,
            RData::AAAA(_) => QType::AAAA,
            RData::PTR(_) => QType::PTR,
            RData::SOA { .. } => QType::SOA,
        }
    }
}

/// A resource record in class IN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub ttl: u32,
    pub data: RData,
}

impl Record {
    pub fn new(name: impl Into<String>, ttl: u32, data: RData) -> Self {
        Self { name: name.into(), ttl, data }
    }

    /// A or AAAA depending on the address family.
    pub fn address(name: impl Into<String>, ttl: u32, ip: IpAddr) -> Self {
        let data = match ip {
            IpAddr::V4(v4) => RData::A(v4),
            IpAddr::V6(v6) => RData::AAAA(v6),
        };
        Self::new(name, ttl, data)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DnsHeader {
    pub id: u16, pub flags: HeaderFlags,
    pub question_count: u16, pub answer_count: u16,
    pub authority_count: u16, pub additional_count: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderFlags {
    pub qr: bool, pub opcode: u8, pub aa: bool, pub tc: bool,
    pub rd: bool, pub ra: bool, pub rcode: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion { pub name: String, pub qtype: QType, pub qclass: u16 }

pub type ValueFunc = Arc<dyn Fn() -> String + Send + Sync>;

/// Per-request metadata: labels bound to values that are only computed when read.
#[derive(Clone, Default)]
pub struct Metadata {
    funcs: HashMap<String, ValueFunc>,
}

impl Metadata {
    /// Binds `label` to `func`. An existing binding is kept and `false` is returned.
    pub fn set_value_func<F>(&mut self, label: impl Into<String>, func: F) -> bool
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        let label = label.into();
        if self.funcs.contains_key(&label) {
            return false;
        }
        self.funcs.insert(label, Arc::new(func));
        true
    }

    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.funcs.keys().map(String::as_str).collect();
        labels.sort_unstable();
        labels
    }

    pub fn value_func(&self, label: &str) -> Option<ValueFunc> {
        self.funcs.get(label).cloned()
    }

    pub fn value(&self, label: &str) -> Option<String> {
        self.funcs.get(label).map(|f| f())
    }

    pub fn is_empty(&self) -> bool { self.funcs.is_empty() }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.labels()).finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,

    pub raw_query: Vec<u8>,
    pub raw_response: Option<Vec<u8>>,
    pub halt_chain: bool,

    pub client_addr: Option<SocketAddr>,
    pub protocol: String,

    // --- 【监控上下文】 ---
    pub server_port: Option<u16>,
    pub zone: String, // 命中的 server block 区域
    pub start_time: Option<std::time::Instant>,
    pub answered_by: String, // 记录是哪个插件响应的

    pub metadata: Metadata,
}

impl DnsMessage {
    pub fn question(&self) -> Option<&DnsQuestion> { self.questions.first() }

    pub fn client_ip(&self) -> Option<IpAddr> { self.client_addr.map(|a| a.ip()) }

    /// Fills in the reply sections, encodes them and stops the chain.
    pub fn write_reply(&mut self, plugin: &str, rcode: Rcode, answers: Vec<Record>, authority: Vec<Record>) -> anyhow::Result<()> {
        self.answers = answers;
        self.authority = authority;
        self.header.flags.qr = true;
        self.header.flags.aa = true;
        self.header.flags.tc = false;
        self.header.flags.ra = false;
        self.header.flags.rcode = rcode.to_u8();
        self.raw_response = Some(crate::wire::encode_response(self)?);
        self.halt_chain = true;
        self.answered_by = plugin.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn metadata_is_lazy_and_first_writer_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut md = Metadata::default();
        let counter = calls.clone();
        assert!(md.set_value_func("a/b", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            "first".to_string()
        }));
        assert!(!md.set_value_func("a/b", || "second".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(md.value("a/b").as_deref(), Some("first"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(md.value("missing"), None);
        assert_eq!(md.labels(), vec!["a/b"]);
    }

    #[test]
    fn qtype_codes() {
        assert_eq!(QType::from_u16(28), QType::AAAA);
        assert_eq!(QType::from_u16(15), QType::Other(15));
        assert_eq!(QType::Other(15).to_u16(), 15);
        assert_eq!(QType::PTR.to_u16(), 12);
    }
}
