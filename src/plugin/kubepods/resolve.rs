//! Name resolution against the pod index.
//!
//! Forward names are `<target>.<namespace>.<zone>` where the target is a pod name, a dashed
//! IP, or either, depending on [`Mode`]. Reverse names are answered from the address view.

use super::dashed::{dash_ip, parse_dashed};
use super::index::{IndexError, PodIndex};
use super::source::Pod;
use crate::types::{QType, RData, Record};
use crate::zones::{self, join};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    EchoIp,
    Ip,
    #[default]
    Name,
    NameAndIp,
}

impl Mode {
    fn uses_names(self) -> bool { matches!(self, Mode::Name | Mode::NameAndIp) }
    fn uses_ips(self) -> bool { matches!(self, Mode::Ip | Mode::NameAndIp) }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "echo-ip" => Ok(Mode::EchoIp),
            "ip" => Ok(Mode::Ip),
            "name" => Ok(Mode::Name),
            "name-and-ip" => Ok(Mode::NameAndIp),
            other => anyhow::bail!("unknown names mode '{}' (expected name, ip, name-and-ip or echo-ip)", other),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::EchoIp => "echo-ip",
            Mode::Ip => "ip",
            Mode::Name => "name",
            Mode::NameAndIp => "name-and-ip",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Not under any configured zone; another handler must answer.
    OutOfScope,
    NoData,
    NxDomain,
    /// Records for a name that exists. May be empty when no address has the asked family.
    Answer(Vec<Record>),
}

#[derive(Debug, Clone)]
pub struct Resolver {
    /// Lower-case FQDNs; the first one names PTR targets and the SOA.
    pub zones: Vec<String>,
    pub mode: Mode,
    pub ttl: u32,
    pub index: PodIndex,
}

impl Resolver {
    pub fn primary_zone(&self) -> &str {
        self.zones.first().map(String::as_str).unwrap_or(".")
    }

    /// Resolves `qname` (an FQDN, any case). Answer owner names keep the query's case.
    pub fn resolve(&self, qname: &str, qtype: QType) -> Result<Outcome, IndexError> {
        let name = qname.to_ascii_lowercase();
        let Some(zone) = zones::matches(&self.zones, &name) else {
            return Ok(Outcome::OutOfScope);
        };
        if zone.len() == name.len() {
            return Ok(Outcome::NoData);
        }

        if qtype == QType::PTR {
            return self.reverse(qname, &name);
        }

        let pod_domain = if zone == "." { &name[..name.len() - 1] } else { &name[..name.len() - zone.len() - 1] };
        let segments: Vec<&str> = pod_domain.split('.').collect();

        let pods = match segments.as_slice() {
            [target, namespace] => {
                if self.mode == Mode::EchoIp {
                    return Ok(self.echo(qname, target, qtype));
                }
                self.lookup_pods(namespace, target)?
            }
            [namespace] => {
                // 回显模式下任何命名空间都视为存在
                if self.mode == Mode::EchoIp || !self.index.lookup_by_namespace(namespace)?.is_empty() {
                    return Ok(Outcome::NoData);
                }
                Vec::new()
            }
            _ => Vec::new(),
        };

        if pods.is_empty() {
            return Ok(Outcome::NxDomain);
        }

        let records = pods
            .iter()
            .flat_map(|pod| pod.ips.iter())
            .filter(|ip| wants(qtype, ip))
            .map(|ip| Record::address(qname, self.ttl, *ip))
            .collect();
        Ok(Outcome::Answer(records))
    }

    fn lookup_pods(&self, namespace: &str, target: &str) -> Result<Vec<Arc<Pod>>, IndexError> {
        let mut pods = Vec::new();
        if self.mode.uses_ips() {
            pods.extend(self.index.lookup_by_namespace_dashed_ip(namespace, target)?);
        }
        if self.mode.uses_names() {
            pods.extend(self.index.lookup_by_key(namespace, target)?);
        }
        Ok(pods)
    }

    fn echo(&self, qname: &str, label: &str, qtype: QType) -> Outcome {
        match parse_dashed(label) {
            None => Outcome::NxDomain,
            Some(ip) if wants(qtype, &ip) => Outcome::Answer(vec![Record::address(qname, self.ttl, ip)]),
            Some(_) => Outcome::Answer(Vec::new()),
        }
    }

    fn reverse(&self, qname: &str, name: &str) -> Result<Outcome, IndexError> {
        // 没有命名空间就无法合成 PTR 目标
        if self.mode == Mode::EchoIp {
            return Ok(Outcome::NxDomain);
        }
        let Some(addr) = zones::extract_address_from_reverse(name) else {
            return Ok(Outcome::NxDomain);
        };
        let addr = addr.to_string();
        let pods = self.index.lookup_by_address(&addr)?;
        if pods.is_empty() {
            return Ok(Outcome::NxDomain);
        }
        let records = pods.iter().flat_map(|pod| self.ptr(qname, &addr, pod)).collect();
        Ok(Outcome::Answer(records))
    }

    fn ptr(&self, qname: &str, addr: &str, pod: &Pod) -> Vec<Record> {
        let zone = self.primary_zone();
        let mut ptrs = Vec::new();
        if self.mode.uses_names() {
            let target = join(&[pod.name.as_str(), pod.namespace.as_str(), zone]);
            ptrs.push(Record::new(qname, self.ttl, RData::PTR(target)));
        }
        if self.mode.uses_ips() {
            for ip in pod.ips.iter().map(IpAddr::to_string).filter(|ip| ip == addr) {
                let target = join(&[dash_ip(&ip).as_str(), pod.namespace.as_str(), zone]);
                ptrs.push(Record::new(qname, self.ttl, RData::PTR(target)));
            }
        }
        ptrs
    }
}

fn wants(qtype: QType, ip: &IpAddr) -> bool {
    matches!((qtype, ip), (QType::A, IpAddr::V4(_)) | (QType::AAAA, IpAddr::V6(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::kubepods::index::IndexWriter;

    fn resolver(mode: Mode) -> (Resolver, IndexWriter) {
        let (index, mut writer) = PodIndex::new();
        writer.replace([
            Pod::new("namespace1", "pod1")
                .with_ips(["1.2.3.4", "1:2:3::4"].iter().map(|ip| ip.parse().unwrap())),
            Pod::new("namespace1", "v4only").with_ips(["10.0.0.1".parse().unwrap()]),
        ]);
        let zones = ["cluster.local.", "in-addr.arpa.", "ip6.arpa."].iter().map(|z| z.to_string()).collect();
        (Resolver { zones, mode, ttl: 5, index }, writer)
    }

    fn addresses(outcome: Outcome) -> Vec<String> {
        match outcome {
            Outcome::Answer(records) => records
                .into_iter()
                .map(|r| match r.data {
                    RData::A(ip) => ip.to_string(),
                    RData::AAAA(ip) => ip.to_string(),
                    RData::PTR(target) => target,
                    other => panic!("unexpected rdata {:?}", other),
                })
                .collect(),
            other => panic!("expected an answer, got {:?}", other),
        }
    }

    #[test]
    fn scope_and_apex() {
        let (r, _w) = resolver(Mode::Name);
        assert_eq!(r.resolve("example.com.", QType::A).unwrap(), Outcome::OutOfScope);
        assert_eq!(r.resolve("Cluster.Local.", QType::A).unwrap(), Outcome::NoData);
        assert_eq!(r.resolve("in-addr.arpa.", QType::PTR).unwrap(), Outcome::NoData);
    }

    #[test]
    fn name_mode_keeps_query_case() {
        let (r, _w) = resolver(Mode::Name);
        match r.resolve("POD1.namespace1.cluster.local.", QType::A).unwrap() {
            Outcome::Answer(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].name, "POD1.namespace1.cluster.local.");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_family_is_empty_success() {
        let (r, _w) = resolver(Mode::Name);
        assert_eq!(r.resolve("v4only.namespace1.cluster.local.", QType::AAAA).unwrap(), Outcome::Answer(vec![]));
        assert_eq!(r.resolve("v4only.namespace1.cluster.local.", QType::Other(15)).unwrap(), Outcome::Answer(vec![]));
        assert_eq!(r.resolve("nope.namespace1.cluster.local.", QType::Other(15)).unwrap(), Outcome::NxDomain);
    }

    #[test]
    fn deeper_names_do_not_exist() {
        let (r, _w) = resolver(Mode::NameAndIp);
        assert_eq!(r.resolve("a.pod1.namespace1.cluster.local.", QType::A).unwrap(), Outcome::NxDomain);
    }

    #[test]
    fn name_and_ip_reverse_gives_both_targets() {
        let (r, _w) = resolver(Mode::NameAndIp);
        let targets = addresses(r.resolve("4.3.2.1.in-addr.arpa.", QType::PTR).unwrap());
        assert_eq!(targets, vec!["pod1.namespace1.cluster.local.", "1-2-3-4.namespace1.cluster.local."]);
    }

    #[test]
    fn malformed_reverse_is_nxdomain() {
        let (r, _w) = resolver(Mode::Name);
        assert_eq!(r.resolve("3.2.1.in-addr.arpa.", QType::PTR).unwrap(), Outcome::NxDomain);
        assert_eq!(r.resolve("pod1.namespace1.cluster.local.", QType::PTR).unwrap(), Outcome::NxDomain);
    }

    #[test]
    fn echo_needs_no_index() {
        let (index, _writer) = PodIndex::new();
        let r = Resolver { zones: vec!["cluster.local.".to_string()], mode: Mode::EchoIp, ttl: 5, index };
        assert_eq!(addresses(r.resolve("1-2-3-5.anything.cluster.local.", QType::A).unwrap()), vec!["1.2.3.5"]);
        assert_eq!(r.resolve("1-2-3-5.anything.cluster.local.", QType::AAAA).unwrap(), Outcome::Answer(vec![]));
        assert_eq!(r.resolve("anything.cluster.local.", QType::A).unwrap(), Outcome::NoData);
        assert_eq!(r.resolve("pod1.anything.cluster.local.", QType::A).unwrap(), Outcome::NxDomain);
    }

    #[test]
    fn root_zone() {
        let (index, mut writer) = PodIndex::new();
        writer.replace([Pod::new("ns", "p").with_ips(["10.1.1.1".parse().unwrap()])]);
        let r = Resolver { zones: vec![".".to_string()], mode: Mode::Name, ttl: 5, index };
        assert_eq!(addresses(r.resolve("p.ns.", QType::A).unwrap()), vec!["10.1.1.1"]);
        assert_eq!(r.resolve("ns.", QType::A).unwrap(), Outcome::NoData);
        assert_eq!(r.resolve(".", QType::A).unwrap(), Outcome::NoData);
    }

    #[test]
    fn unsynced_index_is_a_failure() {
        let (index, _writer) = PodIndex::new();
        let r = Resolver { zones: vec!["cluster.local.".to_string()], mode: Mode::Name, ttl: 5, index };
        assert_eq!(r.resolve("cluster.local.", QType::A).unwrap(), Outcome::NoData);
        assert_eq!(r.resolve("p.ns.cluster.local.", QType::A), Err(IndexError::NotSynced));
    }

    #[test]
    fn dangling_index_entry_surfaces() {
        let (r, mut w) = resolver(Mode::Name);
        w.corrupt_reverse("9.9.9.9", "ghost/pod");
        assert!(matches!(
            r.resolve("9.9.9.9.in-addr.arpa.", QType::PTR),
            Err(IndexError::Integrity { view: "reverse", .. })
        ));
    }

    #[test]
    fn modes_parse() {
        assert_eq!("name-and-ip".parse::<Mode>().unwrap(), Mode::NameAndIp);
        assert_eq!(Mode::EchoIp.to_string(), "echo-ip");
        assert!("names".parse::<Mode>().is_err());
    }
}
