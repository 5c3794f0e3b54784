//! Reply assembly. Negative replies carry a synthetic SOA for the primary zone.

use crate::types::{RData, Rcode, Record};
use crate::zones::join;

pub const SOA_REFRESH: u32 = 7200;
pub const SOA_RETRY: u32 = 1800;
pub const SOA_EXPIRE: u32 = 86400;

/// SOA for `zone`; the serial is the current unix time and the minimum is the record TTL.
pub fn soa(zone: &str, ttl: u32) -> Record {
    Record::new(
        zone,
        ttl,
        RData::SOA {
            mname: join(&["ns.dns", zone]),
            rname: join(&["hostmaster.dns", zone]),
            serial: chrono::Utc::now().timestamp() as u32,
            refresh: SOA_REFRESH,
            retry: SOA_RETRY,
            expire: SOA_EXPIRE,
            minimum: ttl,
        },
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub rcode: Rcode,
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
}

impl Reply {
    /// Possibly empty answer set; an empty one is NODATA by omission and has no SOA.
    pub fn answer(records: Vec<Record>) -> Self {
        Self { rcode: Rcode::NoError, answers: records, authority: Vec::new() }
    }

    pub fn nodata(zone: &str, ttl: u32) -> Self {
        Self { rcode: Rcode::NoError, answers: Vec::new(), authority: vec![soa(zone, ttl)] }
    }

    pub fn nxdomain(zone: &str, ttl: u32) -> Self {
        Self { rcode: Rcode::NxDomain, answers: Vec::new(), authority: vec![soa(zone, ttl)] }
    }

    pub fn servfail() -> Self {
        Self { rcode: Rcode::ServFail, answers: Vec::new(), authority: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soa_fields() {
        let record = soa("cluster.local.", 5);
        assert_eq!(record.name, "cluster.local.");
        assert_eq!(record.ttl, 5);
        match record.data {
            RData::SOA { mname, rname, serial, refresh, retry, expire, minimum } => {
                assert_eq!(mname, "ns.dns.cluster.local.");
                assert_eq!(rname, "hostmaster.dns.cluster.local.");
                assert!(serial > 0);
                assert_eq!((refresh, retry, expire, minimum), (7200, 1800, 86400, 5));
            }
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[test]
    fn root_zone_soa_names() {
        match soa(".", 30).data {
            RData::SOA { mname, rname, .. } => {
                assert_eq!(mname, "ns.dns.");
                assert_eq!(rname, "hostmaster.dns.");
            }
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[test]
    fn negative_replies_carry_authority() {
        let nx = Reply::nxdomain("cluster.local.", 5);
        assert_eq!(nx.rcode, Rcode::NxDomain);
        assert_eq!(nx.authority.len(), 1);
        let nodata = Reply::nodata("cluster.local.", 5);
        assert_eq!(nodata.rcode, Rcode::NoError);
        assert!(nodata.answers.is_empty());
        assert!(Reply::answer(Vec::new()).authority.is_empty());
        assert_eq!(Reply::servfail().rcode, Rcode::ServFail);
    }
}
