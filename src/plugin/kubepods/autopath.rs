//! Search lists for clients that are pods, so unqualified names can be tried in the pod's namespace first.

use super::resolve::Mode;
use super::KubePods;
use crate::zones::{self, fqdn};
use std::net::IpAddr;

impl KubePods {
    /// Search list for a query from `client`, or `None` to leave resolution alone.
    /// The last entry is always the empty suffix (the name as asked).
    ///
    /// This server's chain does not rewrite queries, so nothing here calls it. It is a
    /// library entry point for embedding servers that run their own search-path expansion.
    pub fn auto_path(&self, qname: &str, client: IpAddr) -> Option<Vec<String>> {
        let name = qname.to_ascii_lowercase();
        let zone = zones::matches(self.zones(), &name)?;
        if self.mode() == Mode::EchoIp {
            return None;
        }
        let pods = self.index().lookup_by_address(&client.to_string()).ok()?;
        let pod = pods.first()?;
        Some(search_list(&pod.namespace, zone, &self.autopath_search))
    }
}

pub fn search_list(namespace: &str, zone: &str, extra: &[String]) -> Vec<String> {
    let mut search = if zone == "." {
        vec![format!("{}.svc.", namespace), "svc.".to_string(), ".".to_string()]
    } else {
        vec![format!("{}.svc.{}", namespace, zone), format!("svc.{}", zone), zone.to_string()]
    };
    search.extend(extra.iter().cloned());
    search.push(String::new());
    search
}

/// Search suffixes from resolv.conf content; the last `search` or `domain` line wins.
pub fn search_from_resolv_conf(content: &str) -> Vec<String> {
    let mut search = Vec::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("search") => search = fields.map(fqdn).collect(),
            Some("domain") => search = fields.next().map(fqdn).into_iter().collect(),
            _ => {}
        }
    }
    search
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::kubepods::source::Pod;

    #[test]
    fn search_list_shapes() {
        let extra = vec!["corp.example.".to_string()];
        assert_eq!(
            search_list("ns", "cluster.local.", &extra),
            vec!["ns.svc.cluster.local.", "svc.cluster.local.", "cluster.local.", "corp.example.", ""]
        );
        assert_eq!(search_list("ns", ".", &[]), vec!["ns.svc.", "svc.", ".", ""]);
    }

    #[test]
    fn client_pod_namespace_leads() {
        let kps = KubePods::new(["cluster.local.", "in-addr.arpa."]).with_autopath_search(vec!["corp.example.".to_string()]);
        kps.take_writer()
            .unwrap()
            .replace([Pod::new("team-a", "web").with_ips(["10.0.0.7".parse().unwrap()])]);
        let client: IpAddr = "10.0.0.7".parse().unwrap();

        assert_eq!(
            kps.auto_path("api.cluster.local.", client).unwrap(),
            vec!["team-a.svc.cluster.local.", "svc.cluster.local.", "cluster.local.", "corp.example.", ""]
        );
        assert_eq!(kps.auto_path("api.example.org.", client), None);
        assert_eq!(kps.auto_path("api.cluster.local.", "10.9.9.9".parse().unwrap()), None);

        let echo = KubePods::new(["cluster.local."]).with_mode(Mode::EchoIp);
        assert_eq!(echo.auto_path("api.cluster.local.", client), None);
    }

    #[test]
    fn resolv_conf_search() {
        let conf = "# generated\nnameserver 10.0.0.10\ndomain old.example\nsearch Default.svc.cluster.local svc.cluster.local\noptions ndots:5\n";
        assert_eq!(search_from_resolv_conf(conf), vec!["default.svc.cluster.local.", "svc.cluster.local."]);
        assert!(search_from_resolv_conf("nameserver 1.1.1.1\n").is_empty());
    }
}
