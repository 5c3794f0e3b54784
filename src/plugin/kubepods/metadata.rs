use super::KubePods;
use crate::types::Metadata;
use std::net::IpAddr;

pub const LABEL_NAMESPACE: &str = "kubepods/client-namespace";
pub const LABEL_POD_NAME: &str = "kubepods/client-pod-name";
pub const LABEL_ANNOTATION_PREFIX: &str = "kubepods/client-pod-annotation-";

impl KubePods {
    /// Binds the requesting pod's identity into `md`. Values are computed only when read.
    pub fn export_metadata(&self, md: &mut Metadata, client: IpAddr) {
        let Ok(pods) = self.index().lookup_by_address(&client.to_string()) else {
            return;
        };
        let Some(pod) = pods.into_iter().next() else {
            return;
        };

        let p = pod.clone();
        md.set_value_func(LABEL_NAMESPACE, move || p.namespace.clone());
        let p = pod.clone();
        md.set_value_func(LABEL_POD_NAME, move || p.name.clone());

        for key in pod.annotations.keys() {
            // 每个闭包持有自己的 key，读取时才取值
            let (p, key) = (pod.clone(), key.clone());
            let label = format!("{}{}", LABEL_ANNOTATION_PREFIX, key);
            md.set_value_func(label, move || p.annotations.get(&key).cloned().unwrap_or_default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::kubepods::source::Pod;

    #[test]
    fn unknown_client_adds_nothing() {
        let kps = KubePods::new(["cluster.local."]);
        let mut md = Metadata::default();
        // index never synced
        kps.export_metadata(&mut md, "1.2.3.4".parse().unwrap());
        assert!(md.is_empty());
    }

    #[test]
    fn annotation_bindings_keep_their_own_key() {
        let pod = Pod::new("ns", "p")
            .with_ips(["10.0.0.7".parse().unwrap()])
            .with_annotation("a", "1")
            .with_annotation("b", "2")
            .with_annotation("c", "3");
        let kps = KubePods::new(["cluster.local."]);
        kps.take_writer().unwrap().replace([pod]);

        let mut md = Metadata::default();
        kps.export_metadata(&mut md, "10.0.0.7".parse().unwrap());
        assert_eq!(md.value(LABEL_NAMESPACE).as_deref(), Some("ns"));
        assert_eq!(md.value(LABEL_POD_NAME).as_deref(), Some("p"));
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
            assert_eq!(md.value(&format!("{}{}", LABEL_ANNOTATION_PREFIX, k)).as_deref(), Some(v));
        }
        assert_eq!(md.labels().len(), 5);
    }
}
