use coredns_kubepods::config::Config;
use coredns_kubepods::dns_server::{handle_query, Route};
use coredns_kubepods::plugin::{Plugin, SharedState};
use coredns_kubepods::types::Rcode;
use coredns_kubepods::wire;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

const POD1: &str = r#"{
  "kind": "PodList",
  "items": [
    {
      "metadata": {"namespace": "namespace1", "name": "pod1", "annotations": {"foo": "bar"}},
      "status": {"podIP": "1.2.3.4", "podIPs": [{"ip": "1.2.3.4"}, {"ip": "1:2:3::4"}]}
    }
  ]
}"#;

const POD1_AND_POD2: &str = r#"{
  "kind": "PodList",
  "items": [
    {
      "metadata": {"namespace": "namespace1", "name": "pod1"},
      "status": {"podIPs": [{"ip": "1.2.3.4"}, {"ip": "1:2:3::4"}]}
    },
    {
      "metadata": {"namespace": "namespace2", "name": "pod2"},
      "status": {"podIP": "5.6.7.9"}
    }
  ]
}"#;

fn pods_file() -> PathBuf {
    let path = std::env::temp_dir().join(format!("kubepods-it-{}.json", std::process::id()));
    std::fs::write(&path, POD1).unwrap();
    path
}

fn raw_query(name: &str, qtype: u16) -> Vec<u8> {
    let mut q = vec![0x00, 0x2A, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    for label in name.trim_end_matches('.').split('.') {
        q.push(label.len() as u8);
        q.extend_from_slice(label.as_bytes());
    }
    q.push(0);
    q.extend_from_slice(&qtype.to_be_bytes());
    q.extend_from_slice(&1u16.to_be_bytes());
    q
}

async fn rcode_and_answers(config: &Config, routes: &[Route], name: &str, qtype: u16) -> (u8, u16) {
    let src = "10.0.0.7:5353".parse().unwrap();
    let resp = handle_query(config, routes, &raw_query(name, qtype), src, "udp", 53).await.unwrap();
    let header = wire::parse_header(&resp).unwrap();
    (header.flags.rcode, header.answer_count)
}

#[tokio::test]
async fn corefile_pods_file_end_to_end() {
    let path = pods_file();
    let corefile = format!(
        "cluster.local in-addr.arpa ip6.arpa {{\n  kubepods {{\n    names name-and-ip\n    pods {} 100ms\n  }}\n}}\n",
        path.display()
    );
    let shared = Arc::new(SharedState::new("Corefile".to_string()));
    let config = Config::parse(&corefile, shared.clone()).unwrap();
    let routes: Vec<Route> = config.blocks[0].listeners(53).into_iter().map(|(zone, _)| Route { zone, block: 0 }).collect();

    assert_eq!(shared.not_ready(), vec!["kubepods".to_string()]);
    assert_eq!(
        rcode_and_answers(&config, &routes, "pod1.namespace1.cluster.local.", 1).await,
        (Rcode::ServFail.to_u8(), 0)
    );

    for plugin in config.plugins() {
        assert_ok!(plugin.startup().await);
    }
    for _ in 0..200 {
        if shared.not_ready().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(shared.not_ready().is_empty());

    assert_eq!(rcode_and_answers(&config, &routes, "pod1.namespace1.cluster.local.", 1).await, (0, 1));
    assert_eq!(rcode_and_answers(&config, &routes, "1-2-3--4.namespace1.cluster.local.", 28).await, (0, 1));
    assert_eq!(rcode_and_answers(&config, &routes, "4.3.2.1.in-addr.arpa.", 12).await, (0, 2));
    assert_eq!(
        rcode_and_answers(&config, &routes, "pod2.namespace2.cluster.local.", 1).await,
        (Rcode::NxDomain.to_u8(), 0)
    );

    // 文件变更后由轮询任务带入索引
    std::fs::write(&path, POD1_AND_POD2).unwrap();
    let mut answered = rcode_and_answers(&config, &routes, "pod2.namespace2.cluster.local.", 1).await;
    for _ in 0..300 {
        if answered == (0, 1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        answered = rcode_and_answers(&config, &routes, "pod2.namespace2.cluster.local.", 1).await;
    }
    assert_eq!(answered, (0, 1));

    for plugin in config.plugins() {
        assert_ok!(plugin.shutdown());
    }
    let _ = std::fs::remove_file(&path);
}
