//! Pod source backed by a Kubernetes `PodList` JSON document (`kubectl get pods -A -o json`).
//!
//! The file is polled; a change of its SHA-512 digest is turned into per-pod events.

use super::source::{channel_stream, Pod, PodEvent, PodSource, PodStream};
use anyhow::{Context, Result};
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha512};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodItem>,
}

#[derive(Deserialize)]
struct PodItem {
    metadata: ObjectMeta,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Deserialize)]
struct ObjectMeta {
    #[serde(default = "default_namespace")]
    namespace: String,
    name: String,
    #[serde(default)]
    annotations: Option<HashMap<String, String>>,
}

#[derive(Deserialize, Default)]
struct PodStatus {
    #[serde(rename = "podIP", default)]
    pod_ip: Option<String>,
    #[serde(rename = "podIPs", default)]
    pod_ips: Option<Vec<PodIp>>,
}

#[derive(Deserialize)]
struct PodIp {
    ip: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Parses a `PodList`. `status.podIPs` wins over the legacy `status.podIP`; bad addresses are skipped.
pub fn parse_pod_list(content: &[u8]) -> Result<Vec<Pod>> {
    let list: PodList = serde_json::from_slice(content).context("decode PodList")?;
    Ok(list.items.into_iter().map(into_pod).collect())
}

fn into_pod(item: PodItem) -> Pod {
    let literals: Vec<String> = match (item.status.pod_ips, item.status.pod_ip) {
        (Some(ips), _) if !ips.is_empty() => ips.into_iter().map(|p| p.ip).collect(),
        (_, Some(ip)) if !ip.is_empty() => vec![ip],
        _ => Vec::new(),
    };
    let mut pod = Pod::new(item.metadata.namespace, item.metadata.name);
    for literal in literals {
        match literal.parse::<IpAddr>() {
            Ok(ip) => pod.ips.push(ip),
            Err(_) => tracing::warn!("[kubepods] skipping invalid address '{}' of pod {}", literal, pod.key()),
        }
    }
    pod.annotations = item.metadata.annotations.unwrap_or_default();
    pod
}

#[derive(Default)]
struct Baseline {
    digest: String,
    pods: BTreeMap<String, Pod>,
}

impl Baseline {
    /// Adopts `pods` and returns the events that lead from the old set to it.
    fn advance(&mut self, digest: String, pods: Vec<Pod>) -> Vec<PodEvent> {
        let next: BTreeMap<String, Pod> = pods.into_iter().map(|p| (p.key(), p)).collect();
        let mut events = Vec::new();
        for (key, old) in &self.pods {
            if !next.contains_key(key) {
                events.push(PodEvent::Deleted(old.clone()));
            }
        }
        for (key, pod) in &next {
            match self.pods.get(key) {
                None => events.push(PodEvent::Added(pod.clone())),
                Some(old) if old != pod => events.push(PodEvent::Modified(pod.clone())),
                Some(_) => {}
            }
        }
        self.digest = digest;
        self.pods = next;
        events
    }
}

pub struct FilePodSource {
    path: PathBuf,
    interval: Duration,
    baseline: Arc<Mutex<Baseline>>,
}

impl FilePodSource {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self { path: path.into(), interval, baseline: Arc::new(Mutex::new(Baseline::default())) }
    }
}

async fn read_snapshot(path: &Path) -> Result<(String, Vec<Pod>)> {
    let content = tokio::fs::read(path).await.with_context(|| format!("read {}", path.display()))?;
    let mut hasher = Sha512::new();
    hasher.update(&content);
    let digest = hex::encode(hasher.finalize());
    Ok((digest, parse_pod_list(&content)?))
}

fn jittered(interval: Duration) -> Duration {
    let jitter = interval.as_millis() as u64 / 4;
    let j = rand::thread_rng().gen_range(0..=jitter * 2);
    let offset = j as i64 - jitter as i64;
    if offset > 0 { interval + Duration::from_millis(offset as u64) }
    else { interval - Duration::from_millis(-offset as u64) }
}

#[async_trait::async_trait]
impl PodSource for FilePodSource {
    async fn list(&self) -> Result<Vec<Pod>> {
        let (digest, pods) = read_snapshot(&self.path).await?;
        let mut baseline = self.baseline.lock().map_err(|_| anyhow::anyhow!("pod file baseline poisoned"))?;
        baseline.advance(digest, pods.clone());
        Ok(pods)
    }

    async fn watch(&self) -> Result<PodStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let path = self.path.clone();
        let interval = self.interval;
        let baseline = self.baseline.clone();

        tokio::spawn(async move {
            while !tx.is_closed() {
                sleep(jittered(interval)).await;
                let (digest, pods) = match read_snapshot(&path).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        // 文件可能正在被改写，保留旧基线等下一轮
                        tracing::warn!("[kubepods] pod file {}: {:#}", path.display(), e);
                        continue;
                    }
                };
                let events = match baseline.lock() {
                    // 尚未 list 过：只建立基线，由随后的 list 负责全量
                    Ok(mut base) if base.digest.is_empty() => {
                        base.advance(digest, pods);
                        continue;
                    }
                    Ok(mut base) if base.digest != digest => base.advance(digest, pods),
                    Ok(_) => continue,
                    Err(_) => break,
                };
                tracing::info!("[kubepods] pod file {} changed, {} pod events", path.display(), events.len());
                if events.into_iter().any(|event| tx.send(Ok(event)).is_err()) {
                    break;
                }
            }
        });

        Ok(channel_stream(rx))
    }
}
