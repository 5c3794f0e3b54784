//! Pods and the collaborator that supplies them.

use anyhow::Result;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    pub ips: Vec<IpAddr>,
    pub annotations: HashMap<String, String>,
}

impl Pod {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into(), ..Default::default() }
    }

    pub fn with_ips<I: IntoIterator<Item = IpAddr>>(mut self, ips: I) -> Self {
        self.ips.extend(ips);
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Primary key, `namespace/name`.
    pub fn key(&self) -> String { pod_key(&self.namespace, &self.name) }
}

pub fn pod_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
}

impl PodEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PodEvent::Added(_) => "added",
            PodEvent::Modified(_) => "modified",
            PodEvent::Deleted(_) => "deleted",
        }
    }
}

pub type PodStream = BoxStream<'static, Result<PodEvent>>;

/// Cluster-wide pod list and change feed.
///
/// `watch` must deliver every change made after it returns. Credentials, transport
/// reliability and reconnects below this interface belong to the implementation.
#[async_trait::async_trait]
pub trait PodSource: Send + Sync {
    async fn list(&self) -> Result<Vec<Pod>>;
    async fn watch(&self) -> Result<PodStream>;
}

pub(crate) fn channel_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Pods kept in process memory, a stand-in for a cluster API.
#[derive(Default)]
pub struct MemoryPodSource {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    pods: BTreeMap<String, Pod>,
    watchers: Vec<mpsc::UnboundedSender<Result<PodEvent>>>,
    list_error: Option<String>,
}

impl MemoryPodSource {
    pub fn new<I: IntoIterator<Item = Pod>>(pods: I) -> Self {
        let source = Self::default();
        if let Ok(mut inner) = source.inner.lock() {
            for pod in pods {
                inner.pods.insert(pod.key(), pod);
            }
        }
        source
    }

    /// Adds or replaces a pod.
    pub fn create(&self, pod: Pod) {
        let Ok(mut inner) = self.inner.lock() else { return };
        let event = match inner.pods.insert(pod.key(), pod.clone()) {
            Some(_) => PodEvent::Modified(pod),
            None => PodEvent::Added(pod),
        };
        inner.broadcast(Ok(event));
    }

    pub fn update(&self, pod: Pod) { self.create(pod) }

    pub fn delete(&self, namespace: &str, name: &str) {
        let Ok(mut inner) = self.inner.lock() else { return };
        if let Some(pod) = inner.pods.remove(&pod_key(namespace, name)) {
            inner.broadcast(Ok(PodEvent::Deleted(pod)));
        }
    }

    /// Makes subsequent `list` calls fail until cleared with `None`.
    pub fn set_list_error(&self, reason: Option<&str>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.list_error = reason.map(str::to_string);
        }
    }

    /// Breaks every open watch with `reason`.
    pub fn fail_watchers(&self, reason: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.broadcast(Err(anyhow::anyhow!("{}", reason)));
            inner.watchers.clear();
        }
    }
}

impl MemoryInner {
    fn broadcast(&mut self, event: Result<PodEvent>) {
        match event {
            Ok(event) => self.watchers.retain(|tx| tx.send(Ok(event.clone())).is_ok()),
            Err(e) => {
                let reason = e.to_string();
                for tx in &self.watchers {
                    let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl PodSource for MemoryPodSource {
    async fn list(&self) -> Result<Vec<Pod>> {
        let inner = self.inner.lock().map_err(|_| anyhow::anyhow!("memory pod source poisoned"))?;
        if let Some(reason) = &inner.list_error {
            anyhow::bail!("list pods: {}", reason);
        }
        Ok(inner.pods.values().cloned().collect())
    }

    async fn watch(&self) -> Result<PodStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("memory pod source poisoned"))?
            .watchers
            .push(tx);
        Ok(channel_stream(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watchers_see_changes_after_subscribing() {
        let source = MemoryPodSource::new([Pod::new("ns", "a")]);
        let mut events = source.watch().await.unwrap();

        source.create(Pod::new("ns", "b"));
        source.update(Pod::new("ns", "b").with_ips(["10.0.0.1".parse().unwrap()]));
        source.delete("ns", "a");
        source.delete("ns", "missing");

        assert_eq!(events.next().await.unwrap().unwrap().kind(), "added");
        assert_eq!(events.next().await.unwrap().unwrap().kind(), "modified");
        assert_eq!(events.next().await.unwrap().unwrap(), PodEvent::Deleted(Pod::new("ns", "a")));

        let listed = source.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key(), "ns/b");
    }

    #[tokio::test]
    async fn list_error_and_broken_watch() {
        let source = MemoryPodSource::default();
        let mut events = source.watch().await.unwrap();
        source.set_list_error(Some("forbidden"));
        assert!(source.list().await.is_err());
        source.set_list_error(None);
        assert!(source.list().await.unwrap().is_empty());

        source.fail_watchers("connection reset");
        assert!(events.next().await.unwrap().is_err());
        assert!(events.next().await.is_none());
    }
}
