//! Live pod index: four lookup views over one immutable snapshot.
//!
//! Readers load the current snapshot without taking a lock. The single [`IndexWriter`]
//! owns a working copy, applies changes to it and publishes a fresh snapshot per batch,
//! so a reader sees either all of an update or none of it.

use super::dashed::dash_ip;
use super::source::{pod_key, Pod, PodEvent};
use arc_swap::{ArcSwap, Guard};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("pod index has not completed its initial sync")]
    NotSynced,
    #[error("{view} index entry for '{key}' does not resolve to a pod")]
    Integrity { view: &'static str, key: String },
}

type View = HashMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, Default)]
struct Snapshot {
    pods: HashMap<String, Arc<Pod>>,
    reverse: View,
    namespace: View,
    dashed_ip: View,
}

impl Snapshot {
    fn insert(&mut self, pod: Pod) {
        let key = pod.key();
        self.remove(&key);
        for ip in &pod.ips {
            let literal = ip.to_string();
            self.dashed_ip.entry(format!("{}/{}", pod.namespace, dash_ip(&literal))).or_default().insert(key.clone());
            self.reverse.entry(literal).or_default().insert(key.clone());
        }
        self.namespace.entry(pod.namespace.clone()).or_default().insert(key.clone());
        self.pods.insert(key, Arc::new(pod));
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some(old) = self.pods.remove(key) else { return false };
        for ip in &old.ips {
            let literal = ip.to_string();
            unlink(&mut self.dashed_ip, &format!("{}/{}", old.namespace, dash_ip(&literal)), key);
            unlink(&mut self.reverse, &literal, key);
        }
        unlink(&mut self.namespace, &old.namespace, key);
        true
    }

    fn resolve(&self, view: &'static str, keys: Option<&BTreeSet<String>>) -> Result<Vec<Arc<Pod>>, IndexError> {
        keys.into_iter()
            .flatten()
            .map(|key| {
                self.pods
                    .get(key)
                    .cloned()
                    .ok_or_else(|| IndexError::Integrity { view, key: key.clone() })
            })
            .collect()
    }
}

fn unlink(view: &mut View, index_key: &str, key: &str) {
    if let Some(keys) = view.get_mut(index_key) {
        keys.remove(key);
        if keys.is_empty() {
            view.remove(index_key);
        }
    }
}

/// Read handle on the live index. Cheap to clone; every clone sees the same snapshots.
#[derive(Debug, Clone)]
pub struct PodIndex {
    snapshot: Arc<ArcSwap<Snapshot>>,
    synced: Arc<AtomicBool>,
}

impl PodIndex {
    /// An empty, unsynced index and the only handle allowed to change it.
    pub fn new() -> (PodIndex, IndexWriter) {
        let index = PodIndex {
            snapshot: Arc::new(ArcSwap::from_pointee(Snapshot::default())),
            synced: Arc::new(AtomicBool::new(false)),
        };
        let writer = IndexWriter { index: index.clone(), working: Snapshot::default() };
        (index, writer)
    }

    /// True once a full list has been applied.
    pub fn ready(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Pods in the published snapshot.
    pub fn len(&self) -> usize {
        self.snapshot.load().pods.len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn current(&self) -> Result<Guard<Arc<Snapshot>>, IndexError> {
        if !self.ready() {
            return Err(IndexError::NotSynced);
        }
        Ok(self.snapshot.load())
    }

    pub fn lookup_by_address(&self, ip: &str) -> Result<Vec<Arc<Pod>>, IndexError> {
        let snap = self.current()?;
        snap.resolve("reverse", snap.reverse.get(ip))
    }

    pub fn lookup_by_namespace(&self, namespace: &str) -> Result<Vec<Arc<Pod>>, IndexError> {
        let snap = self.current()?;
        snap.resolve("namespace", snap.namespace.get(namespace))
    }

    pub fn lookup_by_key(&self, namespace: &str, name: &str) -> Result<Option<Arc<Pod>>, IndexError> {
        Ok(self.current()?.pods.get(&pod_key(namespace, name)).cloned())
    }

    pub fn lookup_by_namespace_dashed_ip(&self, namespace: &str, dashed: &str) -> Result<Vec<Arc<Pod>>, IndexError> {
        let snap = self.current()?;
        snap.resolve("dashedip", snap.dashed_ip.get(&format!("{}/{}", namespace, dashed)))
    }
}

/// Sole mutation path into a [`PodIndex`].
#[derive(Debug)]
pub struct IndexWriter {
    index: PodIndex,
    working: Snapshot,
}

impl IndexWriter {
    /// Replaces the whole content with a fresh list, publishes it and marks the index synced.
    pub fn replace<I: IntoIterator<Item = Pod>>(&mut self, pods: I) {
        self.working = Snapshot::default();
        for pod in pods {
            self.working.insert(pod);
        }
        self.publish();
        self.index.synced.store(true, Ordering::Release);
    }

    /// Applies one change to the working copy. Nothing is visible until [`publish`](Self::publish).
    pub fn apply(&mut self, event: PodEvent) {
        match event {
            PodEvent::Added(pod) | PodEvent::Modified(pod) => self.working.insert(pod),
            PodEvent::Deleted(pod) => {
                self.working.remove(&pod.key());
            }
        }
    }

    pub fn publish(&mut self) {
        self.index.snapshot.store(Arc::new(self.working.clone()));
    }

    pub fn index(&self) -> &PodIndex { &self.index }

    #[cfg(test)]
    pub(crate) fn corrupt_reverse(&mut self, ip: &str, key: &str) {
        self.working.reverse.entry(ip.to_string()).or_default().insert(key.to_string());
        self.publish();
    }
}
