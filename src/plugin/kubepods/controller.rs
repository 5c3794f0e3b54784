//! Index maintenance: list, replace, then apply watch events until the feed breaks.

use super::index::IndexWriter;
use super::source::{PodSource, PodStream};
use crate::plugin::prometheus::{KUBEPODS_INDEX_EVENTS, KUBEPODS_PODS, KUBEPODS_SOURCE_ERRORS};
use anyhow::Result;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct Controller {
    source: Arc<dyn PodSource>,
    writer: IndexWriter,
}

impl Controller {
    pub fn new(source: Arc<dyn PodSource>, writer: IndexWriter) -> Self {
        Self { source, writer }
    }

    pub fn spawn(self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    /// Runs until `stop` turns true or its sender goes away. Failures keep the last
    /// published snapshot and relist after a backoff.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = stop.changed() => break,
                res = self.list_and_watch(&mut backoff) => {
                    if let Err(e) = res {
                        tracing::warn!("[kubepods] pod source failed: {:#}; relisting in {:?}", e, backoff);
                    }
                }
            }
            tokio::select! {
                _ = stop.changed() => break,
                _ = sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        tracing::info!("[kubepods] pod controller stopped");
    }

    async fn list_and_watch(&mut self, backoff: &mut Duration) -> Result<()> {
        // 先订阅再列举，保证列举之后的变更不会丢失
        let events = self.source.watch().await.map_err(|e| {
            KUBEPODS_SOURCE_ERRORS.with_label_values(&["watch"]).inc();
            e.context("watch pods")
        })?;
        let pods = self.source.list().await.map_err(|e| {
            KUBEPODS_SOURCE_ERRORS.with_label_values(&["list"]).inc();
            e.context("list pods")
        })?;

        let count = pods.len();
        self.writer.replace(pods);
        KUBEPODS_PODS.set(self.writer.index().len() as i64);
        KUBEPODS_INDEX_EVENTS.with_label_values(&["relist"]).inc();
        tracing::info!("[kubepods] pod index synced with {} pods", count);
        *backoff = INITIAL_BACKOFF;

        let res = self.consume(events).await;
        KUBEPODS_SOURCE_ERRORS.with_label_values(&["watch"]).inc();
        res
    }

    /// Applies whatever events are already queued as one batch, one snapshot per batch.
    async fn consume(&mut self, mut events: PodStream) -> Result<()> {
        while let Some(first) = events.next().await {
            let mut batch = vec![first];
            while let Some(Some(next)) = events.next().now_or_never() {
                batch.push(next);
            }

            let mut applied = 0;
            let mut failure = None;
            for item in batch {
                match item {
                    Ok(event) => {
                        tracing::debug!("[kubepods] {} {}", event.kind(), pod_of(&event));
                        KUBEPODS_INDEX_EVENTS.with_label_values(&[event.kind()]).inc();
                        self.writer.apply(event);
                        applied += 1;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            if applied > 0 {
                self.writer.publish();
                KUBEPODS_PODS.set(self.writer.index().len() as i64);
            }
            if let Some(e) = failure {
                return Err(e.context("watch pods"));
            }
        }
        anyhow::bail!("pod watch closed")
    }
}

fn pod_of(event: &super::source::PodEvent) -> String {
    use super::source::PodEvent::*;
    match event {
        Added(pod) | Modified(pod) | Deleted(pod) => pod.key(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::kubepods::index::PodIndex;
    use crate::plugin::kubepods::source::{MemoryPodSource, Pod};

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn pod(ns: &str, name: &str, ip: &str) -> Pod {
        Pod::new(ns, name).with_ips([ip.parse().unwrap()])
    }

    #[tokio::test]
    async fn follows_list_and_watch() {
        let source = Arc::new(MemoryPodSource::new([pod("ns", "a", "10.0.0.1")]));
        let (index, writer) = PodIndex::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = Controller::new(source.clone(), writer).spawn(stop_rx);

        assert!(eventually(|| index.ready()).await);
        source.create(pod("ns", "b", "10.0.0.2"));
        source.delete("ns", "a");
        assert!(eventually(|| index.lookup_by_address("10.0.0.2").map(|p| p.len() == 1).unwrap_or(false)).await);
        assert!(eventually(|| index.lookup_by_address("10.0.0.1").map(|p| p.is_empty()).unwrap_or(false)).await);

        stop_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn broken_watch_keeps_snapshot_and_relists() {
        let source = Arc::new(MemoryPodSource::new([pod("ns", "a", "10.0.0.1")]));
        let (index, writer) = PodIndex::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = Controller::new(source.clone(), writer).spawn(stop_rx);
        assert!(eventually(|| index.ready()).await);

        source.set_list_error(Some("apiserver unavailable"));
        source.fail_watchers("connection reset");
        // 断开期间的变更只能通过重新列举拿到
        source.create(pod("ns", "late", "10.0.0.9"));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(index.lookup_by_address("10.0.0.1").unwrap().len(), 1);
        assert!(index.lookup_by_address("10.0.0.9").unwrap().is_empty());

        source.set_list_error(None);
        let relisted = eventually(|| index.lookup_by_address("10.0.0.9").map(|p| p.len() == 1).unwrap_or(false));
        assert!(tokio::time::timeout(Duration::from_secs(5), relisted).await.unwrap());

        stop_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
