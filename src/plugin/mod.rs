pub mod kubepods;
pub mod log;
pub mod prometheus;
pub mod ready;

use anyhow::Result;
use std::sync::{Arc, Mutex};
use crate::config::PluginConfig;
use crate::types::DnsMessage;

#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn from_config(config: &PluginConfig, shared: Arc<SharedState>) -> Result<Self> where Self: Sized;
    async fn process(&self, msg: &mut DnsMessage) -> Result<()>;
    async fn post_process(&self, _msg: &mut DnsMessage) -> Result<()> {
        Ok(())
    }
    /// Runs for every plugin before the chain; may register lazily evaluated metadata.
    fn metadata(&self, _msg: &mut DnsMessage) {}
    async fn startup(&self) -> Result<()> {
        Ok(())
    }
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
    fn priority(&self) -> u8;
}

pub trait Readiness: Send + Sync {
    fn ready(&self) -> bool;
}

pub struct SharedState {
    readiness: Mutex<Vec<(String, Arc<dyn Readiness>)>>,
    pub config_path: String,
}

impl SharedState {
    pub fn new(config_path: String) -> Self {
        Self { readiness: Mutex::new(Vec::new()), config_path }
    }

    pub fn register_readiness(&self, name: &str, component: Arc<dyn Readiness>) {
        if let Ok(mut list) = self.readiness.lock() {
            list.push((name.to_string(), component));
        }
    }

    /// Names of registered components that are not ready yet.
    pub fn not_ready(&self) -> Vec<String> {
        match self.readiness.lock() {
            Ok(list) => list.iter().filter(|(_, c)| !c.ready()).map(|(n, _)| n.clone()).collect(),
            Err(_) => vec!["readiness registry".to_string()],
        }
    }
}

pub fn create_plugin(config: &PluginConfig, shared: Arc<SharedState>) -> Result<Box<dyn Plugin>> {
    match config.name.as_str() {
        "kubepods" => Ok(Box::new(kubepods::KubePods::from_config(config, shared)?)),
        "prometheus" => Ok(Box::new(prometheus::PrometheusPlugin::from_config(config, shared)?)),
        "log" => Ok(Box::new(log::LogPlugin::from_config(config, shared)?)),
        "ready" => Ok(Box::new(ready::ReadyPlugin::from_config(config, shared)?)),
        _ => anyhow::bail!("Unknown plugin: {}", config.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flag(AtomicBool);
    impl Readiness for Flag {
        fn ready(&self) -> bool { self.0.load(Ordering::SeqCst) }
    }

    #[test]
    fn readiness_registry_reports_laggards() {
        let shared = SharedState::new("Corefile".to_string());
        assert!(shared.not_ready().is_empty());
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        shared.register_readiness("kubepods", flag.clone());
        assert_eq!(shared.not_ready(), vec!["kubepods".to_string()]);
        flag.0.store(true, Ordering::SeqCst);
        assert!(shared.not_ready().is_empty());
    }
}
