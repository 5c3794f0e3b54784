use crate::plugin::{Plugin, SharedState};
use crate::config::PluginConfig;
use crate::types::DnsMessage;
use anyhow::Result;
use std::sync::Arc;

pub struct LogPlugin;

#[async_trait::async_trait]
impl Plugin for LogPlugin {
    fn name(&self) -> &str { "log" }
    fn from_config(config: &PluginConfig, _: Arc<SharedState>) -> Result<Self> {
        tracing::info!("[log] Initialized for zones: {:?}", config.zones);
        Ok(Self)
    }
    async fn process(&self, msg: &mut DnsMessage) -> Result<()> {
        let client = msg.client_addr.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string());
        match msg.question() {
            Some(q) => tracing::info!("=> [Incoming Query] TxID: {:#06x} {} {} {} from {}", msg.header.id, q.name, q.qtype.as_str(), msg.protocol, client),
            None => tracing::info!("=> [Incoming Query] TxID: {:#06x} from {}", msg.header.id, client),
        }
        // 元数据是惰性求值的，只有 debug 级别才真正读取
        if tracing::enabled!(tracing::Level::DEBUG) {
            for label in msg.metadata.labels() {
                if let Some(value) = msg.metadata.value(label) {
                    tracing::debug!("   [metadata] {} = {}", label, value);
                }
            }
        }
        Ok(())
    }
    fn priority(&self) -> u8 { 255 }
}
