use crate::plugin::{Plugin, SharedState};
use crate::config::PluginConfig;
use crate::types::DnsMessage;
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// HTTP readiness endpoint: 200 once every registered component is ready, 503 before.
pub struct ReadyPlugin {
    _handle: tokio::task::JoinHandle<()>,
}

#[async_trait::async_trait]
impl Plugin for ReadyPlugin {
    fn name(&self) -> &str { "ready" }

    fn from_config(config: &PluginConfig, shared: Arc<SharedState>) -> Result<Self> {
        let mut port = config.args.first().cloned().unwrap_or_else(|| ":8181".to_string());
        if !port.contains(':') { port = format!(":{}", port); }
        let addr = format!("0.0.0.0{}", port);

        let handle = tokio::spawn(async move {
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    tracing::info!("[ready] Successfully bound listener on {}", addr);
                    let mut buf = [0u8; 1024];
                    while let Ok((mut stream, _)) = listener.accept().await {
                        let _ = stream.read(&mut buf).await;
                        let response = render(&shared.not_ready());
                        let _ = stream.write_all(response.as_bytes()).await;
                        let _ = stream.shutdown().await;
                    }
                }
                Err(_) => {
                    // 同端口多个 server block 时只有第一个能绑定成功
                    tracing::info!("[ready] Port {} is already active (shared with another zone).", addr);
                }
            }
        });

        Ok(Self { _handle: handle })
    }

    async fn process(&self, _msg: &mut DnsMessage) -> Result<()> { Ok(()) }
    fn priority(&self) -> u8 { 10 }
}

impl Drop for ReadyPlugin {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

fn render(not_ready: &[String]) -> String {
    let (status, body) = if not_ready.is_empty() {
        ("200 OK", "OK".to_string())
    } else {
        ("503 Service Unavailable", not_ready.join(", "))
    };
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}
