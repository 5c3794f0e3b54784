use crate::config::Config;
use crate::plugin::Plugin;
use crate::types::{DnsMessage, Rcode};
use crate::wire::{self, MAX_UDP_PAYLOAD};
use crate::zones::is_subdomain;
use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

/// A zone served on a port and the server block that answers for it.
#[derive(Debug, Clone)]
pub struct Route {
    pub zone: String,
    pub block: usize,
}

pub struct DnsServer {
    config: Arc<Config>,
}

impl DnsServer {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Binds every port named by the server block keys and serves until `shutdown_rx` fires.
    pub async fn run(&self, default_address: &str, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let base_ip = default_address.rsplit_once(':').map(|(ip, _)| ip).unwrap_or("0.0.0.0");
        let default_port = default_address
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse::<u16>().ok())
            .unwrap_or(53);

        // 同一端口上可以挂多个 server block（如 a.org:53 与 b.org:53）
        let mut bind_map: HashMap<u16, Vec<Route>> = HashMap::new();
        for (block, server_block) in self.config.blocks.iter().enumerate() {
            for (zone, port) in server_block.listeners(default_port) {
                bind_map.entry(port).or_default().push(Route { zone, block });
            }
        }

        let mut tasks = Vec::new();
        for (port, routes) in bind_map {
            let bind_addr = format!("{}:{}", base_ip, port);
            let udp_socket = Arc::new(UdpSocket::bind(&bind_addr).await
                .map_err(|e| anyhow::anyhow!("Failed to bind UDP {}: {}", bind_addr, e))?);
            let tcp_listener = TcpListener::bind(&bind_addr).await
                .map_err(|e| anyhow::anyhow!("Failed to bind TCP {}: {}", bind_addr, e))?;
            tracing::info!("Server bound to TCP & UDP on {} for {} zone(s)", bind_addr, routes.len());

            let routes = Arc::new(routes);

            let config_udp = self.config.clone();
            let routes_udp = routes.clone();
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let Ok((size, src)) = udp_socket.recv_from(&mut buf).await else { continue };
                    let query = buf[..size].to_vec();
                    let config = config_udp.clone();
                    let routes = routes_udp.clone();
                    let socket = udp_socket.clone();
                    tokio::spawn(async move {
                        if let Some(resp) = handle_query(&config, &routes, &query, src, "udp", port).await {
                            let resp = if resp.len() > MAX_UDP_PAYLOAD { wire::truncate(&resp) } else { resp };
                            let _ = socket.send_to(&resp, src).await;
                        }
                    });
                }
            }));

            let config_tcp = self.config.clone();
            let routes_tcp = routes.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let Ok((mut stream, src)) = tcp_listener.accept().await else { continue };
                    let config = config_tcp.clone();
                    let routes = routes_tcp.clone();
                    tokio::spawn(async move {
                        // 一个连接上可以连续发送多个查询
                        loop {
                            let mut len_buf = [0u8; 2];
                            if stream.read_exact(&mut len_buf).await.is_err() { return; }
                            let mut query = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                            if stream.read_exact(&mut query).await.is_err() { return; }

                            let Some(resp) = handle_query(&config, &routes, &query, src, "tcp", port).await else { continue };
                            let Ok(resp_len) = u16::try_from(resp.len()) else { return };
                            if stream.write_all(&resp_len.to_be_bytes()).await.is_err() { return; }
                            if stream.write_all(&resp).await.is_err() { return; }
                        }
                    });
                }
            }));
        }

        let _ = shutdown_rx.changed().await;
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}

/// Runs one query through the chain of the best matching server block.
/// `None` means the query is dropped without a reply.
pub async fn handle_query(config: &Config, routes: &[Route], query: &[u8], src: SocketAddr, proto: &str, port: u16) -> Option<Vec<u8>> {
    let (header, question, _) = match wire::parse_query(query) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!("malformed query from {}: {}", src, e);
            return wire::encode_error(query, Rcode::FormErr);
        }
    };

    let name = question.name.to_ascii_lowercase();
    let Some(route) = routes.iter().filter(|r| is_subdomain(&r.zone, &name)).max_by_key(|r| r.zone.len()) else {
        return wire::encode_error(query, Rcode::Refused);
    };
    let plugins = &config.blocks[route.block].plugins;

    let mut msg = DnsMessage {
        header,
        questions: vec![question],
        raw_query: query.to_vec(),
        client_addr: Some(src),
        protocol: proto.to_string(),
        server_port: Some(port),
        zone: route.zone.clone(),
        ..Default::default()
    };

    for plugin in plugins {
        plugin.metadata(&mut msg);
    }
    for plugin in plugins {
        if msg.halt_chain { break; }
        if let Err(e) = plugin.process(&mut msg).await {
            tracing::error!("[{}] {}: {:#}", plugin.name(), msg.questions[0].name, e);
            if msg.write_reply(plugin.name(), Rcode::ServFail, Vec::new(), Vec::new()).is_err() {
                msg.raw_response = wire::encode_error(query, Rcode::ServFail);
                msg.halt_chain = true;
            }
        }
    }
    if msg.raw_response.is_none() {
        tracing::debug!("no plugin answered {} {}", msg.questions[0].name, msg.questions[0].qtype.as_str());
        if msg.write_reply("", Rcode::ServFail, Vec::new(), Vec::new()).is_err() {
            msg.raw_response = wire::encode_error(query, Rcode::ServFail);
        }
    }
    for plugin in plugins.iter().rev() {
        let _ = plugin.post_process(&mut msg).await;
    }

    msg.raw_response
}
