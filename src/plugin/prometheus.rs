use crate::plugin::{Plugin, SharedState};
use crate::config::PluginConfig;
use crate::types::DnsMessage;
use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use prometheus::{
    IntCounterVec, IntGauge, HistogramVec, GaugeVec,
    register_int_counter_vec, register_int_gauge, register_histogram_vec, register_gauge_vec,
};
use lazy_static::lazy_static;

lazy_static! {
    pub static ref DNS_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "coredns_dns_requests_total",
        "Counter of DNS requests made per zone, protocol and family.",
        &["server", "zone", "proto", "family", "type"]
    ).unwrap();

    pub static ref DNS_RESPONSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "coredns_dns_responses_total",
        "Counter of response status codes.",
        &["server", "zone", "plugin", "rcode"]
    ).unwrap();

    pub static ref DNS_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "coredns_dns_request_duration_seconds",
        "Histogram of the time (in seconds) each request took per zone.",
        &["server", "zone"],
        vec![0.00025, 0.0005, 0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 4.096, 8.192]
    ).unwrap();

    pub static ref KUBEPODS_PODS: IntGauge = register_int_gauge!(
        "coredns_kubepods_pods",
        "Number of pods in the published kubepods index snapshot."
    ).unwrap();

    pub static ref KUBEPODS_INDEX_EVENTS: IntCounterVec = register_int_counter_vec!(
        "coredns_kubepods_index_events_total",
        "Counter of changes applied to the kubepods index, by event.",
        &["event"]
    ).unwrap();

    pub static ref KUBEPODS_SOURCE_ERRORS: IntCounterVec = register_int_counter_vec!(
        "coredns_kubepods_source_errors_total",
        "Counter of pod source failures, by operation.",
        &["op"]
    ).unwrap();

    pub static ref PLUGIN_ENABLED: GaugeVec = register_gauge_vec!(
        "coredns_plugin_enabled",
        "A metric that indicates whether a plugin is enabled on per server and zone basis.",
        &["name", "server", "zone"]
    ).unwrap();

    pub static ref BUILD_INFO: GaugeVec = register_gauge_vec!(
        "coredns_build_info",
        "A metric with a constant '1' value labeled by version, revision, and rust_version from which CoreDNS was built.",
        &["rust_version", "revision", "version"]
    ).unwrap();
}

pub struct PrometheusPlugin {
    _handle: tokio::task::JoinHandle<()>,
}

#[async_trait::async_trait]
impl Plugin for PrometheusPlugin {
    fn name(&self) -> &str { "prometheus" }

    fn from_config(config: &PluginConfig, _shared: Arc<SharedState>) -> Result<Self> {
        let mut port = config.args.first().cloned().unwrap_or_else(|| ":9153".to_string());
        if !port.contains(':') { port = format!(":{}", port); }
        let addr = format!("0.0.0.0{}", port);

        let pkg_version = env!("CARGO_PKG_VERSION");
        BUILD_INFO.with_label_values(&["rustc", "kubepods", pkg_version]).set(1.0);

        let handle = tokio::spawn(async move {
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    tracing::info!("[prometheus] Successfully bound metrics listener on {}", addr);

                    while let Ok((mut stream, _)) = listener.accept().await {
                        tokio::spawn(async move {
                            // 8KB 足够容纳浏览器的完整请求头
                            let mut buf = [0u8; 8192];

                            if let Ok(Ok(n)) = tokio::time::timeout(std::time::Duration::from_secs(2), stream.read(&mut buf)).await {
                                if n > 0 && buf.starts_with(b"GET ") {
                                    use prometheus::Encoder;
                                    let encoder = prometheus::TextEncoder::new();
                                    let metric_families = prometheus::gather();
                                    let mut buffer = vec![];

                                    if encoder.encode(&metric_families, &mut buffer).is_ok() {
                                        let header = format!(
                                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                            buffer.len()
                                        );

                                        let mut response = header.into_bytes();
                                        response.extend_from_slice(&buffer);

                                        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), stream.write_all(&response)).await;
                                        let _ = stream.flush().await;
                                        // 发送 FIN，避免客户端看到 RST
                                        let _ = stream.shutdown().await;
                                    }
                                }
                            }
                        });
                    }
                }
                Err(_) => {
                    tracing::info!("[prometheus] Port {} is already active (shared with another zone).", addr);
                }
            }
        });

        Ok(Self { _handle: handle })
    }

    async fn process(&self, msg: &mut DnsMessage) -> Result<()> {
        let server_label = server_label(msg);
        let qtype = msg.question().map(|q| q.qtype.as_str()).unwrap_or("UNKNOWN");
        let family = match msg.client_addr {
            Some(std::net::SocketAddr::V6(_)) => "2",
            _ => "1",
        };

        DNS_REQUESTS_TOTAL.with_label_values(&[&server_label, &msg.zone, &msg.protocol, family, qtype]).inc();
        msg.start_time = Some(std::time::Instant::now());
        Ok(())
    }

    async fn post_process(&self, msg: &mut DnsMessage) -> Result<()> {
        let server_label = server_label(msg);

        if let Some(start) = msg.start_time {
            DNS_REQUEST_DURATION.with_label_values(&[&server_label, &msg.zone]).observe(start.elapsed().as_secs_f64());
        }

        if let Some(resp) = &msg.raw_response {
            let rcode = resp.get(3).map(|b| b & 0x0F).unwrap_or(2);
            let plugin_name = if msg.answered_by.is_empty() { "unknown" } else { &msg.answered_by };
            DNS_RESPONSES_TOTAL.with_label_values(&[&server_label, &msg.zone, plugin_name, rcode_to_str(rcode)]).inc();
        }

        Ok(())
    }

    fn priority(&self) -> u8 { 150 }
}

impl Drop for PrometheusPlugin {
    fn drop(&mut self) { self._handle.abort(); }
}

pub fn rcode_to_str(rcode: u8) -> &'static str {
    match rcode { 0 => "NOERROR", 1 => "FORMERR", 2 => "SERVFAIL", 3 => "NXDOMAIN", 4 => "NOTIMP", 5 => "REFUSED", _ => "UNKNOWN" }
}

fn server_label(msg: &DnsMessage) -> String {
    format!("dns://:{}", msg.server_port.unwrap_or(53))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rcode_names() {
        assert_eq!(rcode_to_str(0), "NOERROR");
        assert_eq!(rcode_to_str(3), "NXDOMAIN");
        assert_eq!(rcode_to_str(9), "UNKNOWN");
    }

    #[test]
    fn kubepods_metrics_are_registered() {
        KUBEPODS_INDEX_EVENTS.with_label_values(&["added"]).inc();
        let names: Vec<String> = prometheus::gather().iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.iter().any(|n| n == "coredns_kubepods_index_events_total"));
    }
}
