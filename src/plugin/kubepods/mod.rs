//! `kubepods`: synthesises A/AAAA/PTR records for pods from a live pod index.
//!
//! ```text
//! kubepods [ZONES...] {
//!     names name|ip|name-and-ip|echo-ip
//!     ttl SECONDS
//!     fallthrough [ZONES...]
//!     pods FILE [INTERVAL]
//! }
//! ```

pub mod autopath;
pub mod controller;
pub mod dashed;
pub mod file;
pub mod index;
pub mod metadata;
pub mod resolve;
pub mod response;
pub mod source;

use crate::config::{parse_duration, PluginConfig};
use crate::plugin::{Plugin, Readiness, SharedState};
use crate::types::DnsMessage;
use crate::zones::{normalize_key, Fallthrough};
use anyhow::{bail, Result};
use controller::Controller;
use index::{IndexError, IndexWriter, PodIndex};
use resolve::{Mode, Outcome, Resolver};
use response::Reply;
use source::PodSource;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const PLUGIN_NAME: &str = "kubepods";
pub const DEFAULT_TTL: u32 = 5;
pub const MAX_TTL: u32 = 3600;
pub const DEFAULT_ZONES: [&str; 2] = ["in-addr.arpa.", "ip6.arpa."];
const RESOLV_CONF: &str = "/etc/resolv.conf";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KubePodsError {
    #[error("shutdown already in progress")]
    ShutdownInProgress,
}

pub struct KubePods {
    resolver: Resolver,
    fall: Fallthrough,
    autopath_search: Vec<String>,
    source: Option<Arc<dyn PodSource>>,
    writer: Mutex<Option<IndexWriter>>,
    stop_tx: watch::Sender<bool>,
    shutdown: Mutex<bool>,
    controller: Mutex<Option<JoinHandle<()>>>,
}

impl KubePods {
    /// Zones are normalised to lower-case FQDNs; none given means the reverse pair.
    pub fn new<I, S>(zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut zones: Vec<String> = zones.into_iter().map(|z| normalize_key(z.as_ref())).collect();
        if zones.is_empty() {
            zones = DEFAULT_ZONES.iter().map(|z| z.to_string()).collect();
        }
        let (index, writer) = PodIndex::new();
        let (stop_tx, _) = watch::channel(false);
        Self {
            resolver: Resolver { zones, mode: Mode::default(), ttl: DEFAULT_TTL, index },
            fall: Fallthrough::default(),
            autopath_search: Vec::new(),
            source: None,
            writer: Mutex::new(Some(writer)),
            stop_tx,
            shutdown: Mutex::new(false),
            controller: Mutex::new(None),
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.resolver.mode = mode;
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Result<Self> {
        if ttl > MAX_TTL {
            bail!("ttl must be in range [0, {}]: {}", MAX_TTL, ttl);
        }
        self.resolver.ttl = ttl;
        Ok(self)
    }

    pub fn with_fallthrough(mut self, fall: Fallthrough) -> Self {
        self.fall = fall;
        self
    }

    pub fn with_source(mut self, source: Arc<dyn PodSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_autopath_search(mut self, search: Vec<String>) -> Self {
        self.autopath_search = search;
        self
    }

    pub fn zones(&self) -> &[String] { &self.resolver.zones }
    pub fn mode(&self) -> Mode { self.resolver.mode }
    pub fn ttl(&self) -> u32 { self.resolver.ttl }
    pub fn index(&self) -> &PodIndex { &self.resolver.index }

    /// Echo mode needs no index and is always ready.
    pub fn ready(&self) -> bool {
        self.resolver.mode == Mode::EchoIp || self.resolver.index.ready()
    }

    /// Starts the index-maintenance task. A no-op in echo mode or when already started.
    pub fn start(&self) -> Result<()> {
        if self.resolver.mode == Mode::EchoIp {
            return Ok(());
        }
        let Some(source) = self.source.clone() else {
            bail!("[{}] no pod source configured", PLUGIN_NAME);
        };
        let writer = self.writer.lock().map_err(|_| anyhow::anyhow!("[{}] writer lock poisoned", PLUGIN_NAME))?.take();
        let Some(writer) = writer else {
            return Ok(());
        };
        let handle = Controller::new(source, writer).spawn(self.stop_tx.subscribe());
        *self.controller.lock().map_err(|_| anyhow::anyhow!("[{}] controller lock poisoned", PLUGIN_NAME))? = Some(handle);
        tracing::info!("[{}] pod controller started for zones {:?} (names {})", PLUGIN_NAME, self.resolver.zones, self.resolver.mode);
        Ok(())
    }

    /// Hands the index writer to a test in place of the controller.
    #[cfg(test)]
    pub(crate) fn take_writer(&self) -> Option<IndexWriter> {
        self.writer.lock().ok()?.take()
    }

    /// Signals the controller to stop. Only the first call succeeds.
    pub fn stop(&self) -> Result<()> {
        let mut shutdown = self.shutdown.lock().map_err(|_| anyhow::anyhow!("[{}] shutdown lock poisoned", PLUGIN_NAME))?;
        if *shutdown {
            return Err(KubePodsError::ShutdownInProgress.into());
        }
        *shutdown = true;
        self.stop_tx.send_replace(true);
        Ok(())
    }

    /// Answers `msg` when its name is ours; otherwise leaves it for the next plugin.
    pub fn serve(&self, msg: &mut DnsMessage) -> Result<()> {
        let Some(question) = msg.question().cloned() else {
            return Ok(());
        };
        let zone = self.resolver.primary_zone();
        let ttl = self.resolver.ttl;

        let reply = match self.resolver.resolve(&question.name, question.qtype) {
            Ok(Outcome::OutOfScope) => return Ok(()),
            Ok(Outcome::NoData) => Reply::nodata(zone, ttl),
            Ok(Outcome::NxDomain) => {
                if self.fall.through(&question.name.to_ascii_lowercase()) {
                    return Ok(());
                }
                Reply::nxdomain(zone, ttl)
            }
            Ok(Outcome::Answer(records)) => Reply::answer(records),
            Err(e @ IndexError::NotSynced) => {
                tracing::warn!("[{}] {} {}: {}", PLUGIN_NAME, question.name, question.qtype.as_str(), e);
                Reply::servfail()
            }
            Err(e) => {
                tracing::error!("[{}] {} {}: {}", PLUGIN_NAME, question.name, question.qtype.as_str(), e);
                Reply::servfail()
            }
        };
        msg.write_reply(PLUGIN_NAME, reply.rcode, reply.answers, reply.authority)
    }

    /// Builds an instance from a `kubepods` stanza; zones default to the server block keys.
    pub fn parse_stanza(config: &PluginConfig) -> Result<Self> {
        let zones = if config.args.is_empty() { &config.zones } else { &config.args };
        let mut mode = Mode::default();
        let mut ttl = DEFAULT_TTL;
        let mut fall = Fallthrough::default();
        let mut pods: Option<(String, Option<std::time::Duration>)> = None;

        for prop in &config.block {
            match prop.name.as_str() {
                "fallthrough" => fall.set_zones_from_args(&prop.args),
                "names" => {
                    if prop.args.len() != 1 {
                        bail!("names takes exactly one argument");
                    }
                    mode = prop.args[0].parse()?;
                }
                "ttl" => {
                    let Some(arg) = prop.args.first() else {
                        bail!("ttl requires an argument");
                    };
                    let t: i64 = arg.parse().map_err(|_| anyhow::anyhow!("ttl is not an integer: '{}'", arg))?;
                    if !(0..=MAX_TTL as i64).contains(&t) {
                        bail!("ttl must be in range [0, {}]: {}", MAX_TTL, t);
                    }
                    ttl = t as u32;
                }
                "pods" => {
                    let Some(path) = prop.args.first() else {
                        bail!("pods requires a file argument");
                    };
                    let interval = prop.args.get(1).map(|s| parse_duration(s)).transpose()?;
                    pods = Some((path.clone(), interval));
                }
                other => bail!("unknown property '{}'", other),
            }
        }

        let mut kps = KubePods::new(zones).with_mode(mode).with_ttl(ttl)?.with_fallthrough(fall);
        match (pods, mode) {
            (Some(_), Mode::EchoIp) => {
                tracing::warn!("[{}] 'pods' is ignored with names echo-ip", PLUGIN_NAME);
            }
            (Some((path, interval)), _) => {
                let interval = interval.unwrap_or(file::DEFAULT_POLL_INTERVAL);
                kps = kps.with_source(Arc::new(file::FilePodSource::new(path, interval)));
            }
            (None, Mode::EchoIp) => {}
            (None, _) => bail!("a pod source ('pods FILE') is required unless names is echo-ip"),
        }
        Ok(kps)
    }
}

#[async_trait::async_trait]
impl Plugin for KubePods {
    fn name(&self) -> &str { PLUGIN_NAME }

    fn from_config(config: &PluginConfig, shared: Arc<SharedState>) -> Result<Self> {
        let search = std::fs::read_to_string(RESOLV_CONF)
            .map(|content| autopath::search_from_resolv_conf(&content))
            .unwrap_or_default();
        let kps = Self::parse_stanza(config)
            .map_err(|e| anyhow::anyhow!("plugin/{}: {}", PLUGIN_NAME, e))?
            .with_autopath_search(search);

        if kps.mode() != Mode::EchoIp {
            shared.register_readiness(PLUGIN_NAME, Arc::new(kps.index().clone()));
        }
        tracing::info!("[{}] Initialized for zones {:?} (names {}, ttl {})", PLUGIN_NAME, kps.zones(), kps.mode(), kps.ttl());
        Ok(kps)
    }

    async fn process(&self, msg: &mut DnsMessage) -> Result<()> {
        self.serve(msg)
    }

    fn metadata(&self, msg: &mut DnsMessage) {
        if let Some(ip) = msg.client_ip() {
            self.export_metadata(&mut msg.metadata, ip);
        }
    }

    async fn startup(&self) -> Result<()> {
        self.start()
    }

    fn shutdown(&self) -> Result<()> {
        self.stop()
    }

    fn priority(&self) -> u8 { 90 }
}

impl Readiness for PodIndex {
    fn ready(&self) -> bool {
        PodIndex::ready(self)
    }
}

impl Drop for KubePods {
    fn drop(&mut self) {
        if let Ok(handle) = self.controller.get_mut() {
            if let Some(handle) = handle.take() {
                handle.abort();
            }
        }
    }
}
