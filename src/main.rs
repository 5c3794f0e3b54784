use anyhow::Result;
use chrono::Local;
use clap::Parser;
use coredns_kubepods::plugin::{self, Plugin};
use coredns_kubepods::{config, dns_server};
use rolling_file::{RollingConditionBasic, RollingFileAppender};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// 日志使用本地时间而不是默认的 UTC
struct LocalTimer;
impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "coredns-kubepods")]
#[command(about = "A DNS server that answers for Kubernetes pods", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "Corefile")]
    config: String,

    #[arg(long, default_value = "0.0.0.0:53")]
    address: String,
}

fn main() -> Result<()> {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    // 工作线程数与 CPU 核心数 1:1
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cores)
        .thread_name("coredns-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cores))
}

async fn async_main(cores: usize) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // 按本地时区每日切割，保留最近 30 份
    let file_appender = RollingFileAppender::new(
        "logs/coredns.log",
        RollingConditionBasic::new().daily(),
        30,
    )?;

    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false).with_timer(LocalTimer))
        .with(fmt::layer().with_writer(std::io::stdout).with_timer(LocalTimer))
        .init();

    let args = Args::parse();
    info!("Starting coredns-kubepods version {}", env!("CARGO_PKG_VERSION"));
    info!(">>> utilizing {} worker threads", cores);

    let abs_path = std::fs::canonicalize(&args.config)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| args.config.clone());
    info!(">>> configuration: {}", abs_path);

    let shared = Arc::new(plugin::SharedState::new(abs_path.clone()));
    let cfg = Arc::new(config::Config::load(&abs_path, shared.clone())?);
    for block in &cfg.blocks {
        info!("Server block {:?} loaded with {} plugins", block.keys, block.plugins.len());
    }

    for p in cfg.plugins() {
        p.startup().await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = dns_server::DnsServer::new(cfg.clone());
    let address = args.address.clone();
    let mut server_task = tokio::spawn(async move { server.run(&address, shutdown_rx).await });

    // 监听端口失败时 server 会提前退出
    let early = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Interrupt received, shutting down");
            None
        }
        res = &mut server_task => Some(res),
    };

    shutdown_tx.send_replace(true);
    for p in cfg.plugins() {
        if let Err(e) = p.shutdown() {
            error!("[{}] shutdown: {:#}", p.name(), e);
        }
    }
    let outcome = match early {
        Some(res) => res,
        None => server_task.await,
    };
    outcome??;
    Ok(())
}
