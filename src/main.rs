
#![forbid(unsafe_code)]

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod alert;
mod auth;
mod config;
mod proxy;
mod route;
mod state;
mod util;

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "llmgate", version, about = "Multi-tenant OpenAI-format reverse proxy with credential rotation, cooldown and webhook alerts")]
struct Cli {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = config::Config::load(&cli.config)?;

    let worker_threads = cfg.server.worker_threads.unwrap_or_else(num_cpus::get);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(worker_threads)
        .thread_name("llmgate-worker")
        .build()?;

    rt.block_on(async move {
        let port: u16 = cfg.server.port.parse()?;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));

        let state = Arc::new(state::GateState::new(cfg));
        // Keep the watcher alive for the server's lifetime.
        let _watcher = config::watch(cli.config.clone(), state.clone())?;

        tracing::info!(%addr, "listening");
        proxy::serve_http(addr, state).await
    })
}
