#![deny(clippy::as_conversions)]
use anyhow::Context;
use opts::Opts;
use raftd::{Config, Node};
use std::io;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod opts;

fn main() -> anyhow::Result<()> {
    let opts = Opts::from_args();

    let config = Config::load(&opts.config)
        .with_context(|| format!("loading {}", opts.config.display()))?;

    init_logging(
        opts.level
            .as_deref()
            .or(config.logging.level.as_deref())
            .unwrap_or("info"),
    );

    let params = config.parameters()?;

    let mut rt = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = opts.threads.or(config.concurrency.threads) {
        rt.worker_threads(threads);
    }
    let rt = rt.enable_all().build()?;

    let node_ctrl = Node::create(rt.handle(), params)?;
    node_ctrl.install_signal_handler()?;
    info!(local_addr = %node_ctrl.local_addr(), "Node running");

    rt.block_on(node_ctrl.wait_for_shutdown());
    info!("Shutdown requested");

    node_ctrl.stop();
    rt.shutdown_timeout(Duration::from_secs(5));
    info!("Node finished");

    Ok(())
}

/// `RUST_LOG` wins over `default_filter`
fn init_logging(default_filter: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_writer(io::stderr),
        )
        .init();
}
