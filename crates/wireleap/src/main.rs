//! The Wireleap client daemon.
//!
//! Reads the client home directory, starts the broker and its h2c tunnel
//! listener, and supervises reload/shutdown signalling.  Subcommand
//! handling (import, status, forwarder control and so on) lives in the
//! CLI layer, which talks to this process over the REST API.

mod cfg;
mod logging;

use anyhow::Context as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use wireleap_broker::{listen_h2c, Broker};
use wireleap_fsdir::{filenames, FsDir};

use cfg::Config;

fn main() -> anyhow::Result<()> {
    let home = match std::env::var("WIRELEAP_HOME") {
        Ok(h) => std::path::PathBuf::from(h),
        Err(_) => std::env::current_dir().context("could not determine working directory")?,
    };
    let fd = FsDir::new(&home)?;
    let _log_guard = logging::setup(fd.root(), filenames::LOG)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("could not start async runtime")?;
    runtime.block_on(run(fd))
}

/// Daemon body: everything that needs the runtime.
async fn run(fd: FsDir) -> anyhow::Result<()> {
    let config = Config::load(&fd)?;
    if config.forwarders.socks.is_none() && config.broker.address.is_none() {
        anyhow::bail!(
            "both forwarders.socks and broker.address are nil in config, \
             please set one or both"
        );
    }
    let broker_config = config.broker_config(fd.root())?;
    let address = broker_config.address;

    fd.set_pid(filenames::PID)?;
    let broker = Arc::new(Broker::new(fd.clone(), broker_config)?);

    // When a contract is already imported, fetch its current state up
    // front so the DNS cache is pinned before any forwarder traffic.
    match broker.contract_url() {
        Ok(sc) => {
            info!("contract: {}", sc);
            broker
                .sync()
                .await
                .context("could not get contract info")?;
        }
        Err(_) => {
            warn!("no contract defined yet; waiting for an accesskey import");
        }
    }

    let listener = listen_h2c(Arc::clone(&broker), address).await?;

    // Reload requests arrive over a channel; the signal handler only
    // sends.
    let (reload_tx, mut reload_rx) = mpsc::channel::<()>(1);
    tokio::spawn(watch_sighup(reload_tx));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = reload_rx.recv() => {
                let new_cfg = match Config::load(&fd) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("could not reload config: {}, aborting reload", e);
                        continue;
                    }
                };
                let new_bc = match new_cfg.broker_config(fd.root()) {
                    Ok(bc) => bc,
                    Err(e) => {
                        warn!("could not reload config: {}, aborting reload", e);
                        continue;
                    }
                };
                if let Err(e) = broker.reload(new_bc).await {
                    warn!("could not refresh contract info: {}, aborting reload", e);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
        }
    }

    listener.abort();
    broker.shutdown();
    Ok(())
}

/// Forward every SIGHUP as a reload request.
async fn watch_sighup(tx: mpsc::Sender<()>) {
    let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!("could not install SIGHUP handler: {}", e);
            return;
        }
    };
    while sighup.recv().await.is_some() {
        info!("reload requested");
        // A full queue means a reload is already pending; coalesce.
        let _ = tx.try_send(());
    }
}
