//! `wireleap_socks`: the standalone SOCKSv5 forwarder process.
//!
//! Started by the main daemon with its addressing passed through the
//! environment; running it by hand is not supported.

use anyhow::{bail, Context as _};
use tracing_subscriber::EnvFilter;
use wireleap_fsdir::{filenames, FsDir};
use wireleap_socks::forwarder::listen_socks;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let Ok(h2caddr) = std::env::var("WIRELEAP_ADDR_H2C") else {
        bail!("WIRELEAP_ADDR_H2C is not defined");
    };
    let Ok(socksaddr) = std::env::var("WIRELEAP_ADDR_SOCKS") else {
        bail!("WIRELEAP_ADDR_SOCKS is not defined");
    };
    let socksaddr = socksaddr
        .parse()
        .with_context(|| format!("could not parse WIRELEAP_ADDR_SOCKS `{}`", socksaddr))?;

    // Record our pid next to the rest of the client state when we know
    // where that is.
    if let Ok(home) = std::env::var("WIRELEAP_HOME") {
        let fd = FsDir::new(home)?;
        fd.set_pid(filenames::SOCKS_PID)?;
    }

    listen_socks(socksaddr, format!("http://{}", h2caddr))
        .await
        .with_context(|| format!("listening on socks5://{} failed", socksaddr))?;
    Ok(())
}
