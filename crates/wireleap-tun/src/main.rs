//! `wireleap_tun`: the privileged TUN helper process.
//!
//! Started by the main daemon with its addressing passed through the
//! environment; running it by hand is not supported.

use anyhow::{bail, Context as _};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tun::Device;
use wireleap_fsdir::{filenames, FsDir};
use wireleap_tun::control::{serve_control, socket_path, BypassControl, HelperState};
use wireleap_tun::netsetup::{self, TunAddrs};
use wireleap_tun::splice::Engine;

/// File descriptors to ask for: one per potential NAT flow.
const NOFILE: u64 = 65535;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let debug = std::env::var("WIRELEAP_TUN_DEBUG").is_ok();
    let default_filter = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let (Ok(home), Ok(h2caddr), Ok(tunaddr)) = (
        std::env::var("WIRELEAP_HOME"),
        std::env::var("WIRELEAP_ADDR_H2C"),
        std::env::var("WIRELEAP_ADDR_TUN"),
    ) else {
        bail!(
            "Running wireleap_tun separately from wireleap is not supported. \
             Please use `wireleap tun start`."
        );
    };

    let fd = FsDir::new(&home)?;
    let addrs = TunAddrs::from_tunaddr(&tunaddr)
        .with_context(|| format!("could not parse WIRELEAP_ADDR_TUN `{}`", tunaddr))?;

    match rlimit::increase_nofile_limit(NOFILE) {
        Ok(n) => info!("increased process file limit to {}", n),
        Err(e) => bail!("could not set RLIMIT_NOFILE to {}: {}", NOFILE, e),
    }

    let mut config = tun::Configuration::default();
    #[cfg(target_os = "linux")]
    config.platform(|p| {
        p.packet_information(false);
    });
    let dev = tun::create_as_async(&config).context("could not create tun device")?;
    let name = dev
        .get_ref()
        .name()
        .context("could not get tun device name")?;

    let ctl = BypassControl::new();
    ctl.set_state(HelperState::Activating).await;

    if let Err(e) = netsetup::init(&name, &addrs).await {
        ctl.set_state(HelperState::Failed).await;
        bail!(
            "could not configure tun device {} as {}: {}",
            name,
            tunaddr,
            e
        );
    }

    // Restore the last known bypass list so a helper restart does not
    // leave the contract unreachable until the broker's next push.
    if let Some(ips) = fd.get::<Vec<IpAddr>>(filenames::BYPASS)? {
        if let Err(e) = ctl.set(ips).await {
            ctl.set_state(HelperState::Failed).await;
            bail!("could not configure routes to tun device {}: {}", name, e);
        }
    }

    fd.set_pid(filenames::TUN_PID)?;
    let socket = socket_path(fd.root());
    tokio::spawn({
        let ctl = Arc::clone(&ctl);
        let socket = socket.clone();
        async move {
            if let Err(e) = serve_control(socket, ctl).await {
                error!("control API failed: {}", e);
                std::process::exit(1);
            }
        }
    });
    ctl.set_state(HelperState::Active).await;

    let (engine, tun_rx) = Engine::new(addrs, format!("http://{}", h2caddr), debug);
    let run = tokio::spawn(engine.run(dev, tun_rx));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let outcome: anyhow::Result<()> = tokio::select! {
        r = run => match r {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(e.into()),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("terminating on interrupt");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("terminating on signal");
            Ok(())
        }
    };

    // Catch-all routes die with the device; bypass routes do not.
    ctl.set_state(HelperState::Deactivating).await;
    if let Err(e) = ctl.clear().await {
        error!("error while bringing down bypass routes: {}", e);
    }
    let _ = fd.del(filenames::TUN_PID);
    let _ = std::fs::remove_file(&socket);
    outcome
}
