//! Interface addressing and kernel route management.
//!
//! All mutation goes through `ip(8)`.  The catch-all routes installed at
//! startup are strictly more specific than the default route, so the
//! default route keeps working for bypass traffic; bypass entries are
//! per-IP host routes through the pre-existing default gateway.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::process::Command;
use tracing::{debug, info};

use crate::Error;

/// The v4/v6 address pair assigned to the TUN device.
#[derive(Debug, Clone)]
pub struct TunAddrs {
    /// IPv4 side of the point-to-point /31.
    pub v4: Ipv4Addr,
    /// Peer half of the /31 (used as the spoofed source of NATted flows).
    pub peer4: Ipv4Addr,
    /// IPv6 address of the device.
    pub v6: Ipv6Addr,
    /// Peer half of the v6 /127.
    pub peer6: Ipv6Addr,
    /// Port of the TCP sink listeners.
    pub port: u16,
}

impl TunAddrs {
    /// Derive the full address plan from the configured `host:port` TUN
    /// address.
    ///
    /// The v6 address embeds the v4 octets under `fd00::/8` so the two
    /// families stay visibly paired in diagnostics.
    pub fn from_tunaddr(tunaddr: &str) -> Result<Self, Error> {
        let (host, port) = tunaddr
            .rsplit_once(':')
            .ok_or_else(|| Error::Device(format!("could not parse tun address `{}`", tunaddr)))?;
        let v4: Ipv4Addr = host
            .parse()
            .map_err(|_| Error::Device(format!("tun address `{}` is not IPv4", host)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Device(format!("could not parse tun port `{}`", port)))?;
        let o = v4.octets();
        let v6 = Ipv6Addr::new(
            0xfd00,
            0,
            0,
            0,
            0,
            0,
            u16::from(o[0]) << 8 | u16::from(o[1]),
            u16::from(o[2]) << 8 | u16::from(o[3]),
        );
        Ok(TunAddrs {
            v4,
            peer4: next_ip4(v4),
            v6,
            peer6: next_ip6(v6),
            port,
        })
    }
}

/// Return the /31 neighbor: the address with the last octet incremented.
fn next_ip4(ip: Ipv4Addr) -> Ipv4Addr {
    let mut o = ip.octets();
    o[3] = o[3].wrapping_add(1);
    Ipv4Addr::from(o)
}

/// Return the /127 neighbor of a v6 address.
fn next_ip6(ip: Ipv6Addr) -> Ipv6Addr {
    let mut o = ip.octets();
    o[15] = o[15].wrapping_add(1);
    Ipv6Addr::from(o)
}

/// Run one `ip` invocation, failing loudly on a nonzero exit.
async fn ip_cmd(args: &[&str]) -> Result<(), Error> {
    debug!("ip {}", args.join(" "));
    let out = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(Error::Io)?;
    if !out.status.success() {
        return Err(Error::IpCommand {
            args: args.join(" "),
            output: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
        });
    }
    Ok(())
}

/// Run one `ip` invocation and capture stdout.
async fn ip_cmd_output(args: &[&str]) -> Result<String, Error> {
    let out = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(Error::Io)?;
    if !out.status.success() {
        return Err(Error::IpCommand {
            args: args.join(" "),
            output: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Bring the device up with its addresses and install the catch-all
/// routes.
///
/// The three catch-alls (`0.0.0.0/1`, `128.0.0.0/1`, `2000::/3`) cover
/// all globally routable space while staying more specific than any
/// default route, so they win without clobbering it.
pub async fn init(dev: &str, addrs: &TunAddrs) -> Result<(), Error> {
    ip_cmd(&["addr", "add", &format!("{}/31", addrs.v4), "dev", dev]).await?;
    ip_cmd(&["-6", "addr", "add", &format!("{}/127", addrs.v6), "dev", dev]).await?;
    ip_cmd(&["link", "set", "dev", dev, "txqueuelen", "1000", "up"]).await?;
    for dst in ["0.0.0.0/1", "128.0.0.0/1"] {
        info!("adding catch-all route to {} via {}", dst, dev);
        ip_cmd(&["route", "replace", dst, "dev", dev]).await?;
    }
    info!("adding catch-all route to 2000::/3 via {}", dev);
    ip_cmd(&["-6", "route", "replace", "2000::/3", "dev", dev]).await?;
    Ok(())
}

/// Installed bypass routes, reverted on [`Routes::down`].
#[derive(Debug, Default)]
pub struct Routes {
    /// Route specs as handed to `ip route replace`.
    installed: Vec<(bool, String, String)>, // (is_v6, dst, gw)
}

/// Parse the gateway out of `ip route show default` output.
fn default_gateway(output: &str) -> Option<String> {
    // "default via 192.0.2.1 dev eth0 ...", possibly several; take the
    // first with a gateway.
    for line in output.lines() {
        let mut words = line.split_whitespace();
        if words.next() != Some("default") {
            continue;
        }
        if words.next() == Some("via") {
            if let Some(gw) = words.next() {
                return Some(gw.to_owned());
            }
        }
    }
    None
}

/// Install host routes to every bypass IP via the pre-existing default
/// gateway.
///
/// Loopback and unspecified addresses need no exemption and are skipped.
pub async fn routes_up(ips: &[IpAddr]) -> Result<Routes, Error> {
    let gw4 = default_gateway(&ip_cmd_output(&["route", "show", "default"]).await?);
    let gw6 = default_gateway(&ip_cmd_output(&["-6", "route", "show", "default"]).await?);
    let mut routes = Routes::default();
    for ip in ips {
        if ip.is_loopback() || ip.is_unspecified() {
            continue;
        }
        let (is_v6, dst, gw) = match ip {
            IpAddr::V4(ip) => {
                let gw = gw4.clone().ok_or(Error::NoDefaultRoute)?;
                (false, format!("{}/32", ip), gw)
            }
            IpAddr::V6(ip) => {
                // A host without v6 connectivity has no v6 default; such
                // bypass entries are unreachable anyway.
                let Some(gw) = gw6.clone() else { continue };
                (true, format!("{}/128", ip), gw)
            }
        };
        info!("adding bypass route to {} via {}", dst, gw);
        let mut args = vec!["route", "replace", dst.as_str(), "via", gw.as_str()];
        if is_v6 {
            args.insert(0, "-6");
        }
        ip_cmd(&args).await?;
        routes.installed.push((is_v6, dst, gw));
    }
    Ok(routes)
}

impl Routes {
    /// Remove every installed bypass route.
    pub async fn down(&mut self) -> Result<(), Error> {
        for (is_v6, dst, gw) in self.installed.drain(..) {
            let mut args = vec!["route", "del", dst.as_str(), "via", gw.as_str()];
            if is_v6 {
                args.insert(0, "-6");
            }
            ip_cmd(&args).await?;
        }
        Ok(())
    }
}
