//! The client configuration file format and data types.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use wireleap_broker::BrokerConfig;
use wireleap_fsdir::filenames;

/// The `config.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Config {
    /// Listening address of the REST/status API (served elsewhere).
    pub(crate) address: Option<SocketAddr>,
    /// Broker settings.
    pub(crate) broker: BrokerSection,
    /// Forwarder settings.
    pub(crate) forwarders: ForwardersSection,
}

/// The `broker` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct BrokerSection {
    /// h2c listening address of the broker.
    pub(crate) address: Option<SocketAddr>,
    /// Relay dial timeout, in seconds.
    pub(crate) timeout: u64,
    /// Accesskey handling.
    pub(crate) accesskey: AccesskeySection,
    /// Circuit construction settings.
    pub(crate) circuit: CircuitSection,
}

/// The `broker.accesskey` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct AccesskeySection {
    /// Whether pofs are spent automatically to obtain servicekeys.
    pub(crate) use_on_demand: bool,
}

/// The `broker.circuit` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct CircuitSection {
    /// Optional list of relay addresses to use exclusively.
    pub(crate) whitelist: Vec<String>,
    /// Desired number of hops.
    pub(crate) hops: usize,
}

/// The `forwarders` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ForwardersSection {
    /// SOCKSv5 TCP and UDP listening address.
    pub(crate) socks: Option<SocketAddr>,
    /// TUN device address (`host:port`, not loopback).
    pub(crate) tun: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address: Some(([127, 0, 0, 1], 13492).into()),
            broker: BrokerSection::default(),
            forwarders: ForwardersSection::default(),
        }
    }
}

impl Default for BrokerSection {
    fn default() -> Self {
        BrokerSection {
            address: Some(([127, 0, 0, 1], 13492).into()),
            timeout: 5,
            accesskey: AccesskeySection::default(),
            circuit: CircuitSection::default(),
        }
    }
}

impl Default for AccesskeySection {
    fn default() -> Self {
        AccesskeySection {
            use_on_demand: true,
        }
    }
}

impl Default for CircuitSection {
    fn default() -> Self {
        CircuitSection {
            whitelist: Vec::new(),
            hops: 1,
        }
    }
}

impl Default for ForwardersSection {
    fn default() -> Self {
        ForwardersSection {
            socks: Some(([127, 0, 0, 1], 13491).into()),
            tun: Some("10.13.49.0:13493".into()),
        }
    }
}

impl Config {
    /// Load `config.json` from `fd`, falling back to defaults for a
    /// missing file or missing fields.
    pub(crate) fn load(fd: &wireleap_fsdir::FsDir) -> Result<Self, wireleap_fsdir::Error> {
        Ok(fd.get(filenames::CONFIG)?.unwrap_or_default())
    }

    /// Derive the broker's configuration.
    ///
    /// `home` is needed to locate the TUN helper's control socket when
    /// the TUN forwarder is configured.
    pub(crate) fn broker_config(&self, home: &Path) -> anyhow::Result<BrokerConfig> {
        let address = match self.broker.address {
            Some(a) => a,
            None => anyhow::bail!(
                "both forwarders.socks and broker.address are nil in config, \
                 please set one or both"
            ),
        };
        Ok(BrokerConfig {
            address,
            hops: self.broker.circuit.hops,
            whitelist: self.broker.circuit.whitelist.clone(),
            timeout: Duration::from_secs(self.broker.timeout),
            use_on_demand: self.broker.accesskey.use_on_demand,
            tun_socket: self
                .forwarders
                .tun
                .as_ref()
                .map(|_| home.join(filenames::TUN_SOCKET)),
        })
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use wireleap_fsdir::FsDir;

    #[test]
    fn defaults_match_stock_config() {
        let c = Config::default();
        assert_eq!(c.broker.circuit.hops, 1);
        assert_eq!(c.broker.timeout, 5);
        assert!(c.broker.accesskey.use_on_demand);
        assert_eq!(
            c.forwarders.socks,
            Some(([127, 0, 0, 1], 13491).into())
        );
    }

    #[test]
    fn partial_config_fills_in() {
        let dir = tempfile::TempDir::new().unwrap();
        let fd = FsDir::new(dir.path()).unwrap();
        std::fs::write(
            fd.path(filenames::CONFIG),
            r#"{ "broker": { "circuit": { "hops": 3 } } }"#,
        )
        .unwrap();
        let c = Config::load(&fd).unwrap();
        assert_eq!(c.broker.circuit.hops, 3);
        assert_eq!(c.broker.timeout, 5);
        let bc = c.broker_config(dir.path()).unwrap();
        assert_eq!(bc.hops, 3);
        assert!(bc.tun_socket.is_some());
    }

    #[test]
    fn missing_broker_address_is_fatal() {
        let mut c = Config::default();
        c.broker.address = None;
        assert!(c.broker_config(Path::new("/tmp")).is_err());
    }
}
