//! Broker configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Settings the broker needs from the client configuration.
///
/// The daemon builds this from `config.json`; defaults match the stock
/// client configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address of the h2c tunnel listener.
    pub address: SocketAddr,
    /// Desired circuit length.
    pub hops: usize,
    /// Optional relay-address whitelist; empty means unrestricted.
    pub whitelist: Vec<String>,
    /// Timeout for relay dials.
    pub timeout: Duration,
    /// Whether pofs may be spent automatically to obtain servicekeys.
    pub use_on_demand: bool,
    /// Path of the TUN helper's control socket, if the TUN forwarder is
    /// configured.
    pub tun_socket: Option<PathBuf>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            address: ([127, 0, 0, 1], 13492).into(),
            hops: 1,
            whitelist: Vec::new(),
            timeout: Duration::from_secs(5),
            use_on_demand: true,
            tun_socket: None,
        }
    }
}
