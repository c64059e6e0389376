//! Well-known file names within the client state directory.

/// Client configuration.
pub const CONFIG: &str = "config.json";
/// Cached contract metadata.
pub const CONTRACT: &str = "contract.json";
/// Cached relay directory.
pub const RELAYS: &str = "relays.json";
/// Stored proofs of funding.
pub const POFS: &str = "pofs.json";
/// The currently active servicekey.
pub const SERVICEKEY: &str = "servicekey.json";
/// Last bypass IP list published to the TUN helper.
pub const BYPASS: &str = "bypass.json";
/// Skipped-upgrade marker.
pub const UPGRADE_SKIP: &str = "upgrade-skip.json";
/// Pid file of the main daemon.
pub const PID: &str = "wireleap.pid";
/// Pid file of the TUN helper.
pub const TUN_PID: &str = "wireleap_tun.pid";
/// Pid file of the SOCKS forwarder.
pub const SOCKS_PID: &str = "wireleap_socks.pid";
/// Unix control socket of the TUN helper.
pub const TUN_SOCKET: &str = "wireleap_tun.sock";
/// Log stream of the main daemon.
pub const LOG: &str = "wireleap.log";
/// Log stream of the TUN helper.
pub const TUN_LOG: &str = "wireleap_tun.log";
/// Log stream of the SOCKS forwarder.
pub const SOCKS_LOG: &str = "wireleap_socks.log";
